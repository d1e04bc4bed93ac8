mod auto_dtype;
mod noise;
mod pixels;

pub use auto_dtype::{ModelDType, TryIntoDType};
pub use noise::{draw_seed, randn, randn_like, seeded_rng, DRAWN_SEED_BOUND};
pub use pixels::{
    edit_dimensions, image_to_tensor, resize_for_edit, tensor_to_image, MAX_RESOLUTION,
    SIDE_MULTIPLE,
};
