//! Core crate for instruction-guided image editing with pix2pix_rs.
//!
//! A [`Pipeline`] conditions a latent diffusion model on a source image and an edit instruction,
//! and samples with separate text and image guidance scales. The networks come from a
//! [`Loader`]; checkpoints are retrieved and cached through a [`CheckpointSource`].
//!
//! ```rust,no_run
//! use std::time::Instant;
//!
//! use pix2pix_rs_core::{CheckpointSource, EditParams, EditRequest, Loader, ModelDType, Predictor};
//!
//! # fn my_loader() -> Box<dyn Loader> { unimplemented!() }
//! let predictor = Predictor::setup(
//!     &CheckpointSource::from_bucket_url(
//!         "https://my-bucket.s3.eu-west-2.amazonaws.com/model_assets",
//!         "instruct-pix2pix-00-22000.ckpt",
//!     )?,
//!     None,
//!     my_loader().as_ref(),
//!     &ModelDType::Auto,
//!     EditParams::new(512, 100, 7.5, 1.5, Some(42))?,
//!     false,
//! )?;
//!
//! let start = Instant::now();
//!
//! let output = predictor.predict(&EditRequest {
//!     input: "https://example.com/mountain.jpg".to_string(),
//!     edit: "turn it into a winter scene".to_string(),
//! })?;
//!
//! let end = Instant::now();
//! println!("Took: {:.2}s, seed {}", end.duration_since(start).as_secs_f32(), output.seed);
//!
//! output.image.save("edited.png")?;
//!
//! # Ok::<(), anyhow::Error>(())
//! ```

mod error;
mod models;
mod pipelines;
mod predictor;
mod util;

pub use error::EditError;
pub use models::{Conditioning, EditModel, EpsModel, FirstStage, Loader, TextEncoder};
pub use pipelines::{
    ancestral_step, tripled_conditioning, CfgDenoiser, CompVisDenoiser, Denoiser,
    DiscreteSchedule, EditOutput, EditParams, Pipeline, Sampler, ALPHAS_CUMPROD_KEY,
};
pub use pix2pix_rs_common::{
    ArtifactStore, CheckpointCache, CheckpointSource, HttpStore, HubStore, LocalStore, StateDict,
    TokenSource,
};
pub use predictor::{fetch_image, EditRequest, Predictor};
pub use util::{
    draw_seed, edit_dimensions, image_to_tensor, randn, randn_like, resize_for_edit, seeded_rng,
    tensor_to_image, ModelDType, TryIntoDType, DRAWN_SEED_BOUND, MAX_RESOLUTION, SIDE_MULTIPLE,
};
