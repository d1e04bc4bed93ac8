use candle_core::{DType, Device, Result, Shape, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Seeds drawn when a request leaves the seed unset lie in `0..DRAWN_SEED_BOUND`.
pub const DRAWN_SEED_BOUND: u64 = 100_000;

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn draw_seed<R: Rng + ?Sized>(rng: &mut R) -> u64 {
    rng.gen_range(0..DRAWN_SEED_BOUND)
}

/// Standard normal noise drawn on the host from `rng`, so results only depend on the seed.
pub fn randn<S: Into<Shape>, R: Rng + ?Sized>(
    shape: S,
    dtype: DType,
    device: &Device,
    rng: &mut R,
) -> Result<Tensor> {
    let shape = shape.into();
    let data = (0..shape.elem_count())
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect::<Vec<_>>();
    Tensor::from_vec(data, shape, &Device::Cpu)?
        .to_dtype(dtype)?
        .to_device(device)
}

pub fn randn_like<R: Rng + ?Sized>(xs: &Tensor, rng: &mut R) -> Result<Tensor> {
    randn(xs.shape().clone(), xs.dtype(), xs.device(), rng)
}
