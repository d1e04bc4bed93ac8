use candle_core::{Result, Tensor};

use super::scheduler::DiscreteSchedule;
use crate::models::{Conditioning, EpsModel};

/// Predicts the clean latent from a noisy one at noise level `sigma` (one per batch element).
pub trait Denoiser {
    fn denoise(&self, xs: &Tensor, sigma: &Tensor, cond: &Conditioning) -> Result<Tensor>;
}

/// Wraps a discrete-time eps-prediction model so it can be driven in continuous sigma.
///
/// The input is scaled by `c_in = 1 / sqrt(sigma^2 + 1)`, sigma is mapped back to a fractional
/// training timestep, and the predicted noise is removed: `denoised = x - sigma * eps`.
pub struct CompVisDenoiser<'a, M: EpsModel + ?Sized> {
    model: &'a M,
    schedule: &'a DiscreteSchedule,
}

impl<'a, M: EpsModel + ?Sized> CompVisDenoiser<'a, M> {
    pub fn new(model: &'a M, schedule: &'a DiscreteSchedule) -> Self {
        Self { model, schedule }
    }
}

impl<M: EpsModel + ?Sized> Denoiser for CompVisDenoiser<'_, M> {
    fn denoise(&self, xs: &Tensor, sigma: &Tensor, cond: &Conditioning) -> Result<Tensor> {
        let b_sz = xs.dim(0)?;
        let sigma_b = sigma.to_dtype(xs.dtype())?.reshape((b_sz, 1, 1, 1))?;
        let c_in = (sigma_b.sqr()? + 1.)?.sqrt()?.recip()?;

        let t = self.schedule.sigma_to_t(sigma)?;
        let eps = self
            .model
            .apply_model(&xs.broadcast_mul(&c_in)?, &t, cond)?;
        xs - eps.broadcast_mul(&sigma_b)?
    }
}
