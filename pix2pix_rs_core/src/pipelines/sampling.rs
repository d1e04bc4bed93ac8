use candle_core::{Result, Tensor};
use pix2pix_rs_common::IterWithProgress;
use rand::Rng;

use crate::util::randn_like;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sampler {
    /// Deterministic Euler steps.
    Euler,
    /// Euler steps that overshoot to `sigma_down` and re-inject fresh noise of size `sigma_up`.
    EulerAncestral { eta: f64, s_noise: f64 },
}

impl Default for Sampler {
    fn default() -> Self {
        Self::EulerAncestral {
            eta: 1.,
            s_noise: 1.,
        }
    }
}

/// Split the step from `sigma_from` to `sigma_to` into a deterministic part down to `sigma_down`
/// and fresh noise of size `sigma_up`, with `sigma_down^2 + sigma_up^2 = sigma_to^2`.
pub fn ancestral_step(sigma_from: f64, sigma_to: f64, eta: f64) -> (f64, f64) {
    if eta == 0. || sigma_from == 0. {
        return (sigma_to, 0.);
    }
    let sigma_up = (eta
        * (sigma_to.powi(2) * (sigma_from.powi(2) - sigma_to.powi(2)) / sigma_from.powi(2)).sqrt())
    .min(sigma_to);
    let sigma_down = (sigma_to.powi(2) - sigma_up.powi(2)).max(0.).sqrt();
    (sigma_down, sigma_up)
}

impl Sampler {
    /// Run the denoising process over `sigmas.len() - 1` steps, starting from `xs`.
    ///
    /// Expects a denoise closure returning the predicted clean latent:
    /// ```ignore
    /// fn(xs: &Tensor, sigma: &Tensor) -> Result<Tensor>;
    /// ```
    pub fn sample<R: Rng + ?Sized>(
        &self,
        sigmas: &[f64],
        xs: &Tensor,
        rng: &mut R,
        silent: bool,
        mut denoise: impl FnMut(&Tensor, &Tensor) -> Result<Tensor>,
    ) -> Result<Tensor> {
        let b_sz = xs.dim(0)?;
        let s_in = Tensor::ones(b_sz, xs.dtype(), xs.device())?;
        let mut xs = xs.clone();
        for window in sigmas.windows(2).with_progress("Denoise loop", silent) {
            let (sigma, sigma_next) = match window {
                [a, b] => (*a, *b),
                _ => continue,
            };
            let denoised = denoise(&xs, &(&s_in * sigma)?)?;
            let d = ((&xs - &denoised)? / sigma)?;
            xs = match self {
                Self::Euler => (xs + (d * (sigma_next - sigma))?)?,
                Self::EulerAncestral { eta, s_noise } => {
                    let (sigma_down, sigma_up) = ancestral_step(sigma, sigma_next, *eta);
                    let xs = (xs + (d * (sigma_down - sigma))?)?;
                    if sigma_next > 0. {
                        let noise = randn_like(&xs, rng)?;
                        (xs + (noise * (s_noise * sigma_up))?)?
                    } else {
                        xs
                    }
                }
            };
        }
        Ok(xs)
    }
}
