use candle_core::{DType, Device, Result, Tensor};
use pix2pix_rs_common::StateDict;

/// State dict buffer holding the training noise schedule of a latent diffusion checkpoint.
pub const ALPHAS_CUMPROD_KEY: &str = "alphas_cumprod";

/// The discrete noise levels a CompVis latent diffusion model was trained on.
///
/// Timestep `t` in `[0, T - 1]` maps to `sigma_t = sqrt((1 - alpha_bar_t) / alpha_bar_t)`; fractional
/// timesteps interpolate linearly in log-sigma.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscreteSchedule {
    log_sigmas: Vec<f64>,
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => vec![],
        1 => vec![start],
        _ => (0..n)
            .map(|i| start + (end - start) * i as f64 / (n - 1) as f64)
            .collect(),
    }
}

impl DiscreteSchedule {
    pub fn from_alphas_cumprod(alphas_cumprod: &[f64]) -> Result<Self> {
        if alphas_cumprod.len() < 2 {
            candle_core::bail!("a noise schedule needs at least two timesteps");
        }
        if let Some(bad) = alphas_cumprod.iter().find(|a| !(**a > 0. && **a <= 1.)) {
            candle_core::bail!("cumulative alpha {bad} is outside (0, 1]");
        }
        Ok(Self {
            log_sigmas: alphas_cumprod
                .iter()
                .map(|a| ((1. - a) / a).sqrt().ln())
                .collect(),
        })
    }

    /// Betas linear in their square root from `beta_start` to `beta_end`.
    pub fn scaled_linear(num_train_timesteps: usize, beta_start: f64, beta_end: f64) -> Result<Self> {
        let mut alpha_bar = 1.;
        let alphas_cumprod = linspace(beta_start.sqrt(), beta_end.sqrt(), num_train_timesteps)
            .into_iter()
            .map(|beta| {
                alpha_bar *= 1. - beta * beta;
                alpha_bar
            })
            .collect::<Vec<_>>();
        Self::from_alphas_cumprod(&alphas_cumprod)
    }

    /// The schedule of Stable Diffusion 1.x, which instruct-pix2pix inherits.
    pub fn stable_diffusion_v1() -> Result<Self> {
        Self::scaled_linear(1000, 0.00085, 0.012)
    }

    /// Read the schedule buffer from a checkpoint, falling back to the Stable Diffusion 1.x schedule.
    pub fn from_state_dict(state_dict: &StateDict) -> Result<Self> {
        match state_dict.get(ALPHAS_CUMPROD_KEY) {
            Some(alphas) => {
                Self::from_alphas_cumprod(&alphas.to_dtype(DType::F64)?.flatten_all()?.to_vec1()?)
            }
            None => Self::stable_diffusion_v1(),
        }
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.log_sigmas.len()
    }

    pub fn sigma_min(&self) -> f64 {
        self.log_sigmas[0].exp()
    }

    pub fn sigma_max(&self) -> f64 {
        self.log_sigmas[self.log_sigmas.len() - 1].exp()
    }

    /// `steps + 1` noise levels evenly spaced in timestep from `sigma_max` down, with a final zero.
    pub fn sigmas(&self, steps: usize) -> Vec<f64> {
        let t_max = (self.num_train_timesteps() - 1) as f64;
        let mut sigmas = linspace(t_max, 0., steps)
            .into_iter()
            .map(|t| self.t_to_sigma(t))
            .collect::<Vec<_>>();
        sigmas.push(0.);
        sigmas
    }

    pub fn t_to_sigma(&self, t: f64) -> f64 {
        let t = t.clamp(0., (self.num_train_timesteps() - 1) as f64);
        let (low, high) = (t.floor() as usize, t.ceil() as usize);
        let w = t - t.floor();
        ((1. - w) * self.log_sigmas[low] + w * self.log_sigmas[high]).exp()
    }

    /// Inverse of [`DiscreteSchedule::t_to_sigma`], clamped to the trained range.
    pub fn sigma_to_t_scalar(&self, sigma: f64) -> f64 {
        let log_sigma = sigma.ln();
        let n = self.num_train_timesteps();
        let low = self
            .log_sigmas
            .iter()
            .take_while(|ls| **ls <= log_sigma)
            .count()
            .saturating_sub(1)
            .min(n - 2);
        let high = low + 1;
        let (lo, hi) = (self.log_sigmas[low], self.log_sigmas[high]);
        let w = ((lo - log_sigma) / (lo - hi)).clamp(0., 1.);
        (1. - w) * low as f64 + w * high as f64
    }

    /// Per-element [`DiscreteSchedule::sigma_to_t_scalar`] on a `(b,)` sigma tensor; returns `f32`.
    pub fn sigma_to_t(&self, sigma: &Tensor) -> Result<Tensor> {
        let ts = sigma
            .to_dtype(DType::F64)?
            .flatten_all()?
            .to_vec1::<f64>()?
            .into_iter()
            .map(|s| self.sigma_to_t_scalar(s) as f32)
            .collect::<Vec<_>>();
        Tensor::from_vec(ts, sigma.dims(), &Device::Cpu)?.to_device(sigma.device())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_diffusion_range() -> Result<()> {
        let schedule = DiscreteSchedule::stable_diffusion_v1()?;
        assert_eq!(schedule.num_train_timesteps(), 1000);
        assert!((schedule.sigma_max() - 14.6146).abs() < 1e-3);
        assert!((schedule.sigma_min() - 0.0292).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn sigmas_descend_to_zero() -> Result<()> {
        let schedule = DiscreteSchedule::stable_diffusion_v1()?;
        let sigmas = schedule.sigmas(100);

        assert_eq!(sigmas.len(), 101);
        assert!((sigmas[0] - schedule.sigma_max()).abs() < 1e-9);
        assert!((sigmas[99] - schedule.sigma_min()).abs() < 1e-9);
        assert_eq!(sigmas[100], 0.);
        assert!(sigmas.windows(2).all(|w| w[0] > w[1]));
        Ok(())
    }

    #[test]
    fn sigma_and_t_round_trip() -> Result<()> {
        let schedule = DiscreteSchedule::stable_diffusion_v1()?;
        for t in [0., 1., 10.5, 250.25, 998.9, 999.] {
            let round_trip = schedule.sigma_to_t_scalar(schedule.t_to_sigma(t));
            assert!((round_trip - t).abs() < 1e-6, "{t} -> {round_trip}");
        }
        // Out of range sigmas clamp to the ends of the schedule.
        assert_eq!(schedule.sigma_to_t_scalar(1e-6), 0.);
        assert_eq!(schedule.sigma_to_t_scalar(1e3), 999.);
        Ok(())
    }

    #[test]
    fn sigma_to_t_is_elementwise() -> Result<()> {
        let schedule = DiscreteSchedule::stable_diffusion_v1()?;
        let sigmas = [schedule.t_to_sigma(999.), schedule.t_to_sigma(500.)];
        let sigma = Tensor::new(&[sigmas[0] as f32, sigmas[1] as f32], &Device::Cpu)?;

        let t = schedule.sigma_to_t(&sigma)?.to_vec1::<f32>()?;
        assert!((t[0] - 999.).abs() < 1e-2);
        assert!((t[1] - 500.).abs() < 1e-2);
        Ok(())
    }

    #[test]
    fn reads_schedule_from_checkpoint() -> Result<()> {
        let alphas = Tensor::new(&[0.9f32, 0.5, 0.1], &Device::Cpu)?;
        let state_dict = StateDict::from_tensors([(ALPHAS_CUMPROD_KEY.to_string(), alphas)].into());
        let schedule = DiscreteSchedule::from_state_dict(&state_dict)?;

        assert_eq!(schedule.num_train_timesteps(), 3);
        assert!((schedule.sigma_max() - 3.).abs() < 1e-5);
        assert_eq!(
            DiscreteSchedule::from_state_dict(&StateDict::default())?,
            DiscreteSchedule::stable_diffusion_v1()?
        );
        Ok(())
    }

    #[test]
    fn rejects_degenerate_schedules() {
        assert!(DiscreteSchedule::from_alphas_cumprod(&[0.5]).is_err());
        assert!(DiscreteSchedule::from_alphas_cumprod(&[0.5, 0.]).is_err());
    }
}
