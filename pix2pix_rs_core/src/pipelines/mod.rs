mod denoiser;
mod guidance;
mod sampling;
mod scheduler;

use std::sync::{Arc, Mutex};

use anyhow::Result;
use candle_core::{Device, Tensor};
use image::DynamicImage;
use pix2pix_rs_common::{CheckpointSource, StateDict};
use serde::Deserialize;
use tracing::{debug, info, warn};

pub use denoiser::{CompVisDenoiser, Denoiser};
pub use guidance::{tripled_conditioning, CfgDenoiser};
pub use sampling::{ancestral_step, Sampler};
pub use scheduler::{DiscreteSchedule, ALPHAS_CUMPROD_KEY};

use crate::{
    models::{Conditioning, EditModel, Loader},
    util::{
        draw_seed, image_to_tensor, randn_like, resize_for_edit, seeded_rng, tensor_to_image,
        MAX_RESOLUTION, SIDE_MULTIPLE,
    },
    EditError, TryIntoDType,
};

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawEditParams {
    resolution: u32,
    steps: usize,
    #[serde(alias = "cfg_text")]
    text_cfg_scale: f64,
    #[serde(alias = "cfg_image")]
    image_cfg_scale: f64,
    seed: Option<u64>,
}

impl Default for RawEditParams {
    fn default() -> Self {
        Self {
            resolution: 512,
            steps: 100,
            text_cfg_scale: 7.5,
            image_cfg_scale: 1.5,
            seed: None,
        }
    }
}

/// Parameters of one edit. Validated on construction and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawEditParams")]
pub struct EditParams {
    resolution: u32,
    steps: usize,
    text_cfg_scale: f64,
    image_cfg_scale: f64,
    seed: Option<u64>,
}

impl TryFrom<RawEditParams> for EditParams {
    type Error = EditError;

    fn try_from(raw: RawEditParams) -> Result<Self, Self::Error> {
        Self::new(
            raw.resolution,
            raw.steps,
            raw.text_cfg_scale,
            raw.image_cfg_scale,
            raw.seed,
        )
    }
}

impl Default for EditParams {
    /// Resolution 512, 100 steps, text scale 7.5, image scale 1.5 and a random seed.
    fn default() -> Self {
        let RawEditParams {
            resolution,
            steps,
            text_cfg_scale,
            image_cfg_scale,
            seed,
        } = RawEditParams::default();
        Self {
            resolution,
            steps,
            text_cfg_scale,
            image_cfg_scale,
            seed,
        }
    }
}

impl EditParams {
    /// - `resolution`: target size of the longer side, between 64 and [`MAX_RESOLUTION`].
    /// - `steps`: number of sampler steps, at least 1. Each step runs the U-Net once on a batch of 3.
    /// - `text_cfg_scale`: how strongly the edit follows the instruction.
    /// - `image_cfg_scale`: how strongly the edit stays close to the source image.
    /// - `seed`: drawn at random when `None`.
    pub fn new(
        resolution: u32,
        steps: usize,
        text_cfg_scale: f64,
        image_cfg_scale: f64,
        seed: Option<u64>,
    ) -> Result<Self, EditError> {
        if !(SIDE_MULTIPLE..=MAX_RESOLUTION).contains(&resolution) {
            return Err(EditError::InvalidParams(format!(
                "resolution must be between {SIDE_MULTIPLE} and {MAX_RESOLUTION}, got {resolution}"
            )));
        }
        if steps == 0 {
            return Err(EditError::InvalidParams(
                "steps must be at least 1".to_string(),
            ));
        }
        for (name, scale) in [
            ("text_cfg_scale", text_cfg_scale),
            ("image_cfg_scale", image_cfg_scale),
        ] {
            if !scale.is_finite() || scale < 0. {
                return Err(EditError::InvalidParams(format!(
                    "{name} must be finite and non-negative, got {scale}"
                )));
            }
        }
        Ok(Self {
            resolution,
            steps,
            text_cfg_scale,
            image_cfg_scale,
            seed,
        })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn text_cfg_scale(&self) -> f64 {
        self.text_cfg_scale
    }

    pub fn image_cfg_scale(&self) -> f64 {
        self.image_cfg_scale
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }
}

/// An edited image and the seed that reproduces it.
#[derive(Debug, Clone)]
pub struct EditOutput {
    pub image: DynamicImage,
    pub seed: u64,
}

pub struct Pipeline {
    model: Arc<Mutex<EditModel>>,
    schedule: DiscreteSchedule,
    sampler: Sampler,
    silent: bool,
}

impl Pipeline {
    /// Load a pipeline from a checkpoint.
    ///
    /// - `vae`: replaces the checkpoint's first-stage weights when set.
    /// - `loader`: builds the networks from the loaded weights.
    /// - `silent`: hide progress bars and most logging.
    pub fn load(
        checkpoint: &CheckpointSource,
        vae: Option<&CheckpointSource>,
        loader: &dyn Loader,
        silent: bool,
        dtype: &dyn TryIntoDType,
    ) -> Result<Self> {
        #[cfg(not(feature = "metal"))]
        let device = Device::cuda_if_available(0)?;
        #[cfg(feature = "metal")]
        let device = Device::new_metal(0)?;

        if !silent {
            info!("loading `{}` from {checkpoint}.", loader.name());
        }
        let mut state_dict = StateDict::load(checkpoint.resolve()?, &device, silent)?;
        if let Some(vae) = vae {
            if !silent {
                info!("overriding first stage weights from {vae}.");
            }
            let vae = StateDict::load(vae.resolve()?, &device, silent)?;
            state_dict = state_dict.with_vae_override(&vae)?;
        }

        if let Some(expected) = loader.expected_keys() {
            let report = state_dict.key_report(expected.as_slice());
            if !report.missing.is_empty() {
                warn!(
                    "checkpoint is missing {} weights: {:?}",
                    report.missing.len(),
                    report.missing
                );
            }
            if !report.unexpected.is_empty() {
                warn!(
                    "checkpoint has {} unexpected weights: {:?}",
                    report.unexpected.len(),
                    report.unexpected
                );
            }
        }

        let schedule = DiscreteSchedule::from_state_dict(&state_dict)?;
        let dtype = dtype.try_into_dtype(&[&device], silent)?;
        let model = loader.load_from_state_dict(state_dict.to_dtype(dtype)?, &device, dtype)?;

        Ok(Self::new(model, schedule, silent))
    }

    pub fn new(model: EditModel, schedule: DiscreteSchedule, silent: bool) -> Self {
        Self {
            model: Arc::new(Mutex::new(model)),
            schedule,
            sampler: Sampler::default(),
            silent,
        }
    }

    /// Replace the default Euler ancestral sampler.
    pub fn with_sampler(mut self, sampler: Sampler) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn schedule(&self) -> &DiscreteSchedule {
        &self.schedule
    }

    /// Edit `image` following `instruction`.
    ///
    /// Concurrent calls are serialized.
    pub fn edit(
        &self,
        image: &DynamicImage,
        instruction: &str,
        params: &EditParams,
    ) -> Result<EditOutput> {
        let seed = params
            .seed()
            .unwrap_or_else(|| draw_seed(&mut rand::thread_rng()));
        if !self.silent {
            info!("editing with seed {seed}.");
        }

        let model = self.lock_model()?;
        let latents = self.sample(&model, image, instruction, params, seed)?;
        let decoded = model.first_stage.decode(&latents)?;
        let image = tensor_to_image(&decoded)?;

        Ok(EditOutput {
            image: DynamicImage::ImageRgb8(image),
            seed,
        })
    }

    /// Run an edit up to, but not including, decoding. Returns the final latent.
    pub fn edit_latents(
        &self,
        image: &DynamicImage,
        instruction: &str,
        params: &EditParams,
        seed: u64,
    ) -> Result<Tensor> {
        let model = self.lock_model()?;
        self.sample(&model, image, instruction, params, seed)
    }

    fn lock_model(&self) -> Result<std::sync::MutexGuard<'_, EditModel>> {
        self.model
            .lock()
            .map_err(|_| anyhow::Error::msg("model lock poisoned by a failed edit"))
    }

    fn sample(
        &self,
        model: &EditModel,
        image: &DynamicImage,
        instruction: &str,
        params: &EditParams,
        seed: u64,
    ) -> Result<Tensor> {
        let input = resize_for_edit(image, params.resolution())?;
        debug!(
            "resized {}x{} source to {}x{}.",
            image.width(),
            image.height(),
            input.width(),
            input.height()
        );

        let pixels = image_to_tensor(&input, &model.device, model.dtype)?;
        let cond = Conditioning::new(
            model.text_encoder.encode(&[instruction])?,
            model.first_stage.encode(&pixels)?,
        );
        let uncond = Conditioning::unconditional(model.text_encoder.encode(&[""])?, &cond)?;

        let sigmas = self.schedule.sigmas(params.steps());
        let mut rng = seeded_rng(seed);
        let z = (randn_like(&cond.c_concat, &mut rng)? * sigmas[0])?;

        let denoiser =
            CfgDenoiser::new(CompVisDenoiser::new(model.unet.as_ref(), &self.schedule));
        let latents = self
            .sampler
            .sample(&sigmas, &z, &mut rng, self.silent, |z, sigma| {
                denoiser.forward(
                    z,
                    sigma,
                    &cond,
                    &uncond,
                    params.text_cfg_scale(),
                    params.image_cfg_scale(),
                )
            })?;
        Ok(latents)
    }
}
