//! Seams to the networks of an instruct-pix2pix latent diffusion model.
//!
//! The networks themselves (text encoder, autoencoder and U-Net) are provided by the caller
//! through these traits; a [`Loader`] builds them from checkpoint weights.

use std::sync::Arc;

use candle_core::{DType, Device, Result, Tensor};
use pix2pix_rs_common::StateDict;

/// What an edit is conditioned on.
#[derive(Debug, Clone)]
pub struct Conditioning {
    /// Text embedding, attended to by the U-Net.
    pub c_crossattn: Tensor,
    /// Image latent, concatenated to the noisy latent along the channel dimension.
    pub c_concat: Tensor,
}

impl Conditioning {
    pub fn new(c_crossattn: Tensor, c_concat: Tensor) -> Self {
        Self {
            c_crossattn,
            c_concat,
        }
    }

    /// The "no guidance" baseline for `cond`: the given empty-prompt embedding and an all-zero
    /// image latent. The unconditional image is always zero.
    pub fn unconditional(null_crossattn: Tensor, cond: &Conditioning) -> Result<Self> {
        Ok(Self {
            c_crossattn: null_crossattn,
            c_concat: cond.c_concat.zeros_like()?,
        })
    }
}

pub trait TextEncoder: Send + Sync {
    /// Embed each prompt; the embeddings are stacked along the batch dimension.
    fn encode(&self, prompts: &[&str]) -> Result<Tensor>;
}

/// The first stage (autoencoder) of a latent diffusion model.
pub trait FirstStage: Send + Sync {
    /// Encode pixels in `[-1, 1]`, shaped `(b, 3, h, w)`, into latents `(b, c, h/8, w/8)`.
    ///
    /// Returns the mode of the latent distribution, with any latent scaling already applied.
    fn encode(&self, xs: &Tensor) -> Result<Tensor>;

    /// Inverse of [`FirstStage::encode`]. The output is nominally in `[-1, 1]`.
    fn decode(&self, zs: &Tensor) -> Result<Tensor>;
}

/// The noise-predicting network.
pub trait EpsModel: Send + Sync {
    /// Predict the noise in `xs` at the (fractional) training timesteps `t`, one per batch
    /// element. Implementations concatenate `cond.c_concat` to `xs` along the channel dimension.
    fn apply_model(&self, xs: &Tensor, t: &Tensor, cond: &Conditioning) -> Result<Tensor>;
}

/// The networks of one loaded model.
#[derive(Clone)]
pub struct EditModel {
    pub text_encoder: Arc<dyn TextEncoder>,
    pub first_stage: Arc<dyn FirstStage>,
    pub unet: Arc<dyn EpsModel>,
    pub device: Device,
    pub dtype: DType,
}

/// Builds an [`EditModel`] from checkpoint weights.
pub trait Loader {
    fn name(&self) -> &'static str;

    /// Weight names the model reads, used to report missing and unexpected checkpoint keys.
    fn expected_keys(&self) -> Option<Vec<String>> {
        None
    }

    fn load_from_state_dict(
        &self,
        state_dict: StateDict,
        device: &Device,
        dtype: DType,
    ) -> anyhow::Result<EditModel>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconditional_image_is_zero() -> Result<()> {
        let dev = Device::Cpu;
        let cond = Conditioning::new(
            Tensor::ones((1, 4, 8), DType::F32, &dev)?,
            Tensor::ones((1, 4, 2, 3), DType::F32, &dev)?,
        );
        let uncond = Conditioning::unconditional(Tensor::zeros((1, 4, 8), DType::F32, &dev)?, &cond)?;

        assert_eq!(uncond.c_concat.dims(), cond.c_concat.dims());
        assert_eq!(uncond.c_concat.sum_all()?.to_scalar::<f32>()?, 0.);
        Ok(())
    }
}
