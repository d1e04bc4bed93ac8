#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use candle_core::{DType, Device, Result, Tensor};
use image::{DynamicImage, Rgb, RgbImage};
use pix2pix_rs_core::{
    Conditioning, DiscreteSchedule, EditModel, EpsModel, FirstStage, Pipeline, TextEncoder,
};

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Embeds every prompt as a `(1, 2, 4)` block filled with its length.
pub struct LengthEncoder;

impl TextEncoder for LengthEncoder {
    fn encode(&self, prompts: &[&str]) -> Result<Tensor> {
        let embeddings = prompts
            .iter()
            .map(|p| Tensor::full(p.len() as f32, (1, 2, 4), &Device::Cpu))
            .collect::<Result<Vec<_>>>()?;
        Tensor::cat(&embeddings, 0)
    }
}

/// Averages 8x8 pixel blocks into 3-channel latents and upsamples them back.
pub struct BlockAutoencoder;

impl FirstStage for BlockAutoencoder {
    fn encode(&self, xs: &Tensor) -> Result<Tensor> {
        xs.avg_pool2d(8)
    }

    fn decode(&self, zs: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = zs.dims4()?;
        zs.upsample_nearest2d(h * 8, w * 8)
    }
}

pub enum Behaviour {
    /// Predicts exactly the noise separating the input from `c_concat`, so every branch denoises
    /// to its image conditioning.
    Reconstruct(DiscreteSchedule),
    /// Predicts the scaled input itself.
    Echo,
}

/// Records the batch size of each call.
pub struct MockUnet {
    behaviour: Behaviour,
    pub calls: Mutex<Vec<usize>>,
}

impl MockUnet {
    pub fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<usize> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl EpsModel for MockUnet {
    fn apply_model(&self, xs: &Tensor, t: &Tensor, cond: &Conditioning) -> Result<Tensor> {
        let b_sz = xs.dim(0)?;
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(b_sz);
        }
        match &self.behaviour {
            Behaviour::Echo => Ok(xs.clone()),
            Behaviour::Reconstruct(schedule) => {
                let sigmas = t
                    .to_vec1::<f32>()?
                    .into_iter()
                    .map(|t| schedule.t_to_sigma(t as f64) as f32)
                    .collect::<Vec<_>>();
                let sigma = Tensor::from_vec(sigmas, (b_sz, 1, 1, 1), xs.device())?;
                let x = xs.broadcast_mul(&(sigma.sqr()? + 1.)?.sqrt()?)?;
                (x - &cond.c_concat)?.broadcast_div(&sigma)
            }
        }
    }
}

pub fn mock_model(unet: Arc<MockUnet>) -> EditModel {
    EditModel {
        text_encoder: Arc::new(LengthEncoder),
        first_stage: Arc::new(BlockAutoencoder),
        unet,
        device: Device::Cpu,
        dtype: DType::F32,
    }
}

pub fn mock_pipeline(unet: Arc<MockUnet>) -> anyhow::Result<Pipeline> {
    Ok(Pipeline::new(
        mock_model(unet),
        DiscreteSchedule::stable_diffusion_v1()?,
        true,
    ))
}

/// A smooth test card: red grows left to right, green top to bottom.
pub fn gradient(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            128,
        ])
    }))
}
