use candle_core::{Result, Tensor};

use super::denoiser::Denoiser;
use crate::models::Conditioning;

/// Lay out `cond` and `uncond` for a single batched denoiser call.
///
/// The text embeddings are `[cond, uncond, uncond]` and the image latents `[cond, cond, uncond]`,
/// so the three outputs are: fully conditioned, image-only conditioned, unconditioned.
pub fn tripled_conditioning(cond: &Conditioning, uncond: &Conditioning) -> Result<Conditioning> {
    Ok(Conditioning {
        c_crossattn: Tensor::cat(
            &[&cond.c_crossattn, &uncond.c_crossattn, &uncond.c_crossattn],
            0,
        )?,
        c_concat: Tensor::cat(&[&cond.c_concat, &cond.c_concat, &uncond.c_concat], 0)?,
    })
}

/// Classifier-free guidance with separate text and image scales.
///
/// ```text
/// out = uncond + text_scale * (cond - img_cond) + image_scale * (img_cond - uncond)
/// ```
pub struct CfgDenoiser<D> {
    inner: D,
}

impl<D: Denoiser> CfgDenoiser<D> {
    pub fn new(inner: D) -> Self {
        Self { inner }
    }

    /// Guide one latent, shaped `(1, c, h, w)`. `sigma` has a single element.
    ///
    /// Runs the inner denoiser exactly once, on a batch of three.
    pub fn forward(
        &self,
        z: &Tensor,
        sigma: &Tensor,
        cond: &Conditioning,
        uncond: &Conditioning,
        text_cfg_scale: f64,
        image_cfg_scale: f64,
    ) -> Result<Tensor> {
        if z.dim(0)? != 1 || sigma.elem_count() != 1 {
            candle_core::bail!(
                "guidance expects a single latent and sigma, got latent {:?} and sigma {:?}",
                z.shape(),
                sigma.shape()
            );
        }
        let cfg_z = Tensor::cat(&[z, z, z], 0)?;
        let sigma = sigma.flatten_all()?;
        let cfg_sigma = Tensor::cat(&[&sigma, &sigma, &sigma], 0)?;
        let cfg_cond = tripled_conditioning(cond, uncond)?;

        let out = self.inner.denoise(&cfg_z, &cfg_sigma, &cfg_cond)?;
        if out.dims() != cfg_z.dims() {
            candle_core::bail!(
                "denoiser returned {:?} for a batch shaped {:?}",
                out.shape(),
                cfg_z.shape()
            );
        }
        let out_cond = out.narrow(0, 0, 1)?;
        let out_img_cond = out.narrow(0, 1, 1)?;
        let out_uncond = out.narrow(0, 2, 1)?;

        let text = ((&out_cond - &out_img_cond)? * text_cfg_scale)?;
        let image = ((&out_img_cond - &out_uncond)? * image_cfg_scale)?;
        (out_uncond + text)? + image
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use candle_core::{DType, Device};

    use super::*;

    /// Returns 3, 2 and 1 for the three batch rows and records what it was called with.
    #[derive(Default)]
    struct Branches {
        calls: RefCell<Vec<Conditioning>>,
    }

    impl Denoiser for Branches {
        fn denoise(&self, xs: &Tensor, _sigma: &Tensor, cond: &Conditioning) -> Result<Tensor> {
            self.calls.borrow_mut().push(cond.clone());
            let rows = Tensor::new(&[3f32, 2., 1.], xs.device())?.reshape((3, 1, 1, 1))?;
            rows.broadcast_as(xs.shape())?.contiguous()
        }
    }

    fn setup() -> Result<(Tensor, Tensor, Conditioning, Conditioning)> {
        let dev = Device::Cpu;
        let z = Tensor::zeros((1, 4, 2, 2), DType::F32, &dev)?;
        let sigma = Tensor::new(&[1f32], &dev)?;
        let cond = Conditioning::new(
            Tensor::full(1f32, (1, 2, 3), &dev)?,
            Tensor::full(5f32, (1, 4, 2, 2), &dev)?,
        );
        let uncond = Conditioning::unconditional(Tensor::full(-1f32, (1, 2, 3), &dev)?, &cond)?;
        Ok((z, sigma, cond, uncond))
    }

    fn values(t: &Tensor) -> Result<Vec<f32>> {
        t.flatten_all()?.to_vec1()
    }

    #[test]
    fn combines_branches() -> Result<()> {
        let (z, sigma, cond, uncond) = setup()?;
        let cfg = CfgDenoiser::new(Branches::default());

        // Both scales zero: the unconditioned branch.
        let out = cfg.forward(&z, &sigma, &cond, &uncond, 0., 0.)?;
        assert_eq!(out.dims(), z.dims());
        assert!(values(&out)?.iter().all(|v| *v == 1.));

        // Only image guidance at 1: the image-conditioned branch.
        let out = cfg.forward(&z, &sigma, &cond, &uncond, 0., 1.)?;
        assert!(values(&out)?.iter().all(|v| *v == 2.));

        // Only text guidance at 1: cond - img_cond + uncond.
        let out = cfg.forward(&z, &sigma, &cond, &uncond, 1., 0.)?;
        assert!(values(&out)?.iter().all(|v| *v == 2.));

        // Text at 1, image at 1: the fully conditioned branch.
        let out = cfg.forward(&z, &sigma, &cond, &uncond, 1., 1.)?;
        assert!(values(&out)?.iter().all(|v| *v == 3.));

        // 1 + 7.5 * (3 - 2) + 1.5 * (2 - 1)
        let out = cfg.forward(&z, &sigma, &cond, &uncond, 7.5, 1.5)?;
        assert!(values(&out)?.iter().all(|v| (*v - 10.).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn single_call_with_expected_layout() -> Result<()> {
        let (z, sigma, cond, uncond) = setup()?;
        let cfg = CfgDenoiser::new(Branches::default());
        cfg.forward(&z, &sigma, &cond, &uncond, 7.5, 1.5)?;

        let calls = cfg.inner.calls.borrow();
        assert_eq!(calls.len(), 1);
        let seen = &calls[0];
        assert_eq!(seen.c_crossattn.dims(), &[3, 2, 3]);
        assert_eq!(seen.c_concat.dims(), &[3, 4, 2, 2]);

        let text_rows = seen.c_crossattn.mean((1, 2))?.to_vec1::<f32>()?;
        assert_eq!(text_rows, vec![1., -1., -1.]);
        let image_rows = seen.c_concat.mean((1, 2, 3))?.to_vec1::<f32>()?;
        assert_eq!(image_rows, vec![5., 5., 0.]);
        Ok(())
    }

    #[test]
    fn rejects_batches() -> Result<()> {
        let (_, sigma, cond, uncond) = setup()?;
        let z = Tensor::zeros((2, 4, 2, 2), DType::F32, &Device::Cpu)?;
        let cfg = CfgDenoiser::new(Branches::default());

        assert!(cfg.forward(&z, &sigma, &cond, &uncond, 7.5, 1.5).is_err());
        assert!(cfg.inner.calls.borrow().is_empty());
        Ok(())
    }
}
