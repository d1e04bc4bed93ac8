use candle_core::{DType, Device, Result, Tensor};
use image::{imageops::FilterType, DynamicImage, RgbImage};

use crate::EditError;

/// Both sides of an edited image are multiples of this, so the latent is `1/8` of a multiple of 8.
pub const SIDE_MULTIPLE: u32 = 64;

/// Largest accepted edit resolution.
pub const MAX_RESOLUTION: u32 = 8192;

/// Dimensions an image of `width` x `height` is edited at.
///
/// The longer side is scaled to roughly `resolution`, the scale is then nudged up so the shorter
/// side lands on a multiple of 64, and the longer side is rounded down to a multiple of 64. Aspect
/// ratio is preserved as closely as that allows. Computed exactly in integers.
pub fn edit_dimensions(
    width: u32,
    height: u32,
    resolution: u32,
) -> std::result::Result<(u32, u32), EditError> {
    let invalid = EditError::InvalidDimensions {
        width,
        height,
        resolution,
    };
    if width == 0 || height == 0 || resolution == 0 {
        return Err(invalid);
    }
    let (shorter, longer) = (width.min(height) as u128, width.max(height) as u128);
    let multiple = SIDE_MULTIPLE as u128;

    // Multiples of 64 on the shorter side: ceil(shorter * resolution / longer / 64).
    let steps = (shorter * resolution as u128).div_ceil(longer * multiple);
    let new_shorter = steps * multiple;
    let new_longer = longer * steps / shorter * multiple;

    let (Ok(new_shorter), Ok(new_longer)) = (u32::try_from(new_shorter), u32::try_from(new_longer))
    else {
        return Err(invalid);
    };
    if width <= height {
        Ok((new_shorter, new_longer))
    } else {
        Ok((new_longer, new_shorter))
    }
}

/// Scale and center-crop `image` to [`edit_dimensions`] with a Lanczos filter.
pub fn resize_for_edit(
    image: &DynamicImage,
    resolution: u32,
) -> std::result::Result<RgbImage, EditError> {
    let (width, height) = edit_dimensions(image.width(), image.height(), resolution)?;
    Ok(image
        .resize_to_fill(width, height, FilterType::Lanczos3)
        .to_rgb8())
}

/// `(1, 3, h, w)` pixels in `[-1, 1]`.
pub fn image_to_tensor(image: &RgbImage, device: &Device, dtype: DType) -> Result<Tensor> {
    let (w, h) = image.dimensions();
    Tensor::from_vec(image.as_raw().clone(), (h as usize, w as usize, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .unsqueeze(0)?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .to_dtype(dtype)?
        .to_device(device)
}

/// Inverse of [`image_to_tensor`] for a single image; values outside `[-1, 1]` are clamped.
pub fn tensor_to_image(xs: &Tensor) -> Result<RgbImage> {
    let (b, c, h, w) = xs.dims4()?;
    if b != 1 || c != 3 {
        candle_core::bail!("expected a single RGB image, got {:?}", xs.shape());
    }
    let pixels = xs
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .affine(0.5, 0.5)?
        .clamp(0f32, 1f32)?
        .affine(255., 0.)?
        .to_dtype(DType::U8)?
        .squeeze(0)?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_vec1::<u8>()?;
    #[allow(clippy::cast_possible_truncation)]
    RgbImage::from_raw(w as u32, h as u32, pixels).ok_or(candle_core::Error::Msg(
        "RgbImage has invalid capacity.".to_string(),
    ))
}
