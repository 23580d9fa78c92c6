//! Image preprocessing for the segmentation, CLIP and feature models.

use anyhow::Result;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use tracing::debug;

/// Input side length of the segmentation model
pub const SAM_INPUT_SIZE: u32 = 1024;

/// Input side length of the CLIP vision tower
pub const CLIP_INPUT_SIZE: u32 = 224;

/// CLIP normalization parameters
const CLIP_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
const CLIP_STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];

/// Preprocess image for the segmentation model (1024x1024)
///
/// # Returns
///
/// Array of shape [1, 3, 1024, 1024] with values in [0, 1]
pub fn preprocess_for_sam2(image: &RgbImage) -> Result<Array4<f32>> {
    debug!(
        "Preprocessing image for segmentation: {}x{}",
        image.width(),
        image.height()
    );

    let resized = image::imageops::resize(image, SAM_INPUT_SIZE, SAM_INPUT_SIZE, FilterType::Lanczos3);
    let size = SAM_INPUT_SIZE as usize;
    let mut array = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, pixel) in resized.enumerate_pixels() {
        let x = x as usize;
        let y = y as usize;
        for c in 0..3 {
            array[[0, c, y, x]] = pixel[c] as f32 / 255.0;
        }
    }

    Ok(array)
}

/// Preprocess image for CLIP model (224x224)
///
/// # Returns
///
/// Array of shape [1, 3, 224, 224] with CLIP-normalized values
pub fn preprocess_for_clip(image: &RgbImage) -> Result<Array4<f32>> {
    debug!(
        "Preprocessing image for CLIP: {}x{}",
        image.width(),
        image.height()
    );

    let resized = image::imageops::resize(image, CLIP_INPUT_SIZE, CLIP_INPUT_SIZE, FilterType::Lanczos3);
    let size = CLIP_INPUT_SIZE as usize;
    let mut array = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, pixel) in resized.enumerate_pixels() {
        let x = x as usize;
        let y = y as usize;
        for c in 0..3 {
            array[[0, c, y, x]] = (pixel[c] as f32 / 255.0 - CLIP_MEAN[c]) / CLIP_STD[c];
        }
    }

    Ok(array)
}

/// Preprocess image for the dense feature extractor
///
/// Diffusion backbones take pixels scaled to [-1, 1].
pub fn preprocess_for_featurizer(image: &RgbImage, size: u32) -> Result<Array4<f32>> {
    debug!(
        "Preprocessing image for featurizer: {}x{} -> {}",
        image.width(),
        image.height(),
        size
    );

    let resized = image::imageops::resize(image, size, size, FilterType::Triangle);
    let side = size as usize;
    let mut array = Array4::<f32>::zeros((1, 3, side, side));

    for (x, y, pixel) in resized.enumerate_pixels() {
        let x = x as usize;
        let y = y as usize;
        for c in 0..3 {
            array[[0, c, y, x]] = pixel[c] as f32 / 127.5 - 1.0;
        }
    }

    Ok(array)
}
