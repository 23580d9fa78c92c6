//! Segmenter adapter: prompt-conditioned masks with the whole-image fallback.

use image::{Rgb, RgbImage};
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::ObjectSegmenter;
use crate::types::{Mask, ObjectCrop, Point};

/// Detection and text-match thresholds handed to the segmentation model
#[derive(Debug, Clone, Copy)]
pub struct SegmentThresholds {
    pub box_threshold: f32,
    pub text_threshold: f32,
}

impl Default for SegmentThresholds {
    fn default() -> Self {
        Self {
            box_threshold: 0.3,
            text_threshold: 0.25,
        }
    }
}

/// Segment one frame.
///
/// The first returned mask is used. It is replaced by an all-foreground mask
/// when it is empty, or when `contact` is given and falls on background.
pub fn segment_frame(
    segmenter: &dyn ObjectSegmenter,
    image: &RgbImage,
    prompt: &str,
    contact: Option<Point>,
    thresholds: SegmentThresholds,
) -> Result<ObjectCrop> {
    let masks = segmenter.segment(
        image,
        prompt,
        thresholds.box_threshold,
        thresholds.text_threshold,
    )?;
    let detected = masks
        .into_iter()
        .next()
        .unwrap_or_else(|| Mask::empty(image.width(), image.height()));

    let mask = apply_fallback(detected, contact, image.width(), image.height());
    let masked_image = apply_mask(image, &mask);
    Ok(ObjectCrop { masked_image, mask })
}

/// Segment a sequence of frames, each paired with its own contact point
pub fn segment_frames<'a>(
    segmenter: &dyn ObjectSegmenter,
    frames: impl IntoIterator<Item = (&'a RgbImage, Option<Point>)>,
    prompt: &str,
    thresholds: SegmentThresholds,
) -> Result<Vec<ObjectCrop>> {
    frames
        .into_iter()
        .map(|(image, contact)| segment_frame(segmenter, image, prompt, contact, thresholds))
        .collect()
}

/// All-ones substitution for failed detections
pub fn apply_fallback(mask: Mask, contact: Option<Point>, width: u32, height: u32) -> Mask {
    if mask.width != width || mask.height != height {
        warn!(
            "Mask is {}x{} but image is {}x{}; using whole image",
            mask.width, mask.height, width, height
        );
        return Mask::full(width, height);
    }
    if mask.is_empty() {
        debug!("No object detected; using whole image");
        return Mask::full(width, height);
    }
    if let Some([x, y]) = contact {
        // Pixel index truncates toward zero, so -0.5 lands on column 0.
        let (px, py) = (x.trunc() as i64, y.trunc() as i64);
        let inside = px >= 0 && py >= 0 && mask.get(px as u32, py as u32);
        if !inside {
            debug!("Contact point ({x}, {y}) is outside the mask; using whole image");
            return Mask::full(width, height);
        }
    }
    mask
}

/// `image * mask + 255 * (1 - mask)`: background painted white
pub fn apply_mask(image: &RgbImage, mask: &Mask) -> RgbImage {
    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        if mask.get(x, y) {
            *image.get_pixel(x, y)
        } else {
            Rgb([255, 255, 255])
        }
    })
}
