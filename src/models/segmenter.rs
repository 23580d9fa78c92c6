//! Text-prompted object segmentation via ONNX Runtime.
//!
//! Expects a single exported graph combining an open-vocabulary box
//! detector with a SAM mask head:
//!
//! * inputs: `image` `[1, 3, 1024, 1024]`, `input_ids` `[1, 77]`
//! * outputs: `box_scores` `[N]`, `text_scores` `[N]`, `masks` `[N, h, w]`
//!   (mask logits, positive = foreground), ordered by detection score.

use anyhow::{bail, Context, Result};
use image::RgbImage;
use ndarray::ArrayView2;
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;
use tracing::debug;

use super::preprocessing::preprocess_for_sam2;
use super::tokenizer::ClipTokenizer;
use super::{load_session, ObjectSegmenter};
use crate::types::Mask;

pub struct GroundedSegmenter {
    session: Session,
    tokenizer: ClipTokenizer,
}

impl GroundedSegmenter {
    /// Create a new segmenter from an ONNX file and its prompt vocabulary
    ///
    /// # Example
    ///
    /// ```ignore
    /// let seg = GroundedSegmenter::new(
    ///     Path::new("models/grounded_sam.onnx"),
    ///     Path::new("models/clip_vocab.json"),
    /// )?;
    /// ```
    pub fn new(model_path: &Path, vocab_path: &Path) -> Result<Self> {
        let session = load_session(model_path).context("Failed to load segmentation model")?;
        let tokenizer = ClipTokenizer::from_file(vocab_path)?;
        Ok(Self { session, tokenizer })
    }
}

impl ObjectSegmenter for GroundedSegmenter {
    fn segment(
        &self,
        image: &RgbImage,
        prompt: &str,
        box_threshold: f32,
        text_threshold: f32,
    ) -> Result<Vec<Mask>> {
        let pixels = preprocess_for_sam2(image)?;
        let input_ids = self.tokenizer.encode(prompt);
        debug!(
            "Running segmentation for {:?} on image of shape {:?}",
            prompt,
            pixels.shape()
        );

        let outputs = self
            .session
            .run(ort::inputs![
                "image" => Tensor::from_array(pixels)?,
                "input_ids" => Tensor::from_array(input_ids)?,
            ]?)
            .context("Segmentation inference failed")?;

        let box_scores = outputs["box_scores"].try_extract_tensor::<f32>()?;
        let text_scores = outputs["text_scores"].try_extract_tensor::<f32>()?;
        let masks = outputs["masks"].try_extract_tensor::<f32>()?;
        let masks = masks
            .into_dimensionality::<ndarray::Ix3>()
            .context("Expected masks of shape [N, h, w]")?;

        if box_scores.len() != masks.shape()[0] || text_scores.len() != masks.shape()[0] {
            bail!(
                "Segmentation outputs disagree: {} box scores, {} text scores, {} masks",
                box_scores.len(),
                text_scores.len(),
                masks.shape()[0]
            );
        }

        let kept: Vec<Mask> = box_scores
            .iter()
            .zip(text_scores.iter())
            .enumerate()
            .filter(|(_, (&b, &t))| b > box_threshold && t > text_threshold)
            .map(|(i, _)| {
                resize_mask_logits(masks.index_axis(ndarray::Axis(0), i), image.width(), image.height())
            })
            .collect();

        debug!("Detected {} object(s) above thresholds", kept.len());
        Ok(kept)
    }
}

/// Nearest-neighbour resample of mask logits to `width` x `height`
pub(crate) fn resize_mask_logits(logits: ArrayView2<f32>, width: u32, height: u32) -> Mask {
    let (src_h, src_w) = (logits.shape()[0], logits.shape()[1]);
    let mut data = Vec::with_capacity((width * height) as usize);
    for y in 0..height as usize {
        let sy = (y * src_h / height as usize).min(src_h.saturating_sub(1));
        for x in 0..width as usize {
            let sx = (x * src_w / width as usize).min(src_w.saturating_sub(1));
            data.push(logits[[sy, sx]] > 0.0);
        }
    }
    Mask::new(width, height, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_model_creation_fails_with_missing_file() {
        let result = GroundedSegmenter::new(
            Path::new("nonexistent_model.onnx"),
            Path::new("nonexistent_vocab.json"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_resize_mask_logits_upsamples() {
        let logits = array![[1.0f32, -1.0], [-1.0, 2.0]];
        let mask = resize_mask_logits(logits.view(), 4, 4);
        assert_eq!((mask.width, mask.height), (4, 4));
        assert!(mask.get(0, 0));
        assert!(mask.get(1, 1));
        assert!(!mask.get(2, 0));
        assert!(mask.get(3, 3));
        assert_eq!(mask.pixel_count(), 8);
    }
}
