//! Prompt-conditioned dense features from a diffusion backbone via ONNX Runtime.

use anyhow::{Context, Result};
use image::RgbImage;
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;
use tracing::debug;

use super::preprocessing::preprocess_for_featurizer;
use super::tokenizer::ClipTokenizer;
use super::{load_session, FeatureExtractor, FeatureMap};

/// Default input resolution of the feature extractor
pub const FEATURIZER_INPUT_SIZE: u32 = 768;

/// UNet decoder features exported as `image`, `input_ids` -> `features` `[1, C, h, w]`
pub struct DenseFeaturizer {
    session: Session,
    tokenizer: ClipTokenizer,
    input_size: u32,
}

impl DenseFeaturizer {
    pub fn new(model_path: &Path, vocab_path: &Path) -> Result<Self> {
        let session = load_session(model_path).context("Failed to load feature extractor")?;
        let tokenizer = ClipTokenizer::from_file(vocab_path)?;
        Ok(Self {
            session,
            tokenizer,
            input_size: FEATURIZER_INPUT_SIZE,
        })
    }

    pub fn with_input_size(mut self, input_size: u32) -> Self {
        self.input_size = input_size;
        self
    }
}

impl FeatureExtractor for DenseFeaturizer {
    fn extract(&self, image: &RgbImage, prompt: &str) -> Result<FeatureMap> {
        let pixels = preprocess_for_featurizer(image, self.input_size)?;
        let input_ids = self.tokenizer.encode(prompt);

        let outputs = self
            .session
            .run(ort::inputs![
                "image" => Tensor::from_array(pixels)?,
                "input_ids" => Tensor::from_array(input_ids)?,
            ]?)
            .context("Feature extraction failed")?;

        let features = outputs["features"].try_extract_tensor::<f32>()?;
        let features = features
            .into_dimensionality::<ndarray::Ix4>()
            .context("Expected features of shape [1, C, h, w]")?;
        let map = features.index_axis(ndarray::Axis(0), 0).to_owned();

        debug!("Extracted feature map of shape {:?}", map.shape());
        Ok(FeatureMap::new(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_creation_fails_with_missing_file() {
        let result = DenseFeaturizer::new(
            Path::new("nonexistent_model.onnx"),
            Path::new("nonexistent_vocab.json"),
        );
        assert!(result.is_err());
    }
}
