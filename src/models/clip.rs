//! CLIP model inference via ONNX Runtime.

use anyhow::{Context, Result};
use image::RgbImage;
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;
use tracing::debug;

use super::preprocessing::preprocess_for_clip;
use super::tokenizer::ClipTokenizer;
use super::{load_session, normalize_embedding, Embedder};

/// CLIP ViT image and text towers exported as two ONNX graphs
pub struct ClipModel {
    vision: Session,
    text: Session,
    tokenizer: ClipTokenizer,
    embedding_dim: usize,
}

impl ClipModel {
    /// Load both towers and the vocabulary
    ///
    /// # Example
    ///
    /// ```ignore
    /// let clip = ClipModel::new(
    ///     Path::new("models/clip_vision.onnx"),
    ///     Path::new("models/clip_text.onnx"),
    ///     Path::new("models/clip_vocab.json"),
    /// )?;
    /// ```
    pub fn new(vision_path: &Path, text_path: &Path, vocab_path: &Path) -> Result<Self> {
        Self::with_embedding_dim(vision_path, text_path, vocab_path, 512)
    }

    /// Same as [`ClipModel::new`] with a non-default embedding width
    pub fn with_embedding_dim(
        vision_path: &Path,
        text_path: &Path,
        vocab_path: &Path,
        embedding_dim: usize,
    ) -> Result<Self> {
        let vision = load_session(vision_path).context("Failed to load CLIP vision tower")?;
        let text = load_session(text_path).context("Failed to load CLIP text tower")?;
        let tokenizer = ClipTokenizer::from_file(vocab_path)?;

        debug!("CLIP model loaded successfully");
        Ok(Self {
            vision,
            text,
            tokenizer,
            embedding_dim,
        })
    }

    /// Get the embedding dimension
    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    fn check_dim(&self, embedding: &[f32]) {
        if embedding.len() != self.embedding_dim {
            debug!(
                "Generated embedding of size {} (expected {})",
                embedding.len(),
                self.embedding_dim
            );
        }
    }
}

impl Embedder for ClipModel {
    fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let input_ids = self.tokenizer.encode(text);
        debug!("Running CLIP text embedding for {:?}", text);

        let outputs = self
            .text
            .run(ort::inputs!["input_ids" => Tensor::from_array(input_ids)?]?)
            .context("CLIP text inference failed")?;
        let embeddings = outputs["text_embeds"].try_extract_tensor::<f32>()?;
        let embedding: Vec<f32> = embeddings.iter().copied().collect();

        self.check_dim(&embedding);
        Ok(normalize_embedding(&embedding))
    }

    fn embed_image(&self, image: &RgbImage) -> Result<Vec<f32>> {
        let pixels = preprocess_for_clip(image)?;
        debug!(
            "Running CLIP embedding on image of shape {:?}",
            pixels.shape()
        );

        let outputs = self
            .vision
            .run(ort::inputs!["pixel_values" => Tensor::from_array(pixels)?]?)
            .context("CLIP vision inference failed")?;

        // [1, embedding_dim] -> flat vector
        let embeddings = outputs["image_embeds"].try_extract_tensor::<f32>()?;
        let embedding: Vec<f32> = embeddings.iter().copied().collect();

        self.check_dim(&embedding);
        Ok(normalize_embedding(&embedding))
    }
}
