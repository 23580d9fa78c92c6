//! Model collaborators: segmentation, CLIP embeddings and dense features.
//!
//! The pipeline only talks to the traits below. The ONNX Runtime backed
//! implementations live in the submodules; tests substitute fakes.

pub mod clip;
pub mod featurizer;
pub mod preprocessing;
pub mod segmenter;
pub mod tokenizer;

use anyhow::{Context, Result};
use image::RgbImage;
use ndarray::Array3;
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::path::Path;
use tracing::debug;

use crate::correspondence;
use crate::types::Mask;

pub use clip::ClipModel;
pub use featurizer::DenseFeaturizer;
pub use preprocessing::{preprocess_for_clip, preprocess_for_featurizer, preprocess_for_sam2};
pub use segmenter::GroundedSegmenter;
pub use tokenizer::ClipTokenizer;

/// Prompt-conditioned object segmentation
pub trait ObjectSegmenter: Send + Sync {
    /// Masks for `prompt` in `image`, best first, each sized like `image`.
    /// An empty vector means nothing cleared the thresholds.
    fn segment(
        &self,
        image: &RgbImage,
        prompt: &str,
        box_threshold: f32,
        text_threshold: f32,
    ) -> Result<Vec<Mask>>;
}

/// Joint text/image embedding space (CLIP)
pub trait Embedder: Send + Sync {
    fn embed_text(&self, text: &str) -> Result<Vec<f32>>;

    fn embed_image(&self, image: &RgbImage) -> Result<Vec<f32>>;

    fn similarity(&self, a: &[f32], b: &[f32]) -> f32 {
        cosine_similarity(a, b)
    }
}

/// Spatial feature map laid out as `[channels, height, width]`
#[derive(Debug, Clone)]
pub struct FeatureMap {
    pub data: Array3<f32>,
}

impl FeatureMap {
    pub fn new(data: Array3<f32>) -> Self {
        Self { data }
    }

    pub fn channels(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn height(&self) -> usize {
        self.data.shape()[1]
    }

    pub fn width(&self) -> usize {
        self.data.shape()[2]
    }
}

/// Dense, prompt-conditioned feature extraction (diffusion features)
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, image: &RgbImage, prompt: &str) -> Result<FeatureMap>;

    /// Correspondence distance between two masked feature maps; lower is better
    fn distance(
        &self,
        src: &FeatureMap,
        tgt: &FeatureMap,
        src_mask: &Mask,
        tgt_mask: &Mask,
    ) -> f32 {
        correspondence::imd_distance(src, tgt, src_mask, tgt_mask)
    }
}

/// Build an ONNX Runtime session with the settings every model here shares
pub(crate) fn load_session(model_path: &Path) -> Result<Session> {
    debug!("Loading ONNX model from: {}", model_path.display());

    let session = Session::builder()
        .context("Failed to create ONNX Runtime session builder")?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context("Failed to set optimization level")?
        .with_intra_threads(4)
        .context("Failed to set intra threads")?
        .commit_from_file(model_path)
        .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))?;

    debug!("ONNX model loaded successfully");
    Ok(session)
}

/// Cosine similarity; zero when either vector has zero norm
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Normalize an embedding to unit length
pub fn normalize_embedding(embedding: &[f32]) -> Vec<f32> {
    let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        embedding.to_vec()
    } else {
        embedding.iter().map(|x| x / norm).collect()
    }
}
