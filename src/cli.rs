//! Command-line interface for subset-retrieve.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use crate::config::{DataSource, LanguageMode, PipelineConfig};

/// subset-retrieve - find the recorded episode closest to the current observation
#[derive(Parser, Debug)]
#[command(
    name = "subset-retrieve",
    about = "Language, CLIP and dense-feature retrieval over recorded manipulation episodes",
    version,
    author
)]
pub struct Cli {
    /// Current observation image
    #[arg(required = true, value_name = "IMAGE_PATH")]
    pub observation: PathBuf,

    /// Free-text task description, e.g. "pick up the apple"
    #[arg(required = true, value_name = "TASK")]
    pub task: String,

    /// JSON pipeline config; the flags below override its fields
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Root of the per-source task directories
    #[arg(long, value_name = "DIR")]
    pub subset_dir: Option<PathBuf>,

    /// Data source: droid, HOI4D or customize
    #[arg(long, value_name = "SOURCE")]
    pub data_source: Option<DataSource>,

    /// Directory the visualization is written to
    #[arg(long, value_name = "DIR")]
    pub save_root: Option<PathBuf>,

    /// Number of candidates kept by geometric ranking
    #[arg(long, value_name = "K")]
    pub top_k: Option<usize>,

    /// Language retrieval mode: embedding (clip) or conversational (gpt)
    #[arg(long, value_name = "MODE")]
    pub lang_mode: Option<LanguageMode>,

    /// Skip cropping around the segmented object
    #[arg(long)]
    pub no_crop: bool,

    /// Pixels kept around the object when cropping
    #[arg(long, value_name = "PIXELS")]
    pub crop_margin: Option<u32>,

    /// Grounded segmentation ONNX model path
    #[arg(long, default_value = "models/grounded_sam.onnx", value_name = "PATH")]
    pub segmenter_model: PathBuf,

    /// CLIP image encoder ONNX model path
    #[arg(long, default_value = "models/clip_vision.onnx", value_name = "PATH")]
    pub clip_vision_model: PathBuf,

    /// CLIP text encoder ONNX model path
    #[arg(long, default_value = "models/clip_text.onnx", value_name = "PATH")]
    pub clip_text_model: PathBuf,

    /// CLIP BPE vocabulary (vocab.json)
    #[arg(long, default_value = "models/clip_vocab.json", value_name = "PATH")]
    pub vocab: PathBuf,

    /// Dense feature extractor ONNX model path
    #[arg(long, default_value = "models/dift.onnx", value_name = "PATH")]
    pub featurizer_model: PathBuf,

    /// Chat model used in conversational mode
    #[arg(long, value_name = "MODEL")]
    pub chat_model: Option<String>,

    /// Chat completions endpoint used in conversational mode
    #[arg(long, value_name = "URL")]
    pub chat_endpoint: Option<String>,

    /// Write newly segmented episode bundles back to their cache files
    #[arg(long)]
    pub persist_enrichment: bool,

    /// Output format
    #[arg(long, default_value = "text", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Verbose logging (can be repeated: -v, -vv, -vvv)
    #[arg(short, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Pipeline config from `--config` (if any) with flags applied on top
    pub fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_json_file(path)
                .with_context(|| format!("Failed to load config: {}", path.display()))?,
            None => {
                let subset_dir = self
                    .subset_dir
                    .clone()
                    .context("--subset-dir is required without --config")?;
                let data_source = self
                    .data_source
                    .context("--data-source is required without --config")?;
                PipelineConfig::new(subset_dir, data_source)
            }
        };

        if let Some(dir) = &self.subset_dir {
            config.subset_dir = dir.clone();
        }
        if let Some(source) = self.data_source {
            config.data_source = source;
        }
        if let Some(dir) = &self.save_root {
            config.save_root = dir.clone();
        }
        if let Some(k) = self.top_k {
            config.top_k = k;
        }
        if let Some(mode) = self.lang_mode {
            config.lang_mode = mode;
        }
        if self.no_crop {
            config.crop = false;
        }
        if let Some(margin) = self.crop_margin {
            config.crop_margin = margin;
        }
        if let Some(model) = &self.chat_model {
            config.chat.model = model.clone();
        }
        if let Some(endpoint) = &self.chat_endpoint {
            config.chat.endpoint = endpoint.clone();
        }
        Ok(config)
    }
}

/// Output format selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Text,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "text" => Ok(OutputFormat::Text),
            _ => Err(format!("Unknown format: {}. Use 'json' or 'text'", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Text => write!(f, "text"),
        }
    }
}

/// Get tracing level from verbosity
pub fn get_log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}
