//! Construction-time configuration for the retrieval pipeline.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, RetrievalError};

/// Frames kept by the visual filter before geometric ranking
pub const MAX_IMD_RANKING_NUM: usize = 30;

/// Environment variable consulted for the chat API key
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Dataset the task catalog is drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSource {
    #[serde(rename = "droid")]
    Droid,
    #[serde(rename = "HOI4D")]
    Hoi4d,
    #[serde(rename = "customize")]
    Customize,
}

impl DataSource {
    /// Directory name under the subset root
    pub fn dir_name(&self) -> &'static str {
        match self {
            DataSource::Droid => "droid",
            DataSource::Hoi4d => "HOI4D",
            DataSource::Customize => "customize",
        }
    }
}

impl std::str::FromStr for DataSource {
    type Err = RetrievalError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "droid" => Ok(DataSource::Droid),
            "HOI4D" => Ok(DataSource::Hoi4d),
            "customize" => Ok(DataSource::Customize),
            _ => Err(RetrievalError::InvalidDataSource(s.to_string())),
        }
    }
}

impl std::fmt::Display for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Strategy used to map free-text task descriptions onto the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LanguageMode {
    #[serde(alias = "clip")]
    Embedding,
    #[serde(alias = "gpt")]
    Conversational,
}

impl std::str::FromStr for LanguageMode {
    type Err = RetrievalError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "embedding" | "clip" => Ok(LanguageMode::Embedding),
            "conversational" | "gpt" => Ok(LanguageMode::Conversational),
            _ => Err(RetrievalError::InvalidLanguageMode(s.to_string())),
        }
    }
}

impl std::fmt::Display for LanguageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LanguageMode::Embedding => write!(f, "embedding"),
            LanguageMode::Conversational => write!(f, "conversational"),
        }
    }
}

/// Chat-completion endpoint settings for conversational mode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub endpoint: String,
    pub model: String,
    pub timeout_secs: u64,
    /// Falls back to `OPENAI_API_KEY` when unset
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 60,
            api_key: None,
        }
    }
}

impl ChatConfig {
    /// Explicit key first, then the environment
    pub fn resolve_api_key(&self) -> Option<String> {
        self.resolve_api_key_from(std::env::var(API_KEY_ENV).ok())
    }

    /// Explicit key first, then `env_key`; blank keys count as unset
    pub fn resolve_api_key_from(&self, env_key: Option<String>) -> Option<String> {
        let usable = |key: &String| !key.trim().is_empty();
        self.api_key
            .clone()
            .filter(usable)
            .or_else(|| env_key.filter(usable))
    }
}

/// Every knob the pipeline reads at construction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub subset_dir: PathBuf,
    #[serde(default = "default_save_root")]
    pub save_root: PathBuf,
    pub data_source: DataSource,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_lang_mode")]
    pub lang_mode: LanguageMode,
    #[serde(default = "default_true")]
    pub crop: bool,
    #[serde(default = "default_margin")]
    pub crop_margin: u32,
    #[serde(default = "default_box_threshold")]
    pub box_threshold: f32,
    #[serde(default = "default_text_threshold")]
    pub text_threshold: f32,
    #[serde(default = "default_max_ranking")]
    pub max_ranking: usize,
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f32,
    #[serde(default = "default_min_joint")]
    pub min_joint: f32,
    #[serde(default = "default_visualization_name")]
    pub visualization_name: String,
    #[serde(default)]
    pub chat: ChatConfig,
}

fn default_save_root() -> PathBuf {
    PathBuf::from("./")
}

fn default_top_k() -> usize {
    5
}

fn default_lang_mode() -> LanguageMode {
    LanguageMode::Embedding
}

fn default_true() -> bool {
    true
}

fn default_margin() -> u32 {
    100
}

fn default_box_threshold() -> f32 {
    0.3
}

fn default_text_threshold() -> f32 {
    0.25
}

fn default_max_ranking() -> usize {
    MAX_IMD_RANKING_NUM
}

fn default_dedup_threshold() -> f32 {
    0.8
}

fn default_min_joint() -> f32 {
    0.1
}

fn default_visualization_name() -> String {
    "imd_top5.png".to_string()
}

impl PipelineConfig {
    /// Config with defaults for everything except the two required fields
    pub fn new(subset_dir: impl Into<PathBuf>, data_source: DataSource) -> Self {
        Self {
            subset_dir: subset_dir.into(),
            save_root: default_save_root(),
            data_source,
            top_k: default_top_k(),
            lang_mode: default_lang_mode(),
            crop: true,
            crop_margin: default_margin(),
            box_threshold: default_box_threshold(),
            text_threshold: default_text_threshold(),
            max_ranking: default_max_ranking(),
            dedup_threshold: default_dedup_threshold(),
            min_joint: default_min_joint(),
            visualization_name: default_visualization_name(),
            chat: ChatConfig::default(),
        }
    }

    /// Load a JSON config file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            RetrievalError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(RetrievalError::Config("top_k must be at least 1".into()));
        }
        if self.max_ranking == 0 {
            return Err(RetrievalError::Config(
                "max_ranking must be at least 1".into(),
            ));
        }
        if self.lang_mode == LanguageMode::Conversational && self.chat.resolve_api_key().is_none()
        {
            return Err(RetrievalError::Config(format!(
                "conversational mode needs an API key (set {} or chat.api_key)",
                API_KEY_ENV
            )));
        }
        Ok(())
    }

    /// `<subset_dir>/<source>`
    pub fn source_dir(&self) -> PathBuf {
        self.subset_dir.join(self.data_source.dir_name())
    }

    pub fn visualization_path(&self) -> PathBuf {
        self.save_root.join(&self.visualization_name)
    }
}
