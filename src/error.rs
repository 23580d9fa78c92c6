//! Error types for the retrieval pipeline

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RetrievalError>;

#[derive(Error, Debug)]
pub enum RetrievalError {
    /// Unknown data source name
    #[error("invalid data source '{0}': expected 'droid', 'HOI4D' or 'customize'")]
    InvalidDataSource(String),

    /// Unknown language retrieval mode
    #[error("invalid language mode '{0}': expected 'embedding' or 'conversational'")]
    InvalidLanguageMode(String),

    /// Any other rejected construction-time setting
    #[error("configuration error: {0}")]
    Config(String),

    /// The active data source directory does not exist
    #[error("task catalog directory not found: {}", .0.display())]
    CatalogNotFound(PathBuf),

    /// The active data source holds no task directories
    #[error("task catalog is empty: {}", .0.display())]
    EmptyCatalog(PathBuf),

    /// No episode cache file for the retrieved task
    #[error("missing cache for task '{task}': {} does not exist", .path.display())]
    MissingCache { task: String, path: PathBuf },

    /// Cache file decoded but violates bundle invariants
    #[error("corrupt cache for task '{task}': {reason}")]
    CorruptCache { task: String, reason: String },

    /// Conversational model answered with a name outside the catalog
    #[error("retrieved task '{0}' is not in the task catalog")]
    UnknownTask(String),

    /// Every candidate was filtered out before top-1 selection
    #[error("no candidates survived ranking for task '{0}'")]
    NoCandidates(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("cache encoding error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("cache decoding error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// Failure inside an external model collaborator
    #[error("model error: {0:#}")]
    Model(#[from] anyhow::Error),
}
