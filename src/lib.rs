#![doc = include_str!("../README.md")]

pub mod catalog;
pub mod cli;
pub mod config;
pub mod correspondence;
pub mod crop;
pub mod error;
pub mod language;
pub mod models;
pub mod pipeline;
pub mod rerank;
pub mod segmentation;
pub mod store;
pub mod types;
pub mod visualize;

pub use catalog::{Task, TaskCatalog};
pub use config::{DataSource, LanguageMode, PipelineConfig};
pub use error::{Result, RetrievalError};
pub use pipeline::{PipelineModels, SubsetRetrievePipeline};
pub use types::{Candidate, Mask, QueryObject, RetrievalBundle, TopMatch};
