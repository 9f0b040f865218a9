//! Shared types, error model, and configuration for claimstack.
//!
//! This crate is the foundation depended on by all other claimstack crates.
//! It provides:
//! - [`ClaimStackError`], the unified error type
//! - Domain types ([`VectorIndexSpec`], [`EmbeddingModel`], remote state machines)
//! - [`DeploymentContext`], the identifiers handed from one step to the next
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod context;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, AwsConfig, ChunkingConfig, EmbeddingConfig, FunctionConfig, IndexConfig,
    IngestionConfig, ModelEntry, ModelsConfig, StackConfig, WaitConfig, WaitSection, WebConfig,
    config_dir, config_file_path, init_config, journal_path, load_config, load_config_from,
};
pub use context::{DeploymentContext, OUTPUT_ENV_KEYS};
pub use error::{ClaimStackError, Result};
pub use types::{
    CollectionState, EmbeddingModel, IndexShape, IngestionStatus, KnnEngine, LogFormat, RunId,
    SpaceType, VectorIndexSpec,
};
