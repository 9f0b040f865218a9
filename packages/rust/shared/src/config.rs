//! Application configuration for claimstack.
//!
//! User config lives at `~/.claimstack/claimstack.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClaimStackError, Result};
use crate::types::{EmbeddingModel, KnnEngine, SpaceType, VectorIndexSpec};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "claimstack.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".claimstack";

/// Deployment journal file name inside the config directory.
const JOURNAL_FILE_NAME: &str = "journal.db";

// ---------------------------------------------------------------------------
// Config structs (matching claimstack.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub aws: AwsConfig,

    /// Names of the stack and of the resources it declares.
    #[serde(default)]
    pub stack: StackConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Data source chunking policy.
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Vector index method parameters.
    #[serde(default)]
    pub index: IndexConfig,

    /// Polling policies for asynchronous remote state.
    #[serde(default)]
    pub wait: WaitConfig,

    #[serde(default)]
    pub ingestion: IngestionConfig,

    /// Generation models offered for summaries and comparisons.
    #[serde(default)]
    pub models: ModelsConfig,

    /// Processing function artifact and sizing.
    #[serde(default)]
    pub function: FunctionConfig,

    #[serde(default)]
    pub web: WebConfig,
}

/// `[aws]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    #[serde(default = "default_region")]
    pub region: String,

    /// Named credentials profile; the default chain is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            profile: None,
        }
    }
}

fn default_region() -> String {
    "us-east-1".into()
}

/// `[stack]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    #[serde(default = "default_stack_name")]
    pub name: String,

    /// Lowercase prefix for deterministic resource names (bucket names).
    #[serde(default = "default_resource_prefix")]
    pub resource_prefix: String,

    #[serde(default = "default_collection_name")]
    pub collection_name: String,

    #[serde(default = "default_index_name")]
    pub index_name: String,

    #[serde(default = "default_kb_name")]
    pub knowledge_base_name: String,

    #[serde(default = "default_data_source_name")]
    pub data_source_name: String,

    /// Bucket prefix the data source ingests from.
    #[serde(default = "default_source_prefix")]
    pub source_prefix: String,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            name: default_stack_name(),
            resource_prefix: default_resource_prefix(),
            collection_name: default_collection_name(),
            index_name: default_index_name(),
            knowledge_base_name: default_kb_name(),
            data_source_name: default_data_source_name(),
            source_prefix: default_source_prefix(),
        }
    }
}

fn default_stack_name() -> String {
    "ClaimStack".into()
}
fn default_resource_prefix() -> String {
    "claimstack".into()
}
fn default_collection_name() -> String {
    "insurance-kb-collection".into()
}
fn default_index_name() -> String {
    "insurance-policy-index".into()
}
fn default_kb_name() -> String {
    "insurance-policy-kb".into()
}
fn default_data_source_name() -> String {
    "insurance-policy-docs".into()
}
fn default_source_prefix() -> String {
    "policies/".into()
}

/// `[embedding]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_model")]
    pub model: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
        }
    }
}

fn default_embedding_model() -> String {
    "amazon.titan-embed-text-v2:0".into()
}

/// `[chunking]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_overlap")]
    pub overlap_percentage: u32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_percentage: default_overlap(),
        }
    }
}

fn default_max_tokens() -> u32 {
    300
}
fn default_overlap() -> u32 {
    20
}

/// `[index]` section. The dimension is not configured here: it always
/// follows the embedding model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_space_type")]
    pub space_type: SpaceType,

    #[serde(default = "default_engine")]
    pub engine: KnnEngine,

    #[serde(default = "default_m")]
    pub m: u32,

    #[serde(default = "default_ef")]
    pub ef_construction: u32,

    #[serde(default = "default_ef")]
    pub ef_search: u32,

    #[serde(default = "default_vector_field")]
    pub vector_field: String,

    #[serde(default = "default_text_field")]
    pub text_field: String,

    #[serde(default = "default_metadata_field")]
    pub metadata_field: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            space_type: default_space_type(),
            engine: default_engine(),
            m: default_m(),
            ef_construction: default_ef(),
            ef_search: default_ef(),
            vector_field: default_vector_field(),
            text_field: default_text_field(),
            metadata_field: default_metadata_field(),
        }
    }
}

fn default_space_type() -> SpaceType {
    SpaceType::L2
}
fn default_engine() -> KnnEngine {
    KnnEngine::Faiss
}
fn default_m() -> u32 {
    16
}
fn default_ef() -> u32 {
    512
}
fn default_vector_field() -> String {
    "vector".into()
}
fn default_text_field() -> String {
    "text".into()
}
fn default_metadata_field() -> String {
    "metadata".into()
}

/// `[wait]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitConfig {
    /// Collection activation (typically 5-10 minutes).
    #[serde(default = "default_collection_wait")]
    pub collection: WaitSection,

    /// Stack create/update/delete completion.
    #[serde(default = "default_stack_wait")]
    pub stack: WaitSection,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            collection: default_collection_wait(),
            stack: default_stack_wait(),
        }
    }
}

/// One exponential-backoff polling policy.
///
/// `timeout_secs` bounds the wait unless `unbounded` is set, in which case the
/// wait only ends when the resource settles or the operator interrupts it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitSection {
    pub initial_interval_secs: u64,
    pub max_interval_secs: u64,
    pub multiplier: f64,
    pub timeout_secs: u64,
    #[serde(default)]
    pub unbounded: bool,
}

impl WaitSection {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_secs(self.initial_interval_secs)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_secs)
    }

    /// `None` means wait indefinitely.
    pub fn timeout(&self) -> Option<Duration> {
        (!self.unbounded).then(|| Duration::from_secs(self.timeout_secs))
    }
}

fn default_collection_wait() -> WaitSection {
    WaitSection {
        initial_interval_secs: 30,
        max_interval_secs: 120,
        multiplier: 2.0,
        timeout_secs: 1800,
        unbounded: false,
    }
}

fn default_stack_wait() -> WaitSection {
    WaitSection {
        initial_interval_secs: 10,
        max_interval_secs: 30,
        multiplier: 1.5,
        timeout_secs: 3600,
        unbounded: false,
    }
}

/// `[ingestion]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Fixed interval between job status checks.
    #[serde(default = "default_ingestion_poll")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_ingestion_timeout")]
    pub timeout_secs: u64,

    /// Local directory uploaded under the source prefix by `ingest`.
    #[serde(default = "default_documents_dir")]
    pub documents_dir: String,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_ingestion_poll(),
            timeout_secs: default_ingestion_timeout(),
            documents_dir: default_documents_dir(),
        }
    }
}

fn default_ingestion_poll() -> u64 {
    10
}
fn default_ingestion_timeout() -> u64 {
    1800
}
fn default_documents_dir() -> String {
    "sample-policies".into()
}

/// `[models]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_generation_model")]
    pub default_model: String,

    /// Models used by `compare` when none are given.
    #[serde(default = "default_compare_models")]
    pub compare: Vec<String>,

    /// Models advertised by the web application.
    #[serde(default = "default_catalogue")]
    pub catalogue: Vec<ModelEntry>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            default_model: default_generation_model(),
            compare: default_compare_models(),
            catalogue: default_catalogue(),
        }
    }
}

/// One advertised generation model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub family: String,
    pub id: String,
    pub name: String,
    pub description: String,
    pub cost: String,
}

fn default_generation_model() -> String {
    "anthropic.claude-3-sonnet-20240229-v1:0".into()
}

fn default_compare_models() -> Vec<String> {
    vec![
        "anthropic.claude-3-haiku-20240307-v1:0".into(),
        "anthropic.claude-3-sonnet-20240229-v1:0".into(),
    ]
}

fn default_catalogue() -> Vec<ModelEntry> {
    let entry = |family: &str, id: &str, name: &str, description: &str, cost: &str| ModelEntry {
        family: family.into(),
        id: id.into(),
        name: name.into(),
        description: description.into(),
        cost: cost.into(),
    };
    vec![
        entry(
            "claude-3.5",
            "anthropic.claude-3-5-sonnet-20241022-v2:0",
            "Claude 3.5 Sonnet v2",
            "Latest Sonnet, best for summarization",
            "Medium",
        ),
        entry(
            "claude-3.5",
            "anthropic.claude-3-5-haiku-20241022-v1:0",
            "Claude 3.5 Haiku",
            "Fastest, good for simple summaries",
            "Low",
        ),
        entry(
            "claude-3",
            "anthropic.claude-3-sonnet-20240229-v1:0",
            "Claude 3 Sonnet",
            "Previous generation Sonnet",
            "Medium",
        ),
        entry(
            "claude-3",
            "anthropic.claude-3-haiku-20240307-v1:0",
            "Claude 3 Haiku",
            "Previous generation Haiku",
            "Low",
        ),
    ]
}

/// `[function]` section.
///
/// The deployment package comes either from an existing S3 object
/// (`code_bucket` + `code_key`) or from a locally built zip (`package`),
/// which the deploy uploads to the knowledge-base data bucket. The
/// processing function is only declared when one of the two is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionConfig {
    /// Zip produced by `cargo lambda build --release --output-format zip`.
    #[serde(default = "default_package", skip_serializing_if = "Option::is_none")]
    pub package: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_bucket: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_key: Option<String>,

    #[serde(default = "default_runtime")]
    pub runtime: String,

    #[serde(default = "default_handler")]
    pub handler: String,

    #[serde(default = "default_function_timeout")]
    pub timeout_secs: u32,

    #[serde(default = "default_memory")]
    pub memory_mb: u32,
}

impl Default for FunctionConfig {
    fn default() -> Self {
        Self {
            package: default_package(),
            code_bucket: None,
            code_key: None,
            runtime: default_runtime(),
            handler: default_handler(),
            timeout_secs: default_function_timeout(),
            memory_mb: default_memory(),
        }
    }
}

impl FunctionConfig {
    /// `(bucket, key)` of the deployment package, if configured.
    pub fn artifact(&self) -> Option<(&str, &str)> {
        Some((self.code_bucket.as_deref()?, self.code_key.as_deref()?))
    }

    /// Whether the processing function belongs in the stack at all.
    pub fn is_declared(&self) -> bool {
        self.artifact().is_some() || self.package.is_some()
    }
}

fn default_package() -> Option<PathBuf> {
    Some(PathBuf::from(
        "target/lambda/claimstack-function/bootstrap.zip",
    ))
}

fn default_runtime() -> String {
    "provided.al2023".into()
}
fn default_handler() -> String {
    "bootstrap".into()
}
fn default_function_timeout() -> u32 {
    300
}
fn default_memory() -> u32 {
    512
}

/// `[web]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_max_upload")]
    pub max_upload_bytes: usize,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_upload_bytes: default_max_upload(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:5000".into()
}
fn default_max_upload() -> usize {
    16 * 1024 * 1024
}

// ---------------------------------------------------------------------------
// Derived runtime settings
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Resolve the configured embedding model against the dimension table.
    pub fn embedding_model(&self) -> Result<EmbeddingModel> {
        EmbeddingModel::resolve(&self.embedding.model)
    }

    /// The vector index this deployment declares, sized for the embedding model.
    pub fn index_spec(&self) -> Result<VectorIndexSpec> {
        let model = self.embedding_model()?;
        Ok(VectorIndexSpec {
            name: self.stack.index_name.clone(),
            dimension: model.dimension,
            space_type: self.index.space_type,
            engine: self.index.engine,
            m: self.index.m,
            ef_construction: self.index.ef_construction,
            ef_search: self.index.ef_search,
            vector_field: self.index.vector_field.clone(),
            text_field: self.index.text_field.clone(),
            metadata_field: self.index.metadata_field.clone(),
        })
    }

    /// Check invariants that would otherwise only fail remotely.
    pub fn validate(&self) -> Result<()> {
        self.embedding_model()?;

        let prefix = &self.stack.resource_prefix;
        let valid_prefix = !prefix.is_empty()
            && prefix.len() <= 24
            && prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !valid_prefix {
            return Err(ClaimStackError::config(format!(
                "stack.resource_prefix '{prefix}' must be 1-24 lowercase letters, digits or '-'"
            )));
        }
        if !self.stack.source_prefix.ends_with('/') {
            return Err(ClaimStackError::config(
                "stack.source_prefix must end with '/'",
            ));
        }
        if self.chunking.overlap_percentage > 99 {
            return Err(ClaimStackError::config(
                "chunking.overlap_percentage must be below 100",
            ));
        }
        for (name, wait) in [("collection", &self.wait.collection), ("stack", &self.wait.stack)] {
            if wait.multiplier < 1.0 {
                return Err(ClaimStackError::config(format!(
                    "wait.{name}.multiplier must be >= 1.0"
                )));
            }
        }
        if self.function.code_bucket.is_some() != self.function.code_key.is_some() {
            return Err(ClaimStackError::config(
                "function.code_bucket and function.code_key must be set together",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.claimstack/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ClaimStackError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.claimstack/claimstack.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Get the path to the deployment journal (`~/.claimstack/journal.db`).
pub fn journal_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(JOURNAL_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ClaimStackError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| ClaimStackError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ClaimStackError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ClaimStackError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ClaimStackError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("insurance-kb-collection"));
        assert!(toml_str.contains("titan-embed-text-v2"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.chunking.max_tokens, 300);
        assert_eq!(parsed.ingestion.poll_interval_secs, 10);
        assert_eq!(parsed.models.catalogue.len(), 4);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[aws]
region = "eu-west-1"

[embedding]
model = "amazon.titan-embed-text-v1"

[wait.collection]
initial_interval_secs = 5
max_interval_secs = 60
multiplier = 2.0
timeout_secs = 600
unbounded = true
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.aws.region, "eu-west-1");
        assert_eq!(config.stack.index_name, "insurance-policy-index");
        assert_eq!(config.index_spec().expect("spec").dimension, 1536);
        assert_eq!(config.wait.collection.timeout(), None);
        assert_eq!(
            config.wait.stack.timeout(),
            Some(Duration::from_secs(3600))
        );
    }

    #[test]
    fn validation_rejects_bad_prefix_and_unknown_model() {
        let mut config = AppConfig::default();
        config.stack.resource_prefix = "Claim_Stack".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.embedding.model = "nope".into();
        assert!(config.validate().is_err());
        assert!(config.index_spec().is_err());
    }

    #[test]
    fn function_artifact_requires_both_parts() {
        let mut config = AppConfig::default();
        assert!(config.function.artifact().is_none());
        config.function.code_bucket = Some("artifacts".into());
        assert!(config.validate().is_err());
        config.function.code_key = Some("claimstack/function.zip".into());
        assert_eq!(
            config.function.artifact(),
            Some(("artifacts", "claimstack/function.zip"))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn function_package_defaults_to_lambda_build_output() {
        let config: AppConfig = toml::from_str("").expect("parse");
        assert_eq!(
            config.function.package.as_deref(),
            Some(Path::new("target/lambda/claimstack-function/bootstrap.zip"))
        );
        assert!(config.function.is_declared());

        let mut config = config;
        config.function.package = None;
        assert!(!config.function.is_declared());
        config.function.code_bucket = Some("artifacts".into());
        config.function.code_key = Some("function.zip".into());
        assert!(config.function.is_declared());
    }
}
