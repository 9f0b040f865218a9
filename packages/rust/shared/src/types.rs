//! Core domain types for the claim pipeline's managed resources.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::{ClaimStackError, Result};

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for deployment run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Embedding models
// ---------------------------------------------------------------------------

/// Embedding models the knowledge base can be declared with, and the vector
/// width each one produces.
const EMBEDDING_DIMENSIONS: &[(&str, u32)] = &[
    ("amazon.titan-embed-text-v1", 1536),
    ("amazon.titan-embed-text-v2:0", 1024),
    ("cohere.embed-english-v3", 1024),
    ("cohere.embed-multilingual-v3", 1024),
];

/// An embedding model id resolved against the known dimensionality table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingModel {
    pub id: String,
    pub dimension: u32,
}

impl EmbeddingModel {
    /// Look up a model id. Unknown ids are an operator error: an index built
    /// with a guessed width only fails later, at ingestion time.
    pub fn resolve(id: &str) -> Result<Self> {
        EMBEDDING_DIMENSIONS
            .iter()
            .find(|(known, _)| *known == id)
            .map(|(known, dimension)| Self {
                id: (*known).to_string(),
                dimension: *dimension,
            })
            .ok_or_else(|| {
                let known: Vec<&str> = EMBEDDING_DIMENSIONS.iter().map(|(m, _)| *m).collect();
                ClaimStackError::operator(format!(
                    "unknown embedding model '{id}' (known: {})",
                    known.join(", ")
                ))
            })
    }

    /// All `(model, dimension)` pairs in the catalogue.
    pub fn catalogue() -> impl Iterator<Item = Self> {
        EMBEDDING_DIMENSIONS.iter().map(|(id, dimension)| Self {
            id: (*id).to_string(),
            dimension: *dimension,
        })
    }

    /// Fail with `ConfigConflict` when an index width does not match.
    pub fn check_dimension(&self, dimension: u32) -> Result<()> {
        if self.dimension == dimension {
            Ok(())
        } else {
            Err(ClaimStackError::conflict(format!(
                "embedding model {} produces {}-dimensional vectors but the index is configured for {dimension}",
                self.id, self.dimension
            )))
        }
    }

    /// ARN used by the knowledge base declaration.
    pub fn arn(&self, region: &str) -> String {
        format!("arn:aws:bedrock:{region}::foundation-model/{}", self.id)
    }
}

// ---------------------------------------------------------------------------
// Vector index
// ---------------------------------------------------------------------------

/// Distance metric of the k-NN vector field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceType {
    L2,
    Innerproduct,
    Cosinesimil,
}

impl SpaceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::L2 => "l2",
            Self::Innerproduct => "innerproduct",
            Self::Cosinesimil => "cosinesimil",
        }
    }
}

/// Approximate-nearest-neighbour engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnnEngine {
    Faiss,
    Nmslib,
}

impl KnnEngine {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Faiss => "faiss",
            Self::Nmslib => "nmslib",
        }
    }
}

/// Declared shape of the knowledge base's vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorIndexSpec {
    pub name: String,
    pub dimension: u32,
    pub space_type: SpaceType,
    pub engine: KnnEngine,
    /// HNSW graph degree.
    pub m: u32,
    pub ef_construction: u32,
    pub ef_search: u32,
    pub vector_field: String,
    pub text_field: String,
    pub metadata_field: String,
}

/// The immutable parts of an index mapping as read back from the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexShape {
    pub dimension: Option<u32>,
    pub space_type: Option<String>,
    pub engine: Option<String>,
    pub method: Option<String>,
    pub m: Option<u32>,
    pub ef_construction: Option<u32>,
}

impl VectorIndexSpec {
    /// Request body for `PUT /<index>`.
    pub fn to_index_body(&self) -> Value {
        let mut properties = serde_json::Map::new();
        properties.insert(
            self.vector_field.clone(),
            json!({
                "type": "knn_vector",
                "dimension": self.dimension,
                "method": {
                    "name": "hnsw",
                    "engine": self.engine.as_str(),
                    "space_type": self.space_type.as_str(),
                    "parameters": {
                        "ef_construction": self.ef_construction,
                        "m": self.m,
                    }
                }
            }),
        );
        properties.insert(self.text_field.clone(), json!({ "type": "text" }));
        properties.insert(self.metadata_field.clone(), json!({ "type": "text" }));

        json!({
            "settings": {
                "index": {
                    "knn": true,
                    "knn.algo_param.ef_search": self.ef_search,
                }
            },
            "mappings": { "properties": Value::Object(properties) }
        })
    }

    /// The shape this spec would produce, for comparison with a live index.
    pub fn shape(&self) -> IndexShape {
        IndexShape {
            dimension: Some(self.dimension),
            space_type: Some(self.space_type.as_str().to_string()),
            engine: Some(self.engine.as_str().to_string()),
            method: Some("hnsw".into()),
            m: Some(self.m),
            ef_construction: Some(self.ef_construction),
        }
    }

    /// Settings where `existing` disagrees with this spec, as human-readable lines.
    pub fn differences(&self, existing: &IndexShape) -> Vec<String> {
        let wanted = self.shape();
        let mut diffs = Vec::new();

        fn cmp<T: PartialEq + std::fmt::Debug>(
            diffs: &mut Vec<String>,
            name: &str,
            wanted: &Option<T>,
            actual: &Option<T>,
        ) {
            if wanted != actual {
                diffs.push(format!("{name}: declared {wanted:?}, found {actual:?}"));
            }
        }

        cmp(&mut diffs, "dimension", &wanted.dimension, &existing.dimension);
        cmp(&mut diffs, "space_type", &wanted.space_type, &existing.space_type);
        cmp(&mut diffs, "engine", &wanted.engine, &existing.engine);
        cmp(&mut diffs, "method", &wanted.method, &existing.method);
        cmp(&mut diffs, "m", &wanted.m, &existing.m);
        cmp(
            &mut diffs,
            "ef_construction",
            &wanted.ef_construction,
            &existing.ef_construction,
        );
        diffs
    }
}

impl IndexShape {
    /// Extract the vector field's shape from a `GET /<index>` response body.
    pub fn from_index_response(index: &str, vector_field: &str, body: &Value) -> Option<Self> {
        let field = body
            .get(index)?
            .get("mappings")?
            .get("properties")?
            .get(vector_field)?;
        let method = field.get("method");
        let params = method.and_then(|m| m.get("parameters"));

        let as_u32 = |v: Option<&Value>| {
            v.and_then(|v| {
                v.as_u64()
                    .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
            })
            .and_then(|n| u32::try_from(n).ok())
        };
        let as_string = |v: Option<&Value>| v.and_then(Value::as_str).map(str::to_string);

        Some(Self {
            dimension: as_u32(field.get("dimension")),
            space_type: as_string(method.and_then(|m| m.get("space_type"))),
            engine: as_string(method.and_then(|m| m.get("engine"))),
            method: as_string(method.and_then(|m| m.get("name"))),
            m: as_u32(params.and_then(|p| p.get("m"))),
            ef_construction: as_u32(params.and_then(|p| p.get("ef_construction"))),
        })
    }
}

// ---------------------------------------------------------------------------
// Remote state machines
// ---------------------------------------------------------------------------

/// Lifecycle of the vector search collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionState {
    Creating,
    Active,
    Updating,
    Deleting,
    Failed,
    Unknown(String),
}

impl CollectionState {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "CREATING" => Self::Creating,
            "ACTIVE" => Self::Active,
            "UPDATING" => Self::Updating,
            "DELETING" => Self::Deleting,
            "FAILED" => Self::Failed,
            _ => Self::Unknown(raw.to_string()),
        }
    }

    /// Whether waiting longer cannot change the outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Active | Self::Failed | Self::Deleting)
    }
}

impl std::fmt::Display for CollectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => f.write_str("CREATING"),
            Self::Active => f.write_str("ACTIVE"),
            Self::Updating => f.write_str("UPDATING"),
            Self::Deleting => f.write_str("DELETING"),
            Self::Failed => f.write_str("FAILED"),
            Self::Unknown(raw) => f.write_str(raw),
        }
    }
}

/// Lifecycle of one knowledge-base ingestion job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngestionStatus {
    Starting,
    InProgress,
    Complete,
    Failed,
    Stopping,
    Stopped,
    Unknown(String),
}

impl IngestionStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "STARTING" => Self::Starting,
            "IN_PROGRESS" => Self::InProgress,
            "COMPLETE" => Self::Complete,
            "FAILED" => Self::Failed,
            "STOPPING" => Self::Stopping,
            "STOPPED" => Self::Stopped,
            _ => Self::Unknown(raw.to_string()),
        }
    }

    /// Whether the job will not change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Stopped)
    }
}

impl std::fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => f.write_str("STARTING"),
            Self::InProgress => f.write_str("IN_PROGRESS"),
            Self::Complete => f.write_str("COMPLETE"),
            Self::Failed => f.write_str("FAILED"),
            Self::Stopping => f.write_str("STOPPING"),
            Self::Stopped => f.write_str("STOPPED"),
            Self::Unknown(raw) => f.write_str(raw),
        }
    }
}

// ---------------------------------------------------------------------------
// LogFormat
// ---------------------------------------------------------------------------

/// Log output format of the binaries (`--log-format`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}
