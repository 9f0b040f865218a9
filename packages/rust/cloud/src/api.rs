//! Service seams.
//!
//! Every managed service the pipeline talks to sits behind one of these
//! traits. The AWS-backed implementations live in [`crate::aws`] and
//! [`crate::signed`]; tests substitute in-memory or scripted fakes.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use claimstack_shared::{CollectionState, IndexShape, IngestionStatus, Result, VectorIndexSpec};

// ---------------------------------------------------------------------------
// Provisioning engine
// ---------------------------------------------------------------------------

/// Coarse classification of a provisioning-engine stack status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StackPhase {
    InProgress,
    Complete,
    /// Rolled back or failed; the last step did not take effect.
    Failed,
}

impl StackPhase {
    pub fn classify(status: &str) -> Self {
        if status.ends_with("_IN_PROGRESS") {
            Self::InProgress
        } else if status.ends_with("_FAILED") || status.contains("ROLLBACK") {
            Self::Failed
        } else {
            Self::Complete
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StackDescription {
    pub name: String,
    pub status: String,
    pub reason: Option<String>,
    pub outputs: BTreeMap<String, String>,
}

impl StackDescription {
    pub fn phase(&self) -> StackPhase {
        StackPhase::classify(&self.status)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StackEvent {
    pub timestamp: Option<DateTime<Utc>>,
    pub logical_id: String,
    pub resource_type: String,
    pub status: String,
    pub reason: Option<String>,
}

#[async_trait]
pub trait StackProvisioner: Send + Sync {
    /// `None` when the stack does not exist.
    async fn describe_stack(&self, name: &str) -> Result<Option<StackDescription>>;

    async fn create_stack(&self, name: &str, template_body: &str) -> Result<()>;

    /// Returns `false` when the template produced no changes.
    async fn update_stack(&self, name: &str, template_body: &str) -> Result<bool>;

    async fn delete_stack(&self, name: &str) -> Result<()>;

    /// Most recent events first.
    async fn stack_events(&self, name: &str, limit: usize) -> Result<Vec<StackEvent>>;
}

// ---------------------------------------------------------------------------
// Vector search
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CollectionInfo {
    pub id: String,
    pub name: String,
    pub arn: Option<String>,
    pub endpoint: Option<String>,
    pub state: CollectionState,
}

/// Control plane of the search service.
#[async_trait]
pub trait CollectionApi: Send + Sync {
    async fn collection(&self, name: &str) -> Result<Option<CollectionInfo>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexCreation {
    Created,
    /// Another caller created the index first.
    AlreadyExists,
}

/// Data plane of one collection.
#[async_trait]
pub trait IndexApi: Send + Sync {
    /// Shape of an existing index, `None` when it does not exist.
    async fn index_shape(&self, index: &str, vector_field: &str) -> Result<Option<IndexShape>>;

    async fn create_index(&self, spec: &VectorIndexSpec) -> Result<IndexCreation>;

    /// Returns `false` when there was nothing to delete.
    async fn delete_index(&self, index: &str) -> Result<bool>;
}

/// Opens an [`IndexApi`] once a collection endpoint is known.
pub trait IndexConnector: Send + Sync {
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn IndexApi>>;
}

// ---------------------------------------------------------------------------
// Knowledge base
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeBaseInfo {
    pub id: String,
    pub name: String,
    pub status: String,
}

#[async_trait]
pub trait KnowledgeBaseAdmin: Send + Sync {
    async fn knowledge_base(&self, id: &str) -> Result<Option<KnowledgeBaseInfo>>;

    async fn find_knowledge_base(&self, name: &str) -> Result<Option<KnowledgeBaseInfo>>;

    async fn delete_knowledge_base(&self, id: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionJob {
    pub job_id: String,
    pub status: IngestionStatus,
    pub failure_reasons: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait IngestionApi: Send + Sync {
    async fn start_ingestion(&self, kb_id: &str, data_source_id: &str) -> Result<IngestionJob>;

    async fn ingestion_job(
        &self,
        kb_id: &str,
        data_source_id: &str,
        job_id: &str,
    ) -> Result<IngestionJob>;

    /// Most recently started first.
    async fn list_ingestion_jobs(
        &self,
        kb_id: &str,
        data_source_id: &str,
        limit: usize,
    ) -> Result<Vec<IngestionJob>>;
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievedPassage {
    pub text: String,
    pub score: Option<f64>,
    pub source: Option<String>,
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(
        &self,
        kb_id: &str,
        query: &str,
        max_results: u32,
    ) -> Result<Vec<RetrievedPassage>>;
}

// ---------------------------------------------------------------------------
// Models and storage
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ModelRuntime: Send + Sync {
    /// Invoke a model with a model-family specific JSON body.
    async fn invoke(&self, model_id: &str, body: &Value) -> Result<Value>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<()>;

    /// `None` when the key does not exist.
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>>;

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectSummary>>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_status_classification() {
        assert_eq!(StackPhase::classify("CREATE_IN_PROGRESS"), StackPhase::InProgress);
        assert_eq!(
            StackPhase::classify("UPDATE_COMPLETE_CLEANUP_IN_PROGRESS"),
            StackPhase::InProgress
        );
        assert_eq!(StackPhase::classify("UPDATE_COMPLETE"), StackPhase::Complete);
        assert_eq!(StackPhase::classify("ROLLBACK_COMPLETE"), StackPhase::Failed);
        assert_eq!(StackPhase::classify("UPDATE_ROLLBACK_COMPLETE"), StackPhase::Failed);
        assert_eq!(StackPhase::classify("CREATE_FAILED"), StackPhase::Failed);
    }
}
