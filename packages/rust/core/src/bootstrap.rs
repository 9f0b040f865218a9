//! Vector index bootstrap.
//!
//! Creates the knowledge base's vector index on an `ACTIVE` collection.
//! Creation is idempotent for an identical configuration; an existing index
//! with a different configuration is never altered in place and surfaces as
//! a configuration conflict, to be resolved with [`recreate_index`].

use std::sync::Arc;

use tracing::{info, instrument, warn};

use claimstack_cloud::{
    CollectionApi, IndexApi, IndexConnector, IndexCreation, KnowledgeBaseAdmin,
};
use claimstack_shared::{
    ClaimStackError, CollectionState, EmbeddingModel, Result, VectorIndexSpec,
};

use crate::progress::ProgressReporter;
use crate::wait::{PollState, WaitPolicy, poll_until};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Created,
    /// An index with the declared configuration was already there.
    AlreadyPresent,
}

/// Open the data plane of `collection_name`, refusing unless it is `ACTIVE`.
async fn active_index_api(
    collections: &dyn CollectionApi,
    connector: &dyn IndexConnector,
    collection_name: &str,
) -> Result<Arc<dyn IndexApi>> {
    let resource = format!("collection {collection_name}");
    let collection = collections
        .collection(collection_name)
        .await?
        .ok_or_else(|| ClaimStackError::not_ready(&resource, "MISSING"))?;

    if collection.state != CollectionState::Active {
        return Err(ClaimStackError::not_ready(resource, &collection.state));
    }
    let endpoint = collection
        .endpoint
        .ok_or_else(|| ClaimStackError::not_ready(&resource, "ACTIVE without endpoint"))?;
    connector.connect(&endpoint)
}

/// `true` when the index exists and matches the declaration.
async fn check_existing(index: &dyn IndexApi, spec: &VectorIndexSpec) -> Result<bool> {
    let Some(shape) = index.index_shape(&spec.name, &spec.vector_field).await? else {
        return Ok(false);
    };
    let differences = spec.differences(&shape);
    if differences.is_empty() {
        Ok(true)
    } else {
        Err(ClaimStackError::conflict(format!(
            "index {} exists with a different configuration ({}); delete and recreate it with `claimstack index recreate`",
            spec.name,
            differences.join(", ")
        )))
    }
}

/// Ensure the declared index exists on the collection.
#[instrument(skip_all, fields(collection = %collection_name, index = %spec.name))]
pub async fn ensure_index(
    collections: &dyn CollectionApi,
    connector: &dyn IndexConnector,
    collection_name: &str,
    spec: &VectorIndexSpec,
    model: &EmbeddingModel,
) -> Result<IndexOutcome> {
    model.check_dimension(spec.dimension)?;
    let index = active_index_api(collections, connector, collection_name).await?;

    if check_existing(index.as_ref(), spec).await? {
        info!("index already present with matching configuration");
        return Ok(IndexOutcome::AlreadyPresent);
    }

    match index.create_index(spec).await? {
        IndexCreation::Created => {
            info!(dimension = spec.dimension, "index created");
            Ok(IndexOutcome::Created)
        }
        IndexCreation::AlreadyExists => {
            // Lost a creation race; the winner's configuration must match.
            check_existing(index.as_ref(), spec).await?;
            Ok(IndexOutcome::AlreadyPresent)
        }
    }
}

/// What [`recreate_index`] removed on its way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecreateReport {
    pub deleted_knowledge_base: Option<String>,
    pub deleted_index: bool,
}

/// Knowledge base that may still reference the index.
#[derive(Debug, Clone, Copy)]
pub struct KnowledgeBaseRef<'a> {
    pub id: Option<&'a str>,
    pub name: &'a str,
}

/// Delete the knowledge base referencing the index (if any), then the index,
/// then create it again from the declaration.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(collection = %collection_name, index = %spec.name))]
pub async fn recreate_index(
    knowledge_bases: &dyn KnowledgeBaseAdmin,
    collections: &dyn CollectionApi,
    connector: &dyn IndexConnector,
    collection_name: &str,
    spec: &VectorIndexSpec,
    model: &EmbeddingModel,
    kb: KnowledgeBaseRef<'_>,
    kb_wait: &WaitPolicy,
    progress: &dyn ProgressReporter,
) -> Result<RecreateReport> {
    model.check_dimension(spec.dimension)?;
    let index = active_index_api(collections, connector, collection_name).await?;
    let mut report = RecreateReport::default();

    let existing = match kb.id {
        Some(id) => knowledge_bases.knowledge_base(id).await?,
        None => knowledge_bases.find_knowledge_base(kb.name).await?,
    };
    if let Some(existing) = existing {
        progress.phase("Deleting knowledge base");
        warn!(kb_id = %existing.id, "deleting knowledge base that references the index");
        knowledge_bases.delete_knowledge_base(&existing.id).await?;

        let what = format!("knowledge base {} deletion", existing.id);
        poll_until(kb_wait, &what, progress, || {
            let id = existing.id.clone();
            async move {
                Ok(match knowledge_bases.knowledge_base(&id).await? {
                    None => PollState::Ready(()),
                    Some(kb) => PollState::Pending(kb.status),
                })
            }
        })
        .await?;
        report.deleted_knowledge_base = Some(existing.id);
    }

    progress.phase("Deleting vector index");
    report.deleted_index = index.delete_index(&spec.name).await?;

    progress.phase("Creating vector index");
    match index.create_index(spec).await? {
        IndexCreation::Created => {}
        IndexCreation::AlreadyExists => {
            return Err(ClaimStackError::conflict(format!(
                "index {} reappeared before it could be recreated",
                spec.name
            )));
        }
    }
    info!(dimension = spec.dimension, "index recreated");
    Ok(report)
}
