//! Core orchestration and domain logic for claimstack.
//!
//! This crate ties the declarations, the cloud seams, and the journal
//! together into end-to-end workflows: deploying the stack step by step,
//! bootstrapping the vector index, running ingestion, reporting status,
//! analysing claim documents, and collecting feedback on the analyses.

pub mod bootstrap;
pub mod feedback;
pub mod ingestion;
pub mod orchestrator;
pub mod processing;
pub mod progress;
pub mod status;
pub mod wait;

#[cfg(test)]
mod fakes;

use std::sync::Arc;

use claimstack_cloud::{
    AwsServices, CollectionApi, IndexConnector, IngestionApi, KnowledgeBaseAdmin, ObjectStore,
    StackProvisioner,
};
use claimstack_shared::Result;

pub use claimstack_storage::{RunOutcome, StepOutcome};
pub use orchestrator::{DeployReport, DestroyReport, Orchestrator, RecreateOutcome, StepReport};
pub use progress::{ProgressReporter, SilentProgress};
pub use wait::WaitPolicy;

/// The managed services the deployment workflows drive.
#[derive(Clone)]
pub struct Services {
    pub provisioner: Arc<dyn StackProvisioner>,
    pub collections: Arc<dyn CollectionApi>,
    pub index_connector: Arc<dyn IndexConnector>,
    pub knowledge_bases: Arc<dyn KnowledgeBaseAdmin>,
    pub ingestion: Arc<dyn IngestionApi>,
    pub objects: Arc<dyn ObjectStore>,
}

impl Services {
    pub fn from_aws(aws: &AwsServices) -> Result<Self> {
        Ok(Self {
            provisioner: aws.provisioner(),
            collections: aws.collections(),
            index_connector: aws.index_connector()?,
            knowledge_bases: aws.knowledge_bases(),
            ingestion: aws.ingestion(),
            objects: aws.objects(),
        })
    }
}
