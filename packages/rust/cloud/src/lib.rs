//! Cloud service seams and their AWS-backed implementations.

pub mod api;
pub mod aws;
pub mod memory;
pub mod signed;

pub use api::{
    CollectionApi, CollectionInfo, IndexApi, IndexConnector, IndexCreation, IngestionApi,
    IngestionJob, KnowledgeBaseAdmin, KnowledgeBaseInfo, ModelRuntime, ObjectStore,
    ObjectSummary, RetrievedPassage, Retriever, StackDescription, StackEvent, StackPhase,
    StackProvisioner,
};
pub use aws::AwsServices;
pub use memory::MemoryObjectStore;
pub use signed::{SignedIndexClient, SignedIndexConnector};
