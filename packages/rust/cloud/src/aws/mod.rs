//! AWS-backed implementations of the service seams.
//!
//! One [`AwsServices`] is loaded per process from the standard credential
//! chain (optionally a named profile) and hands out trait objects for each
//! seam.

mod bedrock;
mod cloudformation;
mod collections;
mod s3;

use std::sync::Arc;

use aws_config::BehaviorVersion;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::DateTime as SmithyDateTime;
use aws_smithy_runtime_api::client::result::SdkError;
use chrono::{DateTime, Utc};

use claimstack_shared::{ClaimStackError, Result};

use crate::api::{
    CollectionApi, IndexConnector, IngestionApi, KnowledgeBaseAdmin, ModelRuntime, ObjectStore,
    Retriever, StackProvisioner,
};
use crate::signed::SignedIndexConnector;

pub use bedrock::{BedrockAgent, BedrockRetriever, BedrockRuntime};
pub use cloudformation::CloudFormationProvisioner;
pub use collections::ServerlessCollections;
pub use s3::S3ObjectStore;

/// Every AWS client the pipeline needs, built from one shared SDK config.
#[derive(Clone)]
pub struct AwsServices {
    region: String,
    sdk_config: aws_config::SdkConfig,
}

impl std::fmt::Debug for AwsServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsServices")
            .field("region", &self.region)
            .finish()
    }
}

impl AwsServices {
    /// Resolve region and credentials.
    pub async fn load(region: &str, profile: Option<&str>) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()));
        if let Some(profile) = profile {
            loader = loader.profile_name(profile);
        }
        let sdk_config = loader.load().await;

        if sdk_config.credentials_provider().is_none() {
            return Err(ClaimStackError::operator(
                "no AWS credentials found: configure a profile or set AWS_ACCESS_KEY_ID/AWS_SECRET_ACCESS_KEY",
            ));
        }

        tracing::debug!(region, profile = profile.unwrap_or("default"), "AWS config loaded");
        Ok(Self {
            region: region.to_string(),
            sdk_config,
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn provisioner(&self) -> Arc<dyn StackProvisioner> {
        Arc::new(CloudFormationProvisioner::new(&self.sdk_config))
    }

    pub fn collections(&self) -> Arc<dyn CollectionApi> {
        Arc::new(ServerlessCollections::new(&self.sdk_config))
    }

    pub fn index_connector(&self) -> Result<Arc<dyn IndexConnector>> {
        let credentials = self.sdk_config.credentials_provider().ok_or_else(|| {
            ClaimStackError::operator("no AWS credentials available for index requests")
        })?;
        Ok(Arc::new(SignedIndexConnector::new(
            self.region.clone(),
            credentials,
        )))
    }

    pub fn knowledge_bases(&self) -> Arc<dyn KnowledgeBaseAdmin> {
        Arc::new(BedrockAgent::new(&self.sdk_config))
    }

    pub fn ingestion(&self) -> Arc<dyn IngestionApi> {
        Arc::new(BedrockAgent::new(&self.sdk_config))
    }

    pub fn models(&self) -> Arc<dyn ModelRuntime> {
        Arc::new(BedrockRuntime::new(&self.sdk_config))
    }

    pub fn retriever(&self) -> Arc<dyn Retriever> {
        Arc::new(BedrockRetriever::new(&self.sdk_config))
    }

    pub fn objects(&self) -> Arc<dyn ObjectStore> {
        Arc::new(S3ObjectStore::new(&self.sdk_config))
    }
}

/// Map any SDK failure to an external-call error with the full error chain.
fn sdk_error<E, R>(service: &str, err: SdkError<E, R>) -> ClaimStackError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    ClaimStackError::external(service, DisplayErrorContext(&err))
}

/// Every SDK crate re-exports the same smithy `DateTime`.
fn timestamp(dt: &SmithyDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}
