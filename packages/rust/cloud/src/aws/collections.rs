use async_trait::async_trait;
use aws_sdk_opensearchserverless::Client;
use tracing::instrument;

use claimstack_shared::{CollectionState, Result};

use super::sdk_error;
use crate::api::{CollectionApi, CollectionInfo};

const SERVICE: &str = "opensearchserverless";

/// Search collection control plane.
#[derive(Debug, Clone)]
pub struct ServerlessCollections {
    client: Client,
}

impl ServerlessCollections {
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            client: Client::new(sdk_config),
        }
    }
}

#[async_trait]
impl CollectionApi for ServerlessCollections {
    #[instrument(skip_all, fields(collection = %name))]
    async fn collection(&self, name: &str) -> Result<Option<CollectionInfo>> {
        let resp = self
            .client
            .batch_get_collection()
            .names(name)
            .send()
            .await
            .map_err(|e| sdk_error(SERVICE, e))?;

        Ok(resp
            .collection_details()
            .iter()
            .find(|c| c.name() == Some(name))
            .map(|c| CollectionInfo {
                id: c.id().unwrap_or_default().to_string(),
                name: name.to_string(),
                arn: c.arn().map(str::to_string),
                endpoint: c.collection_endpoint().map(str::to_string),
                state: c
                    .status()
                    .map(|s| CollectionState::parse(s.as_str()))
                    .unwrap_or_else(|| CollectionState::Unknown("UNKNOWN".into())),
            }))
    }
}
