use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::{ByteStream, DateTime as SmithyDateTime};
use tracing::instrument;

use claimstack_shared::{ClaimStackError, Result};

use super::{sdk_error, timestamp};
use crate::api::{ObjectStore, ObjectSummary};

const SERVICE: &str = "s3";

#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            client: Client::new(sdk_config),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip_all, fields(bucket = %bucket, key = %key, bytes = body.len()))]
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| sdk_error(SERVICE, e))?;
        Ok(())
    }

    #[instrument(skip_all, fields(bucket = %bucket, key = %key))]
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let resp = match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(resp) => resp,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                return Ok(None);
            }
            Err(err) => return Err(sdk_error(SERVICE, err)),
        };
        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|e| ClaimStackError::external(SERVICE, format!("reading {key}: {e}")))?
            .into_bytes();
        Ok(Some(bytes.to_vec()))
    }

    #[instrument(skip_all, fields(bucket = %bucket, prefix = %prefix))]
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectSummary>> {
        let mut objects = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| sdk_error(SERVICE, e))?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                let size: Option<i64> = object.size().into();
                let modified: Option<&SmithyDateTime> = object.last_modified().into();
                objects.push(ObjectSummary {
                    key: key.to_string(),
                    size: size.and_then(|s| u64::try_from(s).ok()).unwrap_or(0),
                    last_modified: modified.and_then(timestamp),
                });
            }
        }
        Ok(objects)
    }

    #[instrument(skip_all, fields(bucket = %bucket, key = %key))]
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error(SERVICE, e))?;
        Ok(())
    }
}
