//! In-process object store.
//!
//! Backs local runs without a bucket and every test that needs storage.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use claimstack_shared::{ClaimStackError, Result};

use crate::api::{ObjectStore, ObjectSummary};

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), Stored>>,
}

#[derive(Debug, Clone)]
struct Stored {
    body: Vec<u8>,
    content_type: String,
    summary: ObjectSummary,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<(String, String), Stored>>> {
        self.objects
            .lock()
            .map_err(|_| ClaimStackError::Storage("object store lock poisoned".into()))
    }

    /// Content type recorded for a key.
    pub fn content_type(&self, bucket: &str, key: &str) -> Option<String> {
        self.lock()
            .ok()?
            .get(&(bucket.to_string(), key.to_string()))
            .map(|s| s.content_type.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        let summary = ObjectSummary {
            key: key.to_string(),
            size: body.len() as u64,
            last_modified: Some(Utc::now()),
        };
        self.lock()?.insert(
            (bucket.to_string(), key.to_string()),
            Stored {
                body,
                content_type: content_type.to_string(),
                summary,
            },
        );
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .lock()?
            .get(&(bucket.to_string(), key.to_string()))
            .map(|s| s.body.clone()))
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectSummary>> {
        Ok(self
            .lock()?
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|(_, s)| s.summary.clone())
            .collect())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.lock()?.remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_filters_by_bucket_and_prefix() {
        let store = MemoryObjectStore::new();
        store
            .put_object("out", "summaries/a.json", b"{}".to_vec(), "application/json")
            .await
            .unwrap();
        store
            .put_object("out", "feedback/b.json", b"{}".to_vec(), "application/json")
            .await
            .unwrap();
        store
            .put_object("in", "summaries/c.json", b"{}".to_vec(), "application/json")
            .await
            .unwrap();

        let listed = store.list_objects("out", "summaries/").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "summaries/a.json");
        assert_eq!(listed[0].size, 2);
    }

    #[tokio::test]
    async fn missing_key_is_none_and_delete_is_idempotent() {
        let store = MemoryObjectStore::new();
        assert!(store.get_object("b", "k").await.unwrap().is_none());
        store.delete_object("b", "k").await.unwrap();
        store.put_object("b", "k", b"x".to_vec(), "text/plain").await.unwrap();
        assert_eq!(store.content_type("b", "k").as_deref(), Some("text/plain"));
        store.delete_object("b", "k").await.unwrap();
        assert!(store.is_empty());
    }
}
