// src/store.rs
//
// Document persistence seam. Every write goes through insert-if-absent so
// redelivered events never produce a second document.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub mod mongo;

pub use mongo::MongoStore;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("document store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid document for '{collection}': {reason}")]
    InvalidDocument { collection: String, reason: String },
}

/// A persisted document and whether this call created it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub document: Value,
    pub created: bool,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Stores `document` under `key` unless a document with that key exists,
    /// in which case the existing one is returned with `created == false`.
    async fn insert_if_absent(
        &self,
        collection: &str,
        key: &str,
        document: Value,
    ) -> Result<StoredDocument, StoreError>;

    async fn find(&self, collection: &str, key: &str) -> Result<Option<StoredDocument>, StoreError>;

    async fn count(&self, collection: &str) -> Result<usize, StoreError>;
}

/// Process-local store for tests and `STORE_BACKEND=memory`.
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, HashMap<String, StoredDocument>>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: every call fails while unavailable.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn collections(&self) -> MutexGuard<'_, HashMap<String, HashMap<String, StoredDocument>>> {
        self.collections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_if_absent(
        &self,
        collection: &str,
        key: &str,
        mut document: Value,
    ) -> Result<StoredDocument, StoreError> {
        self.check_available()?;
        let Some(fields) = document.as_object_mut() else {
            return Err(StoreError::InvalidDocument {
                collection: collection.to_string(),
                reason: "document must be a JSON object".into(),
            });
        };

        let mut collections = self.collections();
        let documents = collections.entry(collection.to_string()).or_default();
        if let Some(existing) = documents.get(key) {
            debug!(collection, key, "Document already present");
            return Ok(StoredDocument {
                created: false,
                ..existing.clone()
            });
        }

        let id = Uuid::new_v4().to_string();
        fields.insert("_id".into(), Value::String(id.clone()));
        let stored = StoredDocument {
            id,
            document,
            created: true,
        };
        documents.insert(key.to_string(), stored.clone());
        Ok(stored)
    }

    async fn find(&self, collection: &str, key: &str) -> Result<Option<StoredDocument>, StoreError> {
        self.check_available()?;
        Ok(self
            .collections()
            .get(collection)
            .and_then(|documents| documents.get(key))
            .map(|doc| StoredDocument {
                created: false,
                ..doc.clone()
            }))
    }

    async fn count(&self, collection: &str) -> Result<usize, StoreError> {
        self.check_available()?;
        Ok(self.collections().get(collection).map_or(0, HashMap::len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_if_absent_keeps_first_document() {
        let store = MemoryStore::new();
        let first = store
            .insert_if_absent("suggestions", "u1:s1", json!({"recipe_count": 1}))
            .await
            .unwrap();
        let second = store
            .insert_if_absent("suggestions", "u1:s1", json!({"recipe_count": 9}))
            .await
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_eq!(second.document["recipe_count"], 1);
        assert_eq!(second.document["_id"], first.id.as_str());
        assert_eq!(store.count("suggestions").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_non_object_document_is_rejected() {
        let store = MemoryStore::new();
        let err = store
            .insert_if_absent("shopping_lists", "p1", json!([1, 2]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidDocument { .. }));
    }

    #[tokio::test]
    async fn test_outage_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(store.find("suggestions", "k").await.is_err());
        assert!(store
            .insert_if_absent("suggestions", "k", json!({}))
            .await
            .is_err());

        store.set_available(true);
        assert_eq!(store.find("suggestions", "k").await.unwrap(), None);
    }
}
