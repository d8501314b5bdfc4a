//! In-memory store implementations for testing and embedding.
//!
//! Collections, task rows, and blobs live in maps behind `parking_lot`
//! locks. Task insertion and finishing happen under a single write lock,
//! so insert-if-absent and the conditional finish are atomic.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;

use crate::models::{Task, TaskStatus};

use super::{BlobKey, BlobStore, DocumentStore, TaskStore};

/// Collections of JSON documents, kept in insertion order.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_documents(&self, collection: &str, docs: impl IntoIterator<Item = Value>) {
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .extend(docs);
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn collection_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .collections
            .read()
            .iter()
            .filter(|(_, docs)| !docs.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn load_collection(&self, collection: &str) -> Result<Vec<Value>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<String, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert_if_absent(&self, task: &Task) -> Result<Option<Task>> {
        let mut tasks = self.tasks.write();
        if let Some(existing) = tasks.get(&task.task_id) {
            return Ok(Some(existing.clone()));
        }
        tasks.insert(task.task_id.clone(), task.clone());
        Ok(None)
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.read().get(task_id).cloned())
    }

    async fn finish(
        &self,
        task_id: &str,
        status: TaskStatus,
        result_location: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tasks = self.tasks.write();
        match tasks.get_mut(task_id) {
            Some(task) if task.status.can_transition_to(&status) => {
                task.status = status;
                task.result_location = result_location.map(str::to_string);
                task.last_modified_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, task_id: &str) -> Result<bool> {
        Ok(self.tasks.write().remove(task_id).is_some())
    }
}

/// Blobs addressed as `memory://<user>/<file>`.
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<BlobKey, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &BlobKey, bytes: &[u8]) -> Result<String> {
        self.blobs.write().insert(key.clone(), bytes.to_vec());
        Ok(format!("memory://{key}"))
    }

    async fn get(&self, key: &BlobKey) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().get(key).cloned())
    }

    async fn delete(&self, key: &BlobKey) -> Result<bool> {
        Ok(self.blobs.write().remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::general::FindOptions;
    use crate::store::BlobKind;
    use chrono::Duration;
    use serde_json::json;

    fn task(id: &str) -> Task {
        let now = Utc::now();
        Task {
            task_id: id.to_string(),
            user: "alice".to_string(),
            request_location: format!("memory://alice/{id}.task.json"),
            result_location: None,
            status: TaskStatus::Enqueued,
            created_at: now,
            expires_at: now + Duration::days(30),
            last_modified_at: now,
        }
    }

    #[tokio::test]
    async fn test_insert_if_absent_keeps_first() {
        let store = InMemoryTaskStore::new();
        assert!(store.insert_if_absent(&task("t1")).await.unwrap().is_none());
        let mut other = task("t1");
        other.user = "bob".to_string();
        let existing = store.insert_if_absent(&other).await.unwrap().unwrap();
        assert_eq!(existing.user, "alice");
    }

    #[tokio::test]
    async fn test_finish_is_monotonic() {
        let store = InMemoryTaskStore::new();
        store.insert_if_absent(&task("t1")).await.unwrap();
        let now = Utc::now();
        assert!(store
            .finish("t1", TaskStatus::Done, Some("memory://alice/t1.result.json"), now)
            .await
            .unwrap());
        assert!(!store.finish("t1", TaskStatus::Failed, None, now).await.unwrap());
        let stored = store.get("t1").await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Done);
        assert!(!store.finish("missing", TaskStatus::Done, None, now).await.unwrap());
        assert!(store.delete("t1").await.unwrap());
        assert!(store.get("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blob_roundtrip() {
        let blobs = InMemoryBlobStore::new();
        let key = BlobKey::new("alice", "t1", BlobKind::Result).unwrap();
        let location = blobs.put(&key, b"{}").await.unwrap();
        assert_eq!(location, "memory://alice/t1.result.json");
        assert_eq!(blobs.get(&key).await.unwrap().unwrap(), b"{}".to_vec());
        assert!(blobs.delete(&key).await.unwrap());
        assert!(blobs.is_empty());
    }

    #[tokio::test]
    async fn test_document_reads() {
        let store = InMemoryDocumentStore::new();
        store.insert_documents(
            "sources",
            vec![
                json!({"_id": 1, "mag": 18.0, "f": ["g", "r"]}),
                json!({"_id": 2, "mag": 17.0, "f": ["r"]}),
                json!({"_id": 3, "mag": 19.0, "f": []}),
            ],
        );
        let opts = FindOptions {
            sort: vec![("mag".to_string(), 1)],
            limit: Some(2),
            projection: Some(json!({"_id": 1}).as_object().cloned().unwrap()),
            ..FindOptions::default()
        };
        assert_eq!(
            store.find("sources", &opts).await.unwrap(),
            vec![json!({"_id": 2}), json!({"_id": 1})]
        );
        let filter = json!({"mag": {"$gt": 17.5}}).as_object().cloned().unwrap();
        assert_eq!(store.count_documents("sources", &filter).await.unwrap(), 2);
        assert_eq!(
            store
                .distinct("sources", "f", &serde_json::Map::new())
                .await
                .unwrap(),
            vec![json!("g"), json!("r")]
        );
        assert_eq!(
            store.index_information("sources").await.unwrap(),
            json!({"_id_": {"key": [["_id", 1]]}})
        );
        assert_eq!(store.index_information("nope").await.unwrap(), json!({}));
        assert!(store
            .map_reduce("sources", "function(){}", "function(){}", &json!("out"))
            .await
            .is_err());
        assert_eq!(
            store.collection_names().await.unwrap(),
            vec!["sources".to_string()]
        );
    }
}
