//! Storage abstractions for the query core.
//!
//! Three traits split persistence by concern, each implemented in memory
//! here ([`memory`]) and by the app crate on SQLite and the filesystem:
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`DocumentStore`] | Read-only surface a plan executes against |
//! | [`TaskStore`] | Task rows with atomic insert-if-absent and conditional finish |
//! | [`BlobStore`] | Raw request and result payloads addressed by `(user, task_id)` |
//!
//! [`DocumentStore`] has only two required methods; every read operation
//! is provided on top of them with the evaluator in
//! [`matcher`](crate::matcher) and [`pipeline`](crate::pipeline). There is
//! no mutation on the trait.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::HashMap;
use std::fmt;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::general::FindOptions;
use crate::matcher::{compare_values, matches, project, resolve, sort_documents};
use crate::models::{Task, TaskStatus};
use crate::pipeline::{foreign_collections, run_pipeline};

/// Read-only document access.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Names of all collections holding at least one document.
    async fn collection_names(&self) -> Result<Vec<String>>;

    /// Every document of `collection` in insertion order. Unknown
    /// collections are empty.
    async fn load_collection(&self, collection: &str) -> Result<Vec<Value>>;

    async fn find(&self, collection: &str, options: &FindOptions) -> Result<Vec<Value>> {
        let mut docs = Vec::new();
        for doc in self.load_collection(collection).await? {
            if matches(&doc, &options.filter)? {
                docs.push(doc);
            }
        }
        sort_documents(&mut docs, &options.sort);
        let docs = docs.into_iter().skip(options.skip);
        let docs: Vec<Value> = match options.limit {
            Some(limit) => docs.take(limit).collect(),
            None => docs.collect(),
        };
        docs.iter()
            .map(|doc| project(doc, options.projection.as_ref()))
            .collect()
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: &Map<String, Value>,
        projection: Option<&Map<String, Value>>,
    ) -> Result<Option<Value>> {
        for doc in self.load_collection(collection).await? {
            if matches(&doc, filter)? {
                return project(&doc, projection).map(Some);
            }
        }
        Ok(None)
    }

    async fn count_documents(&self, collection: &str, filter: &Map<String, Value>) -> Result<u64> {
        let mut n = 0;
        for doc in self.load_collection(collection).await? {
            if matches(&doc, filter)? {
                n += 1;
            }
        }
        Ok(n)
    }

    /// Distinct values at `key` among matching documents, array fields
    /// contributing their elements.
    async fn distinct(
        &self,
        collection: &str,
        key: &str,
        filter: &Map<String, Value>,
    ) -> Result<Vec<Value>> {
        let mut values: Vec<Value> = Vec::new();
        for doc in self.load_collection(collection).await? {
            if !matches(&doc, filter)? {
                continue;
            }
            for value in resolve(&doc, key) {
                let items = match value {
                    Value::Array(items) => items.clone(),
                    other => vec![other.clone()],
                };
                for item in items {
                    if !values
                        .iter()
                        .any(|v| compare_values(v, &item) == std::cmp::Ordering::Equal)
                    {
                        values.push(item);
                    }
                }
            }
        }
        Ok(values)
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[Map<String, Value>],
    ) -> Result<Vec<Value>> {
        let mut foreign = HashMap::new();
        for name in foreign_collections(pipeline) {
            let docs = self.load_collection(&name).await?;
            foreign.insert(name, docs);
        }
        let docs = self.load_collection(collection).await?;
        run_pipeline(docs, pipeline, &foreign)
    }

    /// Index description in the `{name: {"key": [[field, dir]]}}` shape.
    /// Only the implicit `_id` index exists.
    async fn index_information(&self, collection: &str) -> Result<Value> {
        let exists = self
            .collection_names()
            .await?
            .iter()
            .any(|name| name == collection);
        if exists {
            Ok(json!({"_id_": {"key": [["_id", 1]]}}))
        } else {
            Ok(json!({}))
        }
    }

    /// Map-reduce requires server-side code, which no store evaluates.
    async fn map_reduce(
        &self,
        collection: &str,
        _map: &str,
        _reduce: &str,
        _out: &Value,
    ) -> Result<Value> {
        bail!("map_reduce on `{collection}` is not supported by this store")
    }
}

/// Persistence of task rows.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert `task` unless a row with the same id exists. Returns the
    /// existing row when the id was taken, `None` when `task` was inserted.
    async fn insert_if_absent(&self, task: &Task) -> Result<Option<Task>>;

    async fn get(&self, task_id: &str) -> Result<Option<Task>>;

    /// Move an `Enqueued` task to `status`. Returns `false` when the task
    /// is missing or no longer `Enqueued`.
    async fn finish(
        &self,
        task_id: &str,
        status: TaskStatus,
        result_location: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Returns whether a row was removed.
    async fn delete(&self, task_id: &str) -> Result<bool>;
}

/// Which payload of a task a blob holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobKind {
    Request,
    Result,
}

/// Address of a blob: `<user>/<task_id>.task.json` or `.result.json`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobKey {
    pub user: String,
    pub task_id: String,
    pub kind: BlobKind,
}

impl BlobKey {
    /// Build a key, refusing segments that could escape the blob root.
    pub fn new(user: &str, task_id: &str, kind: BlobKind) -> Result<Self> {
        for (what, segment) in [("user", user), ("task id", task_id)] {
            if segment.is_empty()
                || segment == "."
                || segment == ".."
                || segment.contains(['/', '\\', '\0'])
            {
                bail!("unsafe {what} segment `{segment}` for blob key");
            }
        }
        Ok(Self {
            user: user.to_string(),
            task_id: task_id.to_string(),
            kind,
        })
    }

    pub fn file_name(&self) -> String {
        match self.kind {
            BlobKind::Request => format!("{}.task.json", self.task_id),
            BlobKind::Result => format!("{}.result.json", self.task_id),
        }
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user, self.file_name())
    }
}

/// Durable payload storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write `bytes` at `key`, replacing any previous content. Returns the
    /// location recorded on the task.
    async fn put(&self, key: &BlobKey, bytes: &[u8]) -> Result<String>;

    async fn get(&self, key: &BlobKey) -> Result<Option<Vec<u8>>>;

    /// Returns whether a blob was removed.
    async fn delete(&self, key: &BlobKey) -> Result<bool>;
}
