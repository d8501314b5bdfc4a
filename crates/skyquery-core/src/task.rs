//! Task identity and submission.
//!
//! A task id is the SHA-256 of the canonical JSON (keys sorted at every
//! level, no whitespace) of
//!
//! ```json
//! {"kwargs": {...}, "query": <plan body>, "query_type": "...", "user": "..."}
//! ```
//!
//! where `kwargs` excludes [`VOLATILE_KWARGS`], so resubmitting with a
//! different expiration or book-keeping switch maps to the same task.
//!
//! [`TaskBook::submit`] writes the raw request blob first and inserts the
//! row second: the only possible partial state is an orphaned blob, never a
//! row pointing at nothing. The row insert is insert-if-absent, so of two
//! concurrent submissions exactly one creates the task and the other
//! observes it.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{QueryError, Rejection};
use crate::models::{NormalizedPlan, Task, TaskStatus, VOLATILE_KWARGS};
use crate::store::{BlobKey, BlobKind, BlobStore, TaskStore};

/// Copy of `value` with object keys sorted recursively.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Deterministic content hash of a plan.
pub fn compute_task_id(plan: &NormalizedPlan) -> String {
    let mut kwargs = plan.kwargs.clone();
    for key in VOLATILE_KWARGS {
        kwargs.remove(key);
    }
    let identity = canonicalize(&json!({
        "user": plan.user,
        "query_type": plan.query_type().as_str(),
        "query": plan.body.to_json(),
        "kwargs": kwargs,
    }));
    let mut hasher = Sha256::new();
    hasher.update(identity.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Outcome of [`TaskBook::submit`].
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// A new `Enqueued` task was recorded.
    Created(Task),
    /// A task with the same id already existed; nothing was written to it.
    Existing(Task),
}

impl Submission {
    pub fn task(&self) -> &Task {
        match self {
            Self::Created(task) | Self::Existing(task) => task,
        }
    }
}

#[derive(Clone)]
pub struct TaskBook {
    tasks: Arc<dyn TaskStore>,
    blobs: Arc<dyn BlobStore>,
}

impl TaskBook {
    pub fn new(tasks: Arc<dyn TaskStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { tasks, blobs }
    }

    pub async fn submit(
        &self,
        plan: &NormalizedPlan,
        raw: &Value,
        retention: Duration,
    ) -> Result<Submission, QueryError> {
        let task_id = compute_task_id(plan);

        if let Some(existing) = self
            .tasks
            .get(&task_id)
            .await
            .map_err(QueryError::persistence)?
        {
            tracing::info!(task_id = %task_id, status = %existing.status, "task already submitted");
            return Ok(Submission::Existing(existing));
        }

        let now = Utc::now();
        let expires_at = now.checked_add_signed(retention).ok_or_else(|| {
            QueryError::Rejected(Rejection::Malformed(format!(
                "retention of {} days is out of range",
                retention.num_days()
            )))
        })?;

        let key = BlobKey::new(&plan.user, &task_id, BlobKind::Request)
            .map_err(QueryError::persistence)?;
        let bytes = serde_json::to_vec_pretty(raw)
            .map_err(|err| QueryError::Persistence(format!("encoding request: {err}")))?;
        let request_location = self
            .blobs
            .put(&key, &bytes)
            .await
            .map_err(QueryError::persistence)?;

        let task = Task {
            task_id: task_id.clone(),
            user: plan.user.clone(),
            request_location,
            result_location: None,
            status: TaskStatus::Enqueued,
            created_at: now,
            expires_at,
            last_modified_at: now,
        };
        match self
            .tasks
            .insert_if_absent(&task)
            .await
            .map_err(QueryError::persistence)?
        {
            Some(winner) => {
                tracing::warn!(task_id = %task_id, "concurrent submission won the insert");
                Ok(Submission::Existing(winner))
            }
            None => {
                tracing::info!(task_id = %task_id, user = %task.user, "task enqueued");
                Ok(Submission::Created(task))
            }
        }
    }
}
