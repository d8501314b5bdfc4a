//! Request orchestration: validate → submit → execute, plus task lookup,
//! deletion, and resuming tasks submitted with `enqueue_only`.
//!
//! A [`QueryService`] is built once at process start from a
//! [`QueryPolicy`], a default retention, and the three stores. It holds no
//! mutable state of its own.

use std::sync::Arc;

use chrono::Duration;
use serde_json::Value;

use crate::engine::Engine;
use crate::error::{QueryError, Rejection};
use crate::models::{
    ExecutionOptions, ExecutionResult, Identity, NormalizedPlan, QueryRequest, ResultOutput, Task,
    TaskStatus,
};
use crate::policy::QueryPolicy;
use crate::store::{BlobKey, BlobKind, BlobStore, DocumentStore, TaskStore};
use crate::task::{Submission, TaskBook};
use crate::validate::Validator;

pub struct QueryService {
    validator: Validator,
    book: TaskBook,
    engine: Engine,
    tasks: Arc<dyn TaskStore>,
    blobs: Arc<dyn BlobStore>,
    retention: Duration,
}

impl QueryService {
    pub fn new(
        policy: QueryPolicy,
        retention: Duration,
        docs: Arc<dyn DocumentStore>,
        tasks: Arc<dyn TaskStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            validator: Validator::new(policy),
            book: TaskBook::new(tasks.clone(), blobs.clone()),
            engine: Engine::new(docs, tasks.clone(), blobs.clone()),
            tasks,
            blobs,
            retention,
        }
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// Validate and run `request` for `caller`.
    ///
    /// Without book-keeping the result comes back inline. With it, a task is
    /// submitted first; a resubmission of an existing task returns that
    /// task's status and result location without running again.
    pub async fn handle(
        &self,
        request: &QueryRequest,
        caller: &Identity,
    ) -> Result<ExecutionResult, QueryError> {
        let raw = serde_json::to_value(request)
            .map_err(|err| QueryError::Persistence(format!("encoding request: {err}")))?;
        self.run(request, &raw, caller).await
    }

    /// Like [`handle`](Self::handle), for a request body as received. The
    /// body is what a saved task persists as its request blob.
    pub async fn handle_value(
        &self,
        raw: &Value,
        caller: &Identity,
    ) -> Result<ExecutionResult, QueryError> {
        let request: QueryRequest = serde_json::from_value(raw.clone())
            .map_err(|err| Rejection::Malformed(format!("invalid request: {err}")))?;
        self.run(&request, raw, caller).await
    }

    async fn run(
        &self,
        request: &QueryRequest,
        raw: &Value,
        caller: &Identity,
    ) -> Result<ExecutionResult, QueryError> {
        let plan = self.validate(request, caller)?;
        let options = ExecutionOptions::from_kwargs(&plan.kwargs)?;
        if !options.book_keeping() {
            return self.engine.execute(&plan, None).await;
        }

        let retention = match options.expiration_days {
            Some(days) => Duration::try_days(days).ok_or_else(|| {
                Rejection::Malformed(format!("expiration interval of {days} days is out of range"))
            })?,
            None => self.retention,
        };
        match self.book.submit(&plan, raw, retention).await? {
            Submission::Existing(task) => Ok(stored_result(&plan, &task)),
            Submission::Created(task) if options.enqueue_only => Ok(stored_result(&plan, &task)),
            Submission::Created(task) => self.engine.execute(&plan, Some(&task)).await,
        }
    }

    fn validate(
        &self,
        request: &QueryRequest,
        caller: &Identity,
    ) -> Result<NormalizedPlan, QueryError> {
        self.validator.validate(request, caller).map_err(|rejection| {
            tracing::warn!(
                user = %caller.username,
                query_type = request.query_type().as_str(),
                reason = %rejection,
                "query rejected"
            );
            QueryError::Rejected(rejection)
        })
    }

    /// Fetch a task visible to `caller` (its owner or the admin).
    pub async fn task(&self, task_id: &str, caller: &Identity) -> Result<Task, QueryError> {
        let task = self
            .tasks
            .get(task_id)
            .await
            .map_err(QueryError::persistence)?
            .ok_or_else(|| QueryError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;
        if task.user != caller.username && !self.validator.policy().is_admin(&caller.username) {
            return Err(QueryError::Forbidden {
                task_id: task_id.to_string(),
            });
        }
        Ok(task)
    }

    /// The persisted result payload of a task, if one was written.
    pub async fn task_result(
        &self,
        task_id: &str,
        caller: &Identity,
    ) -> Result<Option<Value>, QueryError> {
        let task = self.task(task_id, caller).await?;
        let Some(bytes) = self.read_blob(&task, BlobKind::Result).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| QueryError::Persistence(format!("decoding result payload: {err}")))
    }

    /// Remove the task row, then its request and result blobs.
    pub async fn delete_task(&self, task_id: &str, caller: &Identity) -> Result<(), QueryError> {
        let task = self.task(task_id, caller).await?;
        self.tasks
            .delete(&task.task_id)
            .await
            .map_err(QueryError::persistence)?;
        for kind in [BlobKind::Request, BlobKind::Result] {
            let key =
                BlobKey::new(&task.user, &task.task_id, kind).map_err(QueryError::persistence)?;
            self.blobs
                .delete(&key)
                .await
                .map_err(QueryError::persistence)?;
        }
        tracing::info!(task_id = %task.task_id, "task deleted");
        Ok(())
    }

    /// Run a task that was submitted with `enqueue_only`. The stored request
    /// is validated again as the task's owner, under the current policy.
    pub async fn run_enqueued(
        &self,
        task_id: &str,
        caller: &Identity,
    ) -> Result<ExecutionResult, QueryError> {
        let task = self.task(task_id, caller).await?;
        if task.status != TaskStatus::Enqueued {
            return Err(QueryError::NotEnqueued {
                task_id: task.task_id,
                status: task.status,
            });
        }

        let bytes = self
            .read_blob(&task, BlobKind::Request)
            .await?
            .ok_or_else(|| {
                QueryError::Persistence(format!("request blob for task `{task_id}` is missing"))
            })?;
        let request: QueryRequest = serde_json::from_slice(&bytes)
            .map_err(|err| QueryError::Persistence(format!("decoding stored request: {err}")))?;

        let owner = Identity::new(task.user.clone());
        let plan = match self.validate(&request, &owner) {
            Ok(plan) => plan,
            Err(QueryError::Rejected(rejection)) => {
                self.engine.fail(&task, &rejection.to_string()).await?;
                return Err(QueryError::Rejected(rejection));
            }
            Err(other) => return Err(other),
        };
        self.engine.execute(&plan, Some(&task)).await
    }

    async fn read_blob(&self, task: &Task, kind: BlobKind) -> Result<Option<Vec<u8>>, QueryError> {
        let key = BlobKey::new(&task.user, &task.task_id, kind).map_err(QueryError::persistence)?;
        self.blobs.get(&key).await.map_err(QueryError::persistence)
    }
}

fn stored_result(plan: &NormalizedPlan, task: &Task) -> ExecutionResult {
    ExecutionResult {
        user: plan.user.clone(),
        status: task.status,
        kwargs: plan.kwargs.clone(),
        task_id: Some(task.task_id.clone()),
        output: ResultOutput::Stored {
            result: task.result_location.clone(),
        },
    }
}
