//! SQLite implementations of the core [`DocumentStore`] and [`TaskStore`].
//!
//! Documents are stored as JSON text per `(collection, doc_id)` and read
//! back whole; filtering happens in the core evaluator. Task timestamps
//! are unix milliseconds.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use skyquery_core::models::{Task, TaskStatus};
use skyquery_core::store::{DocumentStore, TaskStore};

#[derive(Clone)]
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert documents into `collection`, keyed by their `_id`. Every
    /// document must be an object carrying an `_id`. Returns the number of
    /// documents written.
    pub async fn insert_documents(&self, collection: &str, docs: &[Value]) -> Result<u64> {
        if collection.is_empty() {
            bail!("collection name must not be empty");
        }
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for (i, doc) in docs.iter().enumerate() {
            let id = doc
                .get("_id")
                .ok_or_else(|| anyhow!("document {i} of `{collection}` has no `_id`"))?;
            let doc_id = match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            sqlx::query(
                r#"
                INSERT INTO documents (collection, doc_id, body) VALUES (?, ?, ?)
                ON CONFLICT(collection, doc_id) DO UPDATE SET body = excluded.body
                "#,
            )
            .bind(collection)
            .bind(&doc_id)
            .bind(doc.to_string())
            .execute(&mut *tx)
            .await?;
            written += 1;
        }
        tx.commit().await?;
        Ok(written)
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn collection_names(&self) -> Result<Vec<String>> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT collection FROM documents ORDER BY collection")
                .fetch_all(&self.pool)
                .await?;
        Ok(names)
    }

    async fn load_collection(&self, collection: &str) -> Result<Vec<Value>> {
        let bodies: Vec<String> =
            sqlx::query_scalar("SELECT body FROM documents WHERE collection = ? ORDER BY seq")
                .bind(collection)
                .fetch_all(&self.pool)
                .await
                .with_context(|| format!("loading collection `{collection}`"))?;
        bodies
            .iter()
            .map(|body| {
                serde_json::from_str(body)
                    .with_context(|| format!("corrupt document in `{collection}`"))
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const TASK_COLUMNS: &str = "task_id, user, request_location, result_location, status, \
                            created_at, expires_at, last_modified_at";

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp {ms} out of range"))
}

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    let status: String = row.get("status");
    Ok(Task {
        task_id: row.get("task_id"),
        user: row.get("user"),
        request_location: row.get("request_location"),
        result_location: row.get("result_location"),
        status: status.parse()?,
        created_at: from_millis(row.get("created_at"))?,
        expires_at: from_millis(row.get("expires_at"))?,
        last_modified_at: from_millis(row.get("last_modified_at"))?,
    })
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert_if_absent(&self, task: &Task) -> Result<Option<Task>> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO tasks (task_id, user, request_location, result_location, status,
                               created_at, expires_at, last_modified_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(task_id) DO NOTHING
            "#,
        )
        .bind(&task.task_id)
        .bind(&task.user)
        .bind(&task.request_location)
        .bind(&task.result_location)
        .bind(task.status.as_str())
        .bind(task.created_at.timestamp_millis())
        .bind(task.expires_at.timestamp_millis())
        .bind(task.last_modified_at.timestamp_millis())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(None);
        }
        self.get(&task.task_id)
            .await?
            .map(Some)
            .ok_or_else(|| anyhow!("task `{}` conflicted but is gone", task.task_id))
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?"))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn finish(
        &self,
        task_id: &str,
        status: TaskStatus,
        result_location: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        if !TaskStatus::Enqueued.can_transition_to(&status) {
            return Ok(false);
        }
        let updated = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, result_location = ?, last_modified_at = ?
            WHERE task_id = ? AND status = 'enqueued'
            "#,
        )
        .bind(status.as_str())
        .bind(result_location)
        .bind(at.timestamp_millis())
        .bind(task_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    async fn delete(&self, task_id: &str) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }
}
