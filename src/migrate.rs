use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Catalog documents, one JSON body per row; seq keeps insertion order
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            collection TEXT NOT NULL,
            doc_id TEXT NOT NULL,
            body TEXT NOT NULL,
            UNIQUE(collection, doc_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Task rows; timestamps are unix milliseconds
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            task_id TEXT PRIMARY KEY,
            user TEXT NOT NULL,
            request_location TEXT NOT NULL,
            result_location TEXT,
            status TEXT NOT NULL CHECK (status IN ('enqueued', 'done', 'failed')),
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            last_modified_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection, seq)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks(user)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_expires_at ON tasks(expires_at)")
        .execute(pool)
        .await?;

    Ok(())
}
