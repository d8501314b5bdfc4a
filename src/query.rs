//! `skyq query`: run one request file through the query service.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use serde_json::Value;
use skyquery_core::models::Identity;
use skyquery_core::service::QueryService;

use crate::blobs::FsBlobStore;
use crate::config::Config;
use crate::db;
use crate::sqlite_store::{SqliteDocumentStore, SqliteTaskStore};

/// Wire the core service to the SQLite and filesystem stores named in
/// `config`. The pool is returned so the caller can close it.
pub async fn build_service(config: &Config) -> Result<(QueryService, SqlitePool)> {
    let pool = db::connect(config).await?;
    let service = QueryService::new(
        config.to_policy(),
        config.retention(),
        Arc::new(SqliteDocumentStore::new(pool.clone())),
        Arc::new(SqliteTaskStore::new(pool.clone())),
        Arc::new(FsBlobStore::new(config.storage.queries_path.clone())),
    );
    Ok((service, pool))
}

/// The request body as written, kept verbatim for the task's request blob.
pub fn read_request(file: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read request file: {}", file.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid request in {}", file.display()))
}

pub async fn run_query(config: &Config, user: &str, file: &Path) -> Result<()> {
    let request = read_request(file)?;
    let (service, pool) = build_service(config).await?;
    let outcome = service.handle_value(&request, &Identity::new(user)).await;
    pool.close().await;

    let result = outcome?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
