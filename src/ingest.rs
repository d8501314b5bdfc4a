//! Catalog loader behind `skyq load`.
//!
//! Accepts a JSON array of documents or JSON lines (one document per
//! non-empty line). Documents without `_id` get a fresh UUID. Loading the
//! same `_id` twice replaces the stored body.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::path::Path;
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteDocumentStore;

pub async fn run_load(config: &Config, collection: &str, file: &Path) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let docs = parse_documents(&text).with_context(|| format!("parsing {}", file.display()))?;

    let pool = db::connect(config).await?;
    let store = SqliteDocumentStore::new(pool.clone());
    let written = store.insert_documents(collection, &docs).await?;
    tracing::info!(collection, documents = written, "collection loaded");

    println!("load {}", collection);
    println!("  read: {} documents", docs.len());
    println!("  upserted documents: {}", written);
    println!("ok");

    pool.close().await;
    Ok(())
}

pub fn parse_documents(text: &str) -> Result<Vec<Value>> {
    let trimmed = text.trim_start();
    let raw: Vec<Value> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).context("expected a JSON array of documents")?
    } else {
        trimmed
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line).with_context(|| format!("line {}", i + 1))
            })
            .collect::<Result<_>>()?
    };

    raw.into_iter()
        .enumerate()
        .map(|(i, doc)| match doc {
            Value::Object(mut map) => {
                if !map.contains_key("_id") {
                    map.insert("_id".to_string(), Value::String(Uuid::new_v4().to_string()));
                }
                Ok(Value::Object(map))
            }
            other => bail!("document {} is not an object: {}", i + 1, other),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_array_input() {
        let docs = parse_documents(r#"[{"_id": "a", "mag": 1}, {"_id": 2}]"#).unwrap();
        assert_eq!(docs, vec![json!({"_id": "a", "mag": 1}), json!({"_id": 2})]);
    }

    #[test]
    fn test_json_lines_assign_ids() {
        let docs = parse_documents("{\"mag\": 1}\n\n{\"_id\": \"b\"}\n").unwrap();
        assert_eq!(docs.len(), 2);
        let id = docs[0]["_id"].as_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
        assert_eq!(docs[1]["_id"], "b");
    }

    #[test]
    fn test_rejects_non_objects() {
        let err = parse_documents("[1]").unwrap_err();
        assert!(err.to_string().contains("not an object"));
        let err = parse_documents("{\"a\": 1}\nnot json\n").unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
    }
}
