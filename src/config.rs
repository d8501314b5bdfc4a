//! TOML configuration for the `skyq` binary.
//!
//! Every section has serde defaults, so an empty file is a valid
//! configuration. [`load_config`] validates the values that defaults
//! cannot make safe; the result converts into the core's
//! [`QueryPolicy`] and a retention period.

use anyhow::{Context, Result};
use chrono::Duration;
use serde::Deserialize;
use skyquery_core::models::MAX_EXPIRATION_DAYS;
use skyquery_core::policy::{
    QueryPolicy, DEFAULT_ALLOWED_VERBS, DEFAULT_DENIED_TOKENS, DEFAULT_PRIVILEGED_COLLECTIONS,
};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/skyquery.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Blob root: `<queries_path>/<user>/<task_id>.task.json|.result.json`.
    #[serde(default = "default_queries_path")]
    pub queries_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            queries_path: default_queries_path(),
        }
    }
}

fn default_queries_path() -> PathBuf {
    PathBuf::from("./data/queries")
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetentionConfig {
    /// Days a task is kept unless the request overrides it with
    /// `query_expiration_interval`.
    #[serde(default = "default_expiration_days")]
    pub query_expiration_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            query_expiration_days: default_expiration_days(),
        }
    }
}

fn default_expiration_days() -> i64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct PolicyConfig {
    #[serde(default = "default_admin")]
    pub admin_username: String,
    #[serde(default = "default_privileged")]
    pub privileged_collections: Vec<String>,
    /// Replaces the built-in verb allow-list when set.
    #[serde(default)]
    pub allowed_verbs: Option<Vec<String>>,
    /// Replaces the built-in deny-list when set.
    #[serde(default)]
    pub denied_tokens: Option<Vec<String>>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            admin_username: default_admin(),
            privileged_collections: default_privileged(),
            allowed_verbs: None,
            denied_tokens: None,
        }
    }
}

fn default_admin() -> String {
    "admin".to_string()
}

fn default_privileged() -> Vec<String> {
    DEFAULT_PRIVILEGED_COLLECTIONS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn owned(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Config {
    pub fn to_policy(&self) -> QueryPolicy {
        QueryPolicy {
            admin_username: self.policy.admin_username.clone(),
            allowed_verbs: self
                .policy
                .allowed_verbs
                .clone()
                .unwrap_or_else(|| owned(DEFAULT_ALLOWED_VERBS)),
            denied_tokens: self
                .policy
                .denied_tokens
                .clone()
                .unwrap_or_else(|| owned(DEFAULT_DENIED_TOKENS)),
            privileged_collections: self.policy.privileged_collections.iter().cloned().collect(),
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::days(self.retention.query_expiration_days)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if !(1..=MAX_EXPIRATION_DAYS).contains(&config.retention.query_expiration_days) {
        anyhow::bail!(
            "retention.query_expiration_days must be in [1, {}]",
            MAX_EXPIRATION_DAYS
        );
    }

    if config.policy.admin_username.trim().is_empty() {
        anyhow::bail!("policy.admin_username must not be empty");
    }

    if config.storage.queries_path.as_os_str().is_empty() {
        anyhow::bail!("storage.queries_path must not be empty");
    }

    if let Some(verbs) = &config.policy.allowed_verbs {
        if verbs.is_empty() {
            anyhow::bail!("policy.allowed_verbs must list at least one verb when set");
        }
    }

    Ok(config)
}
