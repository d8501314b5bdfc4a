//! # skyquery CLI (`skyq`)
//!
//! Operator shell around the query core: database setup, catalog loading,
//! running query requests, and managing saved tasks.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `skyq init` | Create the SQLite database and run schema migrations |
//! | `skyq load <collection> <file>` | Load JSON or JSON-lines documents into a collection |
//! | `skyq query --user <u> <request.json>` | Validate and run a query request |
//! | `skyq task show <id> --user <u>` | Print a task and its result payload |
//! | `skyq task delete <id> --user <u>` | Delete a task and its payloads |
//! | `skyq task run <id> --user <u>` | Run a task submitted with `enqueue_only` |
//!
//! ## Examples
//!
//! ```bash
//! skyq init --config ./config/skyquery.toml
//! skyq load sources ./ztf_sources.jsonl
//! skyq query --user alice ./cone.json
//! skyq task run 3f2a... --user alice
//! ```
//!
//! Logs go to stderr and are filtered with `RUST_LOG` (default `info`);
//! stdout carries only command output.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use skyquery::{config, ingest, migrate, query, tasks};

/// skyquery: validated read-only catalog queries and cone searches.
#[derive(Parser)]
#[command(name = "skyq", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/skyquery.toml`. Database, blob storage,
    /// retention, and query policy settings are read from this file.
    #[arg(long, global = true, default_value = "./config/skyquery.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Load documents into a catalog collection.
    ///
    /// The file holds a JSON array of objects or one object per line.
    /// Documents are upserted by `_id`; missing ids get a UUID.
    Load {
        /// Target collection name.
        collection: String,
        /// JSON or JSON-lines file.
        file: PathBuf,
    },

    /// Validate and run a query request file.
    ///
    /// Prints the result as JSON. Exits non-zero when the request is
    /// rejected or the query fails.
    Query {
        /// User the request runs as.
        #[arg(long)]
        user: String,
        /// Request file (JSON).
        request: PathBuf,
    },

    /// Inspect and manage saved tasks.
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Print a task record and its result payload.
    Show {
        task_id: String,
        #[arg(long)]
        user: String,
    },
    /// Delete a task record and both of its payloads.
    Delete {
        task_id: String,
        #[arg(long)]
        user: String,
    },
    /// Run a task that was submitted with `enqueue_only`.
    Run {
        task_id: String,
        #[arg(long)]
        user: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Load { collection, file } => {
            ingest::run_load(&cfg, &collection, &file).await?;
        }
        Commands::Query { user, request } => {
            query::run_query(&cfg, &user, &request).await?;
        }
        Commands::Task { action } => match action {
            TaskAction::Show { task_id, user } => {
                tasks::run_show(&cfg, &task_id, &user).await?;
            }
            TaskAction::Delete { task_id, user } => {
                tasks::run_delete(&cfg, &task_id, &user).await?;
            }
            TaskAction::Run { task_id, user } => {
                tasks::run_enqueued(&cfg, &task_id, &user).await?;
            }
        },
    }

    Ok(())
}
