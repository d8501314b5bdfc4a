//! # skyquery
//!
//! Validated, read-only queries over astronomical catalogs: general
//! searches written as a single collection read, and cone searches around
//! sky positions. Saved queries become content-addressed tasks whose
//! request and result payloads live on disk.
//!
//! The query language, validation, and evaluation live in
//! [`skyquery_core`]; this crate supplies configuration, SQLite and
//! filesystem storage, the catalog loader, and the `skyq` CLI.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────┐   ┌──────────────┐
//! │ skyq CLI │──▶│ skyquery-core        │──▶│ SQLite       │
//! │          │   │ validate → task → run│   │ docs + tasks │
//! └──────────┘   └──────────┬───────────┘   └──────────────┘
//!                           ▼
//!                    ┌──────────────┐
//!                    │ queries/     │
//!                    │ <user>/*.json│
//!                    └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite document and task stores |
//! | [`blobs`] | Filesystem blob store |
//! | [`ingest`] | Catalog loader |
//! | [`query`] | Request execution |
//! | [`tasks`] | Task inspection, deletion, and resume |

pub mod blobs;
pub mod config;
pub mod db;
pub mod ingest;
pub mod migrate;
pub mod query;
pub mod sqlite_store;
pub mod tasks;
