//! # skyquery core
//!
//! Runtime-agnostic logic of the skyquery engine: request and task models,
//! the literal-only deserializer, coordinate transforms, the query
//! validator, the document evaluator, storage traits, task identity, and
//! the execution engine.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. The app crate
//! supplies SQLite and filesystem implementations of the [`store`] traits;
//! [`store::memory`] provides in-memory ones.
//!
//! | Module | Role |
//! |--------|------|
//! | [`literal`] | Literal-syntax values (`{'a': (1, 2.5)}`) without expressions |
//! | [`coords`] | Radius units, RA/Dec parsing, `(ra, dec)` → `(lon, lat)` |
//! | [`policy`] | Admin identity, allow/deny lists, privileged collections |
//! | [`general`] | Typed general-search calls (`db['c'].find(...)`) |
//! | [`validate`] | Request → [`NormalizedPlan`](models::NormalizedPlan) or [`Rejection`](error::Rejection) |
//! | [`matcher`] / [`pipeline`] | Filter, projection, sort, and aggregation evaluation |
//! | [`task`] | Content-hash task ids and submission |
//! | [`engine`] | Plan execution with result and failure bookkeeping |
//! | [`service`] | End-to-end request handling and task management |

pub mod coords;
pub mod engine;
pub mod error;
pub mod general;
pub mod literal;
pub mod matcher;
pub mod models;
pub mod pipeline;
pub mod policy;
pub mod service;
pub mod store;
pub mod task;
pub mod validate;
