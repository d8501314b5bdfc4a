//! Error types surfaced by the query core.
//!
//! [`Rejection`] covers every way validation can refuse a request; it is
//! always reported to the caller and never partially applied.
//! [`QueryError`] is what [`QueryService`](crate::service::QueryService)
//! returns. Its [`Execution`](QueryError::Execution) variant deliberately
//! carries no detail: evaluation errors are logged and persisted in the
//! task's failure payload instead.

use thiserror::Error;

use crate::coords::CoordinateError;
use crate::literal::LiteralError;
use crate::models::TaskStatus;

/// Why a request was refused by the validator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("query must call one of the permitted read operations")]
    MissingReadOperation,
    #[error("query contains a forbidden token `{0}`")]
    DeniedToken(String),
    #[error("query must not start with a literal")]
    LiteralPrefix,
    #[error("collection `{0}` is not accessible")]
    PrivilegedCollection(String),
    #[error("cross-collection read into `{0}` is not accessible")]
    PrivilegedLookup(String),
    #[error("pipeline stage `{0}` writes data and is not permitted")]
    WriteStage(String),
    #[error("malformed query: {0}")]
    Malformed(String),
    #[error("invalid literal in {field}: {source}")]
    InvalidLiteral {
        field: String,
        #[source]
        source: LiteralError,
    },
    #[error("unknown cone search unit `{0}`")]
    UnknownUnit(String),
    #[error("invalid coordinates: {0}")]
    InvalidCoordinates(#[from] CoordinateError),
    #[error("no positions supplied")]
    EmptyPositions,
    #[error("invalid cone search radius: {0}")]
    InvalidRadius(String),
    #[error("malformed catalog spec for `{catalog}`: {reason}")]
    MalformedCatalog { catalog: String, reason: String },
    #[error("no catalogs supplied")]
    NoCatalogs,
}

/// Error returned by the query service.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query rejected: {0}")]
    Rejected(#[from] Rejection),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("query failed")]
    Execution,
    #[error("task `{task_id}` not found")]
    TaskNotFound { task_id: String },
    #[error("task `{task_id}` is {status}, not enqueued")]
    NotEnqueued { task_id: String, status: TaskStatus },
    #[error("task `{task_id}` belongs to another user")]
    Forbidden { task_id: String },
}

impl QueryError {
    /// Wrap a storage failure, keeping the full context chain.
    pub fn persistence(err: anyhow::Error) -> Self {
        Self::Persistence(format!("{err:#}"))
    }
}
