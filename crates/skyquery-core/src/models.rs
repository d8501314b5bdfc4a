//! Request, plan, task, and result types shared across the query core.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Rejection;
use crate::general::ReadCall;

/// kwargs that steer execution or retention and never change a task's identity.
pub const VOLATILE_KWARGS: [&str; 3] = ["save", "enqueue_only", "query_expiration_interval"];

/// Upper bound for `query_expiration_interval`, in days.
pub const MAX_EXPIRATION_DAYS: i64 = 36_500;

/// The resolved identity of the caller, handed over by the outer layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub username: String,
}

impl Identity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    GeneralSearch,
    ConeSearch,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GeneralSearch => "general_search",
            Self::ConeSearch => "cone_search",
        }
    }
}

/// An untrusted query request as decoded from the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Informational only; the plan is always built for the resolved caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub payload: QueryPayload,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl QueryRequest {
    pub fn query_type(&self) -> QueryType {
        match self.payload {
            QueryPayload::GeneralSearch { .. } => QueryType::GeneralSearch,
            QueryPayload::ConeSearch { .. } => QueryType::ConeSearch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "query_type", rename_all = "snake_case")]
pub enum QueryPayload {
    GeneralSearch {
        query: String,
    },
    ConeSearch {
        object_coordinates: ObjectCoordinates,
        #[serde(default)]
        catalogs: BTreeMap<String, CatalogSpec>,
    },
}

/// Target positions and search radius of a cone search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectCoordinates {
    /// Literal string, array of pairs, or object of name → pair.
    pub radec: Value,
    /// Number or numeric string.
    pub cone_search_radius: Value,
    pub cone_search_unit: String,
}

/// Caller-supplied filter and projection for one catalog. Each is either a
/// literal string or a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogSpec {
    #[serde(default)]
    pub filter: Value,
    #[serde(default)]
    pub projection: Value,
}

/// Filter and projection for a single (catalog, object) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogQuery {
    pub filter: Map<String, Value>,
    pub projection: Option<Map<String, Value>>,
}

/// catalog → object name → query.
pub type ConePlan = BTreeMap<String, BTreeMap<String, CatalogQuery>>;

#[derive(Debug, Clone, PartialEq)]
pub enum PlanBody {
    /// The original string, verbatim, and its typed reading.
    GeneralSearch { query: String, call: ReadCall },
    ConeSearch(ConePlan),
}

impl PlanBody {
    /// Canonical JSON form used for hashing and logging.
    pub fn to_json(&self) -> Value {
        match self {
            Self::GeneralSearch { query, .. } => Value::String(query.clone()),
            Self::ConeSearch(plan) => serde_json::to_value(plan).unwrap_or(Value::Null),
        }
    }
}

/// A validated, side-effect-free query plan.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPlan {
    pub user: String,
    pub body: PlanBody,
    pub kwargs: Map<String, Value>,
}

impl NormalizedPlan {
    pub fn query_type(&self) -> QueryType {
        match self.body {
            PlanBody::GeneralSearch { .. } => QueryType::GeneralSearch,
            PlanBody::ConeSearch(_) => QueryType::ConeSearch,
        }
    }
}

/// Execution switches read from `kwargs`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionOptions {
    pub save: bool,
    pub enqueue_only: bool,
    /// Retention override in days.
    pub expiration_days: Option<i64>,
}

impl ExecutionOptions {
    pub fn from_kwargs(kwargs: &Map<String, Value>) -> Result<Self, Rejection> {
        let flag = |key: &str| match kwargs.get(key) {
            None | Some(Value::Null) => Ok(false),
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(Rejection::Malformed(format!(
                "kwargs.{key} must be a boolean, got {other}"
            ))),
        };
        let expiration_days = match kwargs.get("query_expiration_interval") {
            None | Some(Value::Null) => None,
            Some(v) => match v.as_i64() {
                Some(days) if (1..=MAX_EXPIRATION_DAYS).contains(&days) => Some(days),
                _ => {
                    return Err(Rejection::Malformed(format!(
                        "kwargs.query_expiration_interval must be an integer in \
                         [1, {MAX_EXPIRATION_DAYS}], got {v}"
                    )))
                }
            },
        };
        Ok(Self {
            save: flag("save")?,
            enqueue_only: flag("enqueue_only")?,
            expiration_days,
        })
    }

    /// Whether a task record and blobs are kept for this request.
    pub fn book_keeping(&self) -> bool {
        self.save || self.enqueue_only
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Enqueued,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Only `Enqueued → Done` and `Enqueued → Failed` exist.
    pub fn can_transition_to(&self, next: &TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Enqueued, Self::Done) | (Self::Enqueued, Self::Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enqueued" => Ok(Self::Enqueued),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => anyhow::bail!("unknown task status `{other}`"),
        }
    }
}

/// Book-keeping record for a submitted query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub user: String,
    pub request_location: String,
    pub result_location: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}

/// Either the result itself or where it was persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultOutput {
    Inline { result_data: Value },
    Stored { result: Option<String> },
}

/// What the service hands back to the outer layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub user: String,
    pub status: TaskStatus,
    pub kwargs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(flatten)]
    pub output: ResultOutput,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_decoding() {
        let req: QueryRequest = serde_json::from_value(json!({
            "query_type": "general_search",
            "query": "db['sources'].find({})",
            "kwargs": {"save": true}
        }))
        .unwrap();
        assert_eq!(req.query_type(), QueryType::GeneralSearch);
        assert_eq!(req.kwargs["save"], json!(true));

        let req: QueryRequest = serde_json::from_value(json!({
            "user": "alice",
            "query_type": "cone_search",
            "object_coordinates": {
                "radec": "[(10.0, 20.0)]",
                "cone_search_radius": "3600",
                "cone_search_unit": "arcsec"
            },
            "catalogs": {"sources": {"filter": "{}", "projection": {"_id": 1}}}
        }))
        .unwrap();
        assert_eq!(req.user.as_deref(), Some("alice"));
        match req.payload {
            QueryPayload::ConeSearch { catalogs, .. } => {
                assert_eq!(catalogs["sources"].projection, json!({"_id": 1}));
            }
            _ => panic!("expected cone search"),
        }
    }

    #[test]
    fn test_unknown_query_type_fails() {
        let res: Result<QueryRequest, _> =
            serde_json::from_value(json!({"query_type": "drop_everything"}));
        assert!(res.is_err());
    }

    #[test]
    fn test_status_transitions() {
        assert!(TaskStatus::Enqueued.can_transition_to(&TaskStatus::Done));
        assert!(TaskStatus::Enqueued.can_transition_to(&TaskStatus::Failed));
        assert!(!TaskStatus::Done.can_transition_to(&TaskStatus::Enqueued));
        assert!(!TaskStatus::Failed.can_transition_to(&TaskStatus::Done));
        assert!(TaskStatus::Done.is_terminal());
        assert!(!TaskStatus::Enqueued.is_terminal());
        assert_eq!("failed".parse::<TaskStatus>().unwrap(), TaskStatus::Failed);
    }

    #[test]
    fn test_execution_options() {
        let opts = ExecutionOptions::from_kwargs(
            json!({"enqueue_only": true, "query_expiration_interval": 5})
                .as_object()
                .unwrap(),
        )
        .unwrap();
        assert!(opts.book_keeping());
        assert_eq!(opts.expiration_days, Some(5));

        let err = ExecutionOptions::from_kwargs(json!({"save": "yes"}).as_object().unwrap());
        assert!(err.is_err());
        let err = ExecutionOptions::from_kwargs(
            json!({"query_expiration_interval": 0}).as_object().unwrap(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_expiration_interval_bounds() {
        let opts = ExecutionOptions::from_kwargs(
            json!({"query_expiration_interval": MAX_EXPIRATION_DAYS})
                .as_object()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(opts.expiration_days, Some(MAX_EXPIRATION_DAYS));

        let err = ExecutionOptions::from_kwargs(
            json!({"save": true, "query_expiration_interval": 1_000_000_000_000i64})
                .as_object()
                .unwrap(),
        )
        .unwrap_err();
        assert!(matches!(err, Rejection::Malformed(_)));
    }

    #[test]
    fn test_result_shapes() {
        let inline = ExecutionResult {
            user: "alice".into(),
            status: TaskStatus::Done,
            kwargs: Map::new(),
            task_id: None,
            output: ResultOutput::Inline {
                result_data: json!({"query_result": 3}),
            },
        };
        assert_eq!(
            serde_json::to_value(&inline).unwrap(),
            json!({"user": "alice", "status": "done", "kwargs": {}, "result_data": {"query_result": 3}})
        );
        let stored = ExecutionResult {
            output: ResultOutput::Stored { result: None },
            status: TaskStatus::Failed,
            task_id: Some("ab".into()),
            ..inline
        };
        assert_eq!(
            serde_json::to_value(&stored).unwrap(),
            json!({"user": "alice", "status": "failed", "kwargs": {}, "task_id": "ab", "result": null})
        );
    }
}
