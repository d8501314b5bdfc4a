//! Execution engine: runs a [`NormalizedPlan`] against a [`DocumentStore`]
//! and, when a task was submitted, records the outcome.
//!
//! Bookkeeping order on success is result blob, then row (`Done` with the
//! blob's location). On failure a `{"msg": ...}` blob is written to the
//! same result location convention, the row moves to `Failed` with no
//! result location, and the caller receives [`QueryError::Execution`]
//! without the underlying detail. A task is never left `Enqueued` after
//! its evaluation finished.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::error::QueryError;
use crate::general::{FindOptions, ReadCall, ReadOp};
use crate::models::{
    ConePlan, ExecutionResult, NormalizedPlan, PlanBody, ResultOutput, Task, TaskStatus,
};
use crate::store::{BlobKey, BlobKind, BlobStore, DocumentStore, TaskStore};

#[derive(Clone)]
pub struct Engine {
    docs: Arc<dyn DocumentStore>,
    tasks: Arc<dyn TaskStore>,
    blobs: Arc<dyn BlobStore>,
}

impl Engine {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        tasks: Arc<dyn TaskStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self { docs, tasks, blobs }
    }

    /// Evaluate `plan` and return its result payload.
    ///
    /// General search: `{"query_result": <value>}`. Cone search:
    /// `{catalog: {object_name_with_underscores: [docs]}}`. The first failing
    /// catalog query aborts the whole batch.
    pub async fn evaluate(&self, plan: &NormalizedPlan) -> anyhow::Result<Value> {
        match &plan.body {
            PlanBody::GeneralSearch { call, .. } => {
                let value = self.run_call(call).await?;
                Ok(json!({ "query_result": value }))
            }
            PlanBody::ConeSearch(cone) => self.run_cone(cone).await,
        }
    }

    async fn run_call(&self, call: &ReadCall) -> anyhow::Result<Value> {
        let coll = call.collection.as_str();
        Ok(match &call.op {
            ReadOp::Find(options) => Value::Array(self.docs.find(coll, options).await?),
            ReadOp::FindOne { filter, projection } => self
                .docs
                .find_one(coll, filter, projection.as_ref())
                .await?
                .unwrap_or(Value::Null),
            ReadOp::CountDocuments { filter } => {
                Value::from(self.docs.count_documents(coll, filter).await?)
            }
            ReadOp::Distinct { key, filter } => {
                Value::Array(self.docs.distinct(coll, key, filter).await?)
            }
            ReadOp::Aggregate { pipeline } => {
                Value::Array(self.docs.aggregate(coll, pipeline).await?)
            }
            ReadOp::IndexInformation => self.docs.index_information(coll).await?,
            ReadOp::MapReduce { map, reduce, out } => {
                self.docs.map_reduce(coll, map, reduce, out).await?
            }
        })
    }

    async fn run_cone(&self, cone: &ConePlan) -> anyhow::Result<Value> {
        let mut result = Map::new();
        for (catalog, objects) in cone {
            let mut per_object = Map::new();
            for (name, query) in objects {
                let options = FindOptions {
                    filter: query.filter.clone(),
                    projection: query.projection.clone(),
                    ..FindOptions::default()
                };
                let docs = self.docs.find(catalog, &options).await?;
                per_object.insert(name.replace('.', "_"), Value::Array(docs));
            }
            result.insert(catalog.clone(), Value::Object(per_object));
        }
        Ok(Value::Object(result))
    }

    /// Run `plan`, recording the outcome on `task` when one is given.
    pub async fn execute(
        &self,
        plan: &NormalizedPlan,
        task: Option<&Task>,
    ) -> Result<ExecutionResult, QueryError> {
        let outcome = self.evaluate(plan).await;
        let Some(task) = task else {
            return match outcome {
                Ok(value) => Ok(ExecutionResult {
                    user: plan.user.clone(),
                    status: TaskStatus::Done,
                    kwargs: plan.kwargs.clone(),
                    task_id: None,
                    output: ResultOutput::Inline { result_data: value },
                }),
                Err(err) => {
                    tracing::error!(user = %plan.user, error = %format!("{err:#}"), "query failed");
                    Err(QueryError::Execution)
                }
            };
        };

        match outcome {
            Ok(value) => {
                let location = match self.store_result(task, &value).await {
                    Ok(location) => location,
                    Err(err) => {
                        tracing::error!(
                            task_id = %task.task_id,
                            error = %format!("{err:#}"),
                            "writing result failed"
                        );
                        self.finish(task, TaskStatus::Failed, None).await?;
                        return Err(QueryError::persistence(err));
                    }
                };
                self.finish(task, TaskStatus::Done, Some(&location)).await?;
                tracing::info!(task_id = %task.task_id, "task done");
                Ok(ExecutionResult {
                    user: plan.user.clone(),
                    status: TaskStatus::Done,
                    kwargs: plan.kwargs.clone(),
                    task_id: Some(task.task_id.clone()),
                    output: ResultOutput::Stored {
                        result: Some(location),
                    },
                })
            }
            Err(err) => {
                let detail = format!("{err:#}");
                tracing::error!(task_id = %task.task_id, error = %detail, "query failed");
                self.fail(task, &detail).await?;
                Err(QueryError::Execution)
            }
        }
    }

    /// Persist `{"msg": detail}` as the task's result and mark it `Failed`.
    pub async fn fail(&self, task: &Task, detail: &str) -> Result<(), QueryError> {
        if let Err(err) = self.store_result(task, &json!({ "msg": detail })).await {
            tracing::error!(
                task_id = %task.task_id,
                error = %format!("{err:#}"),
                "writing failure payload failed"
            );
        }
        self.finish(task, TaskStatus::Failed, None).await
    }

    async fn store_result(&self, task: &Task, payload: &Value) -> anyhow::Result<String> {
        let key = BlobKey::new(&task.user, &task.task_id, BlobKind::Result)?;
        let bytes = serde_json::to_vec_pretty(payload)?;
        self.blobs.put(&key, &bytes).await
    }

    async fn finish(
        &self,
        task: &Task,
        status: TaskStatus,
        result_location: Option<&str>,
    ) -> Result<(), QueryError> {
        let moved = self
            .tasks
            .finish(&task.task_id, status, result_location, Utc::now())
            .await
            .map_err(QueryError::persistence)?;
        if !moved {
            tracing::warn!(
                task_id = %task.task_id,
                status = %status,
                "task was no longer enqueued; status left unchanged"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Identity, QueryRequest};
    use crate::policy::QueryPolicy;
    use crate::store::memory::{InMemoryBlobStore, InMemoryDocumentStore, InMemoryTaskStore};
    use crate::validate::Validator;
    use pretty_assertions::assert_eq;

    fn engine_with(docs: InMemoryDocumentStore) -> Engine {
        Engine::new(
            Arc::new(docs),
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(InMemoryBlobStore::new()),
        )
    }

    fn plan(request: Value) -> NormalizedPlan {
        let request: QueryRequest = serde_json::from_value(request).unwrap();
        Validator::new(QueryPolicy::default())
            .validate(&request, &Identity::new("alice"))
            .unwrap()
    }

    #[tokio::test]
    async fn test_general_search_inline() {
        let docs = InMemoryDocumentStore::new();
        docs.insert_documents("sources", vec![json!({"_id": 1}), json!({"_id": 2})]);
        let engine = engine_with(docs);
        let result = engine
            .execute(
                &plan(json!({"query_type": "general_search", "query": "db['sources'].count_documents({})"})),
                None,
            )
            .await
            .unwrap();
        assert_eq!(
            result.output,
            ResultOutput::Inline {
                result_data: json!({"query_result": 2})
            }
        );
    }

    #[tokio::test]
    async fn test_cone_search_object_names_use_underscores() {
        let docs = InMemoryDocumentStore::new();
        docs.insert_documents(
            "ztf",
            vec![
                json!({"_id": "near", "coordinates": {"radec_geojson": {"type": "Point", "coordinates": [-170.0, 20.0]}}}),
                json!({"_id": "far", "coordinates": {"radec_geojson": {"type": "Point", "coordinates": [10.0, -20.0]}}}),
            ],
        );
        let engine = engine_with(docs);
        let value = engine
            .evaluate(&plan(json!({
                "query_type": "cone_search",
                "object_coordinates": {
                    "radec": {"obj.1": [10.0, 20.0]},
                    "cone_search_radius": 1,
                    "cone_search_unit": "deg"
                },
                "catalogs": {"ztf": {"filter": {}, "projection": {"_id": 1}}}
            })))
            .await
            .unwrap();
        assert_eq!(value, json!({"ztf": {"obj_1": [{"_id": "near"}]}}));
    }
}
