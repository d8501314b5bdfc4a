//! Aggregation pipeline evaluation.
//!
//! Supported stages: `$match`, `$project`, `$sort`, `$skip`, `$limit`,
//! `$count`, `$unwind`, `$lookup` (equality form with `localField` /
//! `foreignField`), and `$group` with the `$sum`, `$avg`, `$min`, `$max`,
//! `$first`, `$last`, `$push`, and `$addToSet` accumulators. Any other stage
//! or expression fails the whole pipeline.
//!
//! `$lookup` needs the foreign collections up front; callers load the names
//! returned by [`foreign_collections`] and pass them to [`run_pipeline`].

use std::cmp::Ordering;
use std::collections::HashMap;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{Map, Number, Value};

use crate::matcher::{compare_values, matches, project, resolve, sort_documents};

/// Collections referenced by `$lookup` stages.
pub fn foreign_collections(pipeline: &[Map<String, Value>]) -> Vec<String> {
    let mut names: Vec<String> = pipeline
        .iter()
        .filter_map(|stage| stage.get("$lookup"))
        .filter_map(|spec| spec.get("from").and_then(Value::as_str))
        .map(str::to_string)
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Run `pipeline` over `docs`. `foreign` holds every collection named by a
/// `$lookup` stage.
pub fn run_pipeline(
    mut docs: Vec<Value>,
    pipeline: &[Map<String, Value>],
    foreign: &HashMap<String, Vec<Value>>,
) -> Result<Vec<Value>> {
    for (index, stage) in pipeline.iter().enumerate() {
        let mut entries = stage.iter();
        let (name, spec) = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry,
            _ => bail!("pipeline stage {index} must have exactly one operator"),
        };
        docs = apply_stage(docs, name, spec, foreign)
            .with_context(|| format!("pipeline stage {index} (`{name}`)"))?;
    }
    Ok(docs)
}

fn apply_stage(
    docs: Vec<Value>,
    name: &str,
    spec: &Value,
    foreign: &HashMap<String, Vec<Value>>,
) -> Result<Vec<Value>> {
    match name {
        "$match" => {
            let filter = spec
                .as_object()
                .ok_or_else(|| anyhow!("`$match` requires a document"))?;
            let mut kept = Vec::new();
            for doc in docs {
                if matches(&doc, filter)? {
                    kept.push(doc);
                }
            }
            Ok(kept)
        }
        "$project" => {
            let spec = spec
                .as_object()
                .ok_or_else(|| anyhow!("`$project` requires a document"))?;
            docs.iter().map(|doc| project_stage(doc, spec)).collect()
        }
        "$sort" => {
            let spec = spec
                .as_object()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| anyhow!("`$sort` requires a non-empty document"))?;
            let keys = spec
                .iter()
                .map(|(path, dir)| match dir.as_i64() {
                    Some(1) => Ok((path.clone(), 1)),
                    Some(-1) => Ok((path.clone(), -1)),
                    _ => Err(anyhow!("sort direction for `{path}` must be 1 or -1")),
                })
                .collect::<Result<Vec<_>>>()?;
            let mut docs = docs;
            sort_documents(&mut docs, &keys);
            Ok(docs)
        }
        "$skip" => {
            let n = count(name, spec)?;
            Ok(docs.into_iter().skip(n).collect())
        }
        "$limit" => {
            let n = count(name, spec)?;
            if n == 0 {
                bail!("`$limit` must be positive");
            }
            Ok(docs.into_iter().take(n).collect())
        }
        "$count" => {
            let field = spec
                .as_str()
                .filter(|f| !f.is_empty() && !f.starts_with('$') && !f.contains('.'))
                .ok_or_else(|| anyhow!("`$count` requires a plain field name"))?;
            if docs.is_empty() {
                return Ok(docs);
            }
            let mut out = Map::new();
            out.insert(field.to_string(), Value::from(docs.len() as u64));
            Ok(vec![Value::Object(out)])
        }
        "$unwind" => unwind(docs, spec),
        "$lookup" => lookup(docs, spec, foreign),
        "$group" => group(docs, spec),
        other => bail!("unsupported pipeline stage `{other}`"),
    }
}

fn count(name: &str, spec: &Value) -> Result<usize> {
    spec.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| anyhow!("`{name}` requires a non-negative integer"))
}

fn field_path(expr: &str) -> Option<&str> {
    expr.strip_prefix('$').filter(|p| !p.is_empty() && !p.starts_with('$'))
}

/// Evaluate an expression: `"$path"`, `{"$literal": v}`, a literal, or an
/// array/document of expressions. `None` means the path was missing.
fn eval_expr(doc: &Value, expr: &Value) -> Result<Option<Value>> {
    match expr {
        Value::String(s) if s.starts_with('$') => {
            let path = field_path(s).ok_or_else(|| anyhow!("unsupported expression `{s}`"))?;
            Ok(get_path(doc, path).cloned())
        }
        Value::Array(items) => {
            let values = items
                .iter()
                .map(|item| Ok(eval_expr(doc, item)?.unwrap_or(Value::Null)))
                .collect::<Result<Vec<_>>>()?;
            Ok(Some(Value::Array(values)))
        }
        Value::Object(map) => {
            if let Some(literal) = map.get("$literal") {
                if map.len() == 1 {
                    return Ok(Some(literal.clone()));
                }
            }
            let mut out = Map::new();
            for (key, value) in map {
                if key.starts_with('$') {
                    bail!("unsupported expression operator `{key}`");
                }
                if let Some(v) = eval_expr(doc, value)? {
                    out.insert(key.clone(), v);
                }
            }
            Ok(Some(Value::Object(out)))
        }
        other => Ok(Some(other.clone())),
    }
}

/// The single value at `path`, descending through documents only, with
/// numeric segments indexing arrays.
fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |value, part| match value {
        Value::Object(map) => map.get(part),
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn set_path(doc: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(inner) = child {
                set_path(inner, rest, value);
            }
        }
    }
}

fn flag_off(flag: &Value) -> bool {
    matches!(flag, Value::Bool(false)) || flag.as_f64() == Some(0.0)
}

fn project_stage(doc: &Value, spec: &Map<String, Value>) -> Result<Value> {
    let mut flags = Map::new();
    let mut computed = Vec::new();
    for (field, value) in spec {
        match value {
            Value::Bool(_) | Value::Number(_) => {
                flags.insert(field.clone(), value.clone());
            }
            expr => computed.push((field, expr)),
        }
    }
    if computed.is_empty() {
        return project(doc, Some(&flags));
    }

    if flags
        .iter()
        .any(|(field, flag)| field != "_id" && flag_off(flag))
    {
        bail!("`$project` cannot mix computed fields with exclusions");
    }

    let has_inclusion = flags.keys().any(|field| field != "_id");
    let base = if has_inclusion {
        project(doc, Some(&flags))?
    } else {
        let keep_id = !flags.get("_id").is_some_and(flag_off);
        let mut only_id = Map::new();
        if keep_id {
            if let Some(id) = doc.get("_id") {
                only_id.insert("_id".to_string(), id.clone());
            }
        }
        Value::Object(only_id)
    };
    let mut out = match base {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    for (field, expr) in computed {
        if let Some(value) = eval_expr(doc, expr)? {
            set_path(&mut out, field, value);
        }
    }
    Ok(Value::Object(out))
}

fn unwind(docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>> {
    let (path, preserve) = match spec {
        Value::String(s) => (s.as_str(), false),
        Value::Object(map) => (
            map.get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("`$unwind` requires a `path`"))?,
            map.get("preserveNullAndEmptyArrays")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        ),
        _ => bail!("`$unwind` requires a path"),
    };
    let path = field_path(path).ok_or_else(|| anyhow!("`$unwind` path must start with `$`"))?;

    let mut out = Vec::new();
    for doc in docs {
        match get_path(&doc, path).cloned() {
            Some(Value::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut copy = match doc.clone() {
                        Value::Object(map) => map,
                        _ => continue,
                    };
                    set_path(&mut copy, path, item);
                    out.push(Value::Object(copy));
                }
            }
            Some(Value::Array(_)) | Some(Value::Null) | None => {
                if preserve {
                    out.push(doc);
                }
            }
            Some(_) => out.push(doc),
        }
    }
    Ok(out)
}

fn lookup(
    docs: Vec<Value>,
    spec: &Value,
    foreign: &HashMap<String, Vec<Value>>,
) -> Result<Vec<Value>> {
    let field = |name: &str| {
        spec.get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("`$lookup` requires `{name}`"))
    };
    if spec.get("pipeline").is_some() {
        bail!("`$lookup` with a sub-pipeline is not supported");
    }
    let from = field("from")?;
    let local_field = field("localField")?;
    let foreign_field = field("foreignField")?;
    let as_field = field("as")?;
    let foreign_docs = foreign
        .get(from)
        .ok_or_else(|| anyhow!("collection `{from}` was not loaded for `$lookup`"))?;

    docs.into_iter()
        .map(|doc| {
            let locals = join_keys(&doc, local_field);
            let joined: Vec<Value> = foreign_docs
                .iter()
                .filter(|candidate| {
                    join_keys(candidate, foreign_field).iter().any(|f| {
                        locals
                            .iter()
                            .any(|l| compare_values(l, f) == Ordering::Equal)
                    })
                })
                .cloned()
                .collect();
            let mut map = match doc {
                Value::Object(map) => map,
                _ => bail!("`$lookup` input must be documents"),
            };
            set_path(&mut map, as_field, Value::Array(joined));
            Ok(Value::Object(map))
        })
        .collect()
}

/// Values a document joins on: every value at `path` with arrays expanded,
/// or null when absent.
fn join_keys(doc: &Value, path: &str) -> Vec<Value> {
    let mut keys = Vec::new();
    for value in resolve(doc, path) {
        match value {
            Value::Array(items) => keys.extend(items.iter().cloned()),
            other => keys.push(other.clone()),
        }
    }
    if keys.is_empty() {
        keys.push(Value::Null);
    }
    keys
}

enum Accumulator {
    Sum { int: i64, float: f64, is_float: bool },
    Avg { total: f64, n: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    First(Option<Value>),
    Last(Option<Value>),
    Push(Vec<Value>),
    AddToSet(Vec<Value>),
}

impl Accumulator {
    fn new(op: &str) -> Result<Self> {
        Ok(match op {
            "$sum" => Self::Sum {
                int: 0,
                float: 0.0,
                is_float: false,
            },
            "$avg" => Self::Avg { total: 0.0, n: 0 },
            "$min" => Self::Min(None),
            "$max" => Self::Max(None),
            "$first" => Self::First(None),
            "$last" => Self::Last(None),
            "$push" => Self::Push(Vec::new()),
            "$addToSet" => Self::AddToSet(Vec::new()),
            other => bail!("unsupported accumulator `{other}`"),
        })
    }

    fn add(&mut self, value: Option<Value>, first_seen: bool) {
        match self {
            Self::Sum {
                int,
                float,
                is_float,
            } => {
                if let Some(Value::Number(n)) = value {
                    match n.as_i64().and_then(|i| int.checked_add(i)) {
                        Some(sum) if !*is_float => *int = sum,
                        _ => {
                            if !*is_float {
                                *float = *int as f64;
                                *is_float = true;
                            }
                            *float += n.as_f64().unwrap_or(0.0);
                        }
                    }
                }
            }
            Self::Avg { total, n } => {
                if let Some(x) = value.as_ref().and_then(Value::as_f64) {
                    *total += x;
                    *n += 1;
                }
            }
            Self::Min(current) => keep_extreme(current, value, Ordering::Less),
            Self::Max(current) => keep_extreme(current, value, Ordering::Greater),
            Self::First(current) => {
                if first_seen {
                    *current = Some(value.unwrap_or(Value::Null));
                }
            }
            Self::Last(current) => *current = Some(value.unwrap_or(Value::Null)),
            Self::Push(items) => {
                if let Some(v) = value {
                    items.push(v);
                }
            }
            Self::AddToSet(items) => {
                if let Some(v) = value {
                    if !items
                        .iter()
                        .any(|existing| compare_values(existing, &v) == Ordering::Equal)
                    {
                        items.push(v);
                    }
                }
            }
        }
    }

    fn finish(self) -> Value {
        match self {
            Self::Sum {
                int,
                float,
                is_float,
            } => {
                if is_float {
                    Number::from_f64(float).map_or(Value::Null, Value::Number)
                } else {
                    Value::from(int)
                }
            }
            Self::Avg { total, n } => {
                if n == 0 {
                    Value::Null
                } else {
                    Number::from_f64(total / n as f64).map_or(Value::Null, Value::Number)
                }
            }
            Self::Min(v) | Self::Max(v) | Self::First(v) | Self::Last(v) => {
                v.unwrap_or(Value::Null)
            }
            Self::Push(items) | Self::AddToSet(items) => Value::Array(items),
        }
    }
}

/// Replace `current` when `value` orders `want` relative to it. Nulls and
/// missing values are ignored.
fn keep_extreme(current: &mut Option<Value>, value: Option<Value>, want: Ordering) {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return;
    };
    let replace = current
        .as_ref()
        .map_or(true, |cur| compare_values(&value, cur) == want);
    if replace {
        *current = Some(value);
    }
}

struct GroupState {
    key: Value,
    accumulators: Vec<(String, Accumulator)>,
}

fn group(docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>> {
    let spec = spec
        .as_object()
        .ok_or_else(|| anyhow!("`$group` requires a document"))?;
    let id_expr = spec
        .get("_id")
        .ok_or_else(|| anyhow!("`$group` requires an `_id`"))?;
    let mut fields = Vec::new();
    for (name, acc) in spec.iter().filter(|(name, _)| name.as_str() != "_id") {
        let (op, expr) = acc
            .as_object()
            .filter(|m| m.len() == 1)
            .and_then(|m| m.iter().next())
            .ok_or_else(|| anyhow!("`$group` field `{name}` must be a single accumulator"))?;
        Accumulator::new(op)?;
        fields.push((name.clone(), op.clone(), expr));
    }

    let mut groups: Vec<GroupState> = Vec::new();
    for doc in &docs {
        let key = eval_expr(doc, id_expr)?.unwrap_or(Value::Null);
        let position = groups
            .iter()
            .position(|g| compare_values(&g.key, &key) == Ordering::Equal);
        let (state, first_seen) = match position {
            Some(i) => (&mut groups[i], false),
            None => {
                let accumulators = fields
                    .iter()
                    .map(|(name, op, _)| Ok((name.clone(), Accumulator::new(op)?)))
                    .collect::<Result<Vec<_>>>()?;
                groups.push(GroupState { key, accumulators });
                let last = groups.len() - 1;
                (&mut groups[last], true)
            }
        };
        for ((_, acc), (_, _, expr)) in state.accumulators.iter_mut().zip(fields.iter()) {
            acc.add(eval_expr(doc, expr)?, first_seen);
        }
    }

    Ok(groups
        .into_iter()
        .map(|g| {
            let mut out = Map::new();
            out.insert("_id".to_string(), g.key);
            for (name, acc) in g.accumulators {
                out.insert(name, acc.finish());
            }
            Value::Object(out)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn stages(v: Value) -> Vec<Map<String, Value>> {
        v.as_array()
            .unwrap()
            .iter()
            .map(|s| s.as_object().cloned().unwrap())
            .collect()
    }

    fn sources() -> Vec<Value> {
        vec![
            json!({"_id": 1, "field": "a", "mag": 17.0, "filters": ["g", "r"]}),
            json!({"_id": 2, "field": "a", "mag": 19.0, "filters": []}),
            json!({"_id": 3, "field": "b", "mag": 18.0, "filters": ["i"]}),
        ]
    }

    #[test]
    fn test_match_sort_limit_project() {
        let out = run_pipeline(
            sources(),
            &stages(json!([
                {"$match": {"mag": {"$lt": 19}}},
                {"$sort": {"mag": -1}},
                {"$limit": 1},
                {"$project": {"_id": 0, "brightness": "$mag", "field": 1}}
            ])),
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(out, vec![json!({"field": "b", "brightness": 18.0})]);
    }

    #[test]
    fn test_group_accumulators() {
        let out = run_pipeline(
            sources(),
            &stages(json!([
                {"$group": {
                    "_id": "$field",
                    "n": {"$sum": 1},
                    "avg": {"$avg": "$mag"},
                    "min": {"$min": "$mag"},
                    "ids": {"$push": "$_id"},
                    "first": {"$first": "$_id"}
                }},
                {"$sort": {"_id": 1}}
            ])),
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(
            out,
            vec![
                json!({"_id": "a", "n": 2, "avg": 18.0, "min": 17.0, "ids": [1, 2], "first": 1}),
                json!({"_id": "b", "n": 1, "avg": 18.0, "min": 18.0, "ids": [3], "first": 3}),
            ]
        );
    }

    #[test]
    fn test_unwind_and_count() {
        let out = run_pipeline(
            sources(),
            &stages(json!([{"$unwind": "$filters"}, {"$count": "n"}])),
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(out, vec![json!({"n": 3})]);

        let out = run_pipeline(
            sources(),
            &stages(json!([{"$unwind": {"path": "$filters", "preserveNullAndEmptyArrays": true}}])),
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(out.len(), 4);

        let out = run_pipeline(
            sources(),
            &stages(json!([{"$match": {"mag": 0}}, {"$count": "n"}])),
            &HashMap::new(),
        )
        .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_lookup() {
        let pipeline = stages(json!([
            {"$lookup": {"from": "fields", "localField": "field", "foreignField": "name", "as": "meta"}},
            {"$project": {"meta.depth": 1}}
        ]));
        assert_eq!(foreign_collections(&pipeline), vec!["fields".to_string()]);
        let mut foreign = HashMap::new();
        foreign.insert(
            "fields".to_string(),
            vec![json!({"name": "a", "depth": 20}), json!({"name": "c", "depth": 21})],
        );
        let out = run_pipeline(sources(), &pipeline, &foreign).unwrap();
        assert_eq!(out[0], json!({"_id": 1, "meta": [{"depth": 20}]}));
        assert_eq!(out[2], json!({"_id": 3, "meta": []}));
    }

    #[test]
    fn test_unknown_stage_fails() {
        let err = run_pipeline(
            sources(),
            &stages(json!([{"$match": {}}, {"$out": "copy"}])),
            &HashMap::new(),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("unsupported pipeline stage `$out`"));

        assert!(run_pipeline(
            sources(),
            &stages(json!([{"$match": {}, "$limit": 1}])),
            &HashMap::new()
        )
        .is_err());
    }
}
