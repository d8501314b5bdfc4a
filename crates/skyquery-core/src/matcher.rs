//! Filter, projection, and sort evaluation over JSON documents.
//!
//! Semantics follow the document-database conventions the query language is
//! written against: dotted paths descend into sub-documents and fan out
//! over arrays, equality on an array field matches any element, and values
//! of different types order by a fixed type rank
//! (null < numbers < strings < objects < arrays < booleans).
//!
//! The spherical range predicate
//! `{"$geoWithin": {"$centerSphere": [[lon, lat], radius]}}` is evaluated
//! against GeoJSON points (`{"type": "Point", "coordinates": [lon, lat]}`)
//! or legacy `[lon, lat]` pairs with [`angular_distance`].
//!
//! Unknown operators fail the evaluation rather than matching nothing.

use std::cmp::Ordering;

use anyhow::{anyhow, bail, Result};
use regex::RegexBuilder;
use serde_json::{Map, Value};

use crate::coords::angular_distance;

/// Does `doc` satisfy `filter`?
pub fn matches(doc: &Value, filter: &Map<String, Value>) -> Result<bool> {
    for (key, cond) in filter {
        let ok = match key.as_str() {
            "$and" => logical_items(key, cond)?
                .iter()
                .map(|f| matches(doc, f))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .all(|b| b),
            "$or" => logical_items(key, cond)?
                .iter()
                .map(|f| matches(doc, f))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .any(|b| b),
            "$nor" => !logical_items(key, cond)?
                .iter()
                .map(|f| matches(doc, f))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .any(|b| b),
            "$comment" => true,
            op if op.starts_with('$') => bail!("unsupported top-level operator `{op}`"),
            path => field_matches(&resolve(doc, path), cond)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn logical_items<'a>(op: &str, cond: &'a Value) -> Result<Vec<&'a Map<String, Value>>> {
    let items = cond
        .as_array()
        .filter(|items| !items.is_empty())
        .ok_or_else(|| anyhow!("`{op}` requires a non-empty array"))?;
    items
        .iter()
        .map(|item| {
            item.as_object()
                .ok_or_else(|| anyhow!("`{op}` entries must be documents"))
        })
        .collect()
}

/// All values reachable at a dotted `path`, fanning out over arrays.
pub fn resolve<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let parts: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    resolve_parts(doc, &parts, &mut out);
    out
}

fn resolve_parts<'a>(value: &'a Value, parts: &[&str], out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = parts.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Value::Object(map) => {
            if let Some(next) = map.get(*head) {
                resolve_parts(next, rest, out);
            }
        }
        Value::Array(items) => match head.parse::<usize>() {
            Ok(index) => {
                if let Some(next) = items.get(index) {
                    resolve_parts(next, rest, out);
                }
            }
            Err(_) => {
                for item in items.iter().filter(|item| item.is_object()) {
                    resolve_parts(item, parts, out);
                }
            }
        },
        _ => {}
    }
}

fn is_operator_document(cond: &Value) -> bool {
    cond.as_object()
        .and_then(|map| map.keys().next())
        .is_some_and(|key| key.starts_with('$'))
}

fn field_matches(values: &[&Value], cond: &Value) -> Result<bool> {
    match cond.as_object() {
        Some(ops) if is_operator_document(cond) => {
            let regex_options = ops.get("$options").and_then(Value::as_str).unwrap_or("");
            for (op, arg) in ops {
                if !apply_operator(values, op, arg, regex_options)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        _ => Ok(equals_any(values, cond)),
    }
}

/// Each candidate plus, for array candidates, their elements.
fn expanded<'a>(values: &[&'a Value]) -> Vec<&'a Value> {
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        out.push(*value);
        if let Value::Array(items) = value {
            out.extend(items.iter());
        }
    }
    out
}

fn equals_any(values: &[&Value], target: &Value) -> bool {
    if values.is_empty() {
        return target.is_null();
    }
    expanded(values)
        .into_iter()
        .any(|v| compare_values(v, target) == Ordering::Equal)
}

fn apply_operator(values: &[&Value], op: &str, arg: &Value, regex_options: &str) -> Result<bool> {
    Ok(match op {
        "$eq" => equals_any(values, arg),
        "$ne" => !equals_any(values, arg),
        "$gt" => compare_any(values, arg, |o| o == Ordering::Greater),
        "$gte" => compare_any(values, arg, |o| o != Ordering::Less),
        "$lt" => compare_any(values, arg, |o| o == Ordering::Less),
        "$lte" => compare_any(values, arg, |o| o != Ordering::Greater),
        "$in" => array_arg(op, arg)?.iter().any(|t| equals_any(values, t)),
        "$nin" => !array_arg(op, arg)?.iter().any(|t| equals_any(values, t)),
        "$all" => {
            let targets = array_arg(op, arg)?;
            !targets.is_empty() && targets.iter().all(|t| equals_any(values, t))
        }
        "$exists" => {
            let wanted = match arg {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64() != Some(0.0),
                _ => bail!("`$exists` requires a boolean"),
            };
            wanted == !values.is_empty()
        }
        "$size" => {
            let size = arg
                .as_u64()
                .ok_or_else(|| anyhow!("`$size` requires a non-negative integer"))?;
            values
                .iter()
                .any(|v| v.as_array().is_some_and(|items| items.len() as u64 == size))
        }
        "$regex" => {
            let pattern = arg
                .as_str()
                .ok_or_else(|| anyhow!("`$regex` requires a string pattern"))?;
            let re = build_regex(pattern, regex_options)?;
            expanded(values)
                .into_iter()
                .filter_map(Value::as_str)
                .any(|s| re.is_match(s))
        }
        "$options" => true,
        "$elemMatch" => {
            let cond = arg
                .as_object()
                .ok_or_else(|| anyhow!("`$elemMatch` requires a document"))?;
            let mut found = false;
            for items in values.iter().filter_map(|v| v.as_array()) {
                for item in items {
                    let ok = if is_operator_document(arg) {
                        field_matches(&[item], arg)?
                    } else {
                        item.is_object() && matches(item, cond)?
                    };
                    if ok {
                        found = true;
                        break;
                    }
                }
            }
            found
        }
        "$not" => match arg {
            Value::Object(_) => !field_matches(values, arg)?,
            Value::String(pattern) => {
                let re = build_regex(pattern, "")?;
                !expanded(values)
                    .into_iter()
                    .filter_map(Value::as_str)
                    .any(|s| re.is_match(s))
            }
            _ => bail!("`$not` requires an operator document or a pattern"),
        },
        "$geoWithin" => geo_within(values, arg)?,
        other => bail!("unsupported operator `{other}`"),
    })
}

fn array_arg<'a>(op: &str, arg: &'a Value) -> Result<&'a Vec<Value>> {
    arg.as_array()
        .ok_or_else(|| anyhow!("`{op}` requires an array"))
}

fn build_regex(pattern: &str, options: &str) -> Result<regex::Regex> {
    let mut builder = RegexBuilder::new(pattern);
    for flag in options.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            other => bail!("unsupported regex option `{other}`"),
        };
    }
    builder
        .size_limit(1 << 20)
        .build()
        .map_err(|err| anyhow!("invalid regex `{pattern}`: {err}"))
}

/// Ordered comparison only within the same type class.
fn compare_any(values: &[&Value], target: &Value, pred: impl Fn(Ordering) -> bool) -> bool {
    expanded(values)
        .into_iter()
        .filter(|v| type_rank(v) == type_rank(target))
        .any(|v| pred(compare_values(v, target)))
}

fn geo_within(values: &[&Value], arg: &Value) -> Result<bool> {
    let sphere = arg
        .get("$centerSphere")
        .and_then(Value::as_array)
        .filter(|parts| parts.len() == 2)
        .ok_or_else(|| anyhow!("`$geoWithin` supports only `$centerSphere: [[lon, lat], radius]`"))?;
    let center = point_of(&sphere[0]).ok_or_else(|| anyhow!("invalid `$centerSphere` center"))?;
    let radius = sphere[1]
        .as_f64()
        .filter(|r| r.is_finite() && *r >= 0.0)
        .ok_or_else(|| anyhow!("invalid `$centerSphere` radius"))?;
    Ok(values
        .iter()
        .filter_map(|v| point_of(v))
        .any(|p| angular_distance(center, p) <= radius))
}

/// A (lon, lat) pair from a GeoJSON point or a legacy two-element array.
fn point_of(value: &Value) -> Option<(f64, f64)> {
    let coords = match value {
        Value::Object(map) => {
            if map.get("type").and_then(Value::as_str) != Some("Point") {
                return None;
            }
            map.get("coordinates")?.as_array()?
        }
        Value::Array(items) => items,
        _ => return None,
    };
    match coords.as_slice() {
        [lon, lat] => Some((lon.as_f64()?, lat.as_f64()?)),
        _ => None,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Object(_) => 4,
        Value::Array(_) => 5,
        Value::Bool(_) => 6,
    }
}

/// Total order over JSON values used by comparisons, sort, and grouping.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => i.cmp(&j),
            _ => {
                let (x, y) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                let ord = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Sort key of `doc` for `path`: the smallest candidate ascending, the
/// largest descending, null when absent.
fn sort_key(doc: &Value, path: &str, direction: i32) -> Value {
    let candidates = resolve(doc, path);
    let mut flat: Vec<&Value> = Vec::new();
    for value in candidates {
        match value {
            Value::Array(items) if !items.is_empty() => flat.extend(items.iter()),
            other => flat.push(other),
        }
    }
    let chosen = if direction < 0 {
        flat.into_iter().max_by(|a, b| compare_values(a, b))
    } else {
        flat.into_iter().min_by(|a, b| compare_values(a, b))
    };
    chosen.cloned().unwrap_or(Value::Null)
}

/// Stable sort of `docs` by `(path, direction)` keys.
pub fn sort_documents(docs: &mut [Value], keys: &[(String, i32)]) {
    if keys.is_empty() {
        return;
    }
    let mut keyed: Vec<(Vec<Value>, Value)> = docs
        .iter_mut()
        .map(|doc| {
            let key = keys
                .iter()
                .map(|(path, dir)| sort_key(doc, path, *dir))
                .collect();
            (key, std::mem::take(doc))
        })
        .collect();
    keyed.sort_by(|(a, _), (b, _)| {
        for ((l, r), (_, dir)) in a.iter().zip(b.iter()).zip(keys.iter()) {
            let ord = compare_values(l, r);
            let ord = if *dir < 0 { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    for (slot, (_, doc)) in docs.iter_mut().zip(keyed) {
        *slot = doc;
    }
}

/// A projection resolved into an include or exclude path tree.
#[derive(Debug, Default)]
struct PathTree {
    children: Map<String, Value>,
}

impl PathTree {
    fn insert(&mut self, path: &str) {
        let mut node = &mut self.children;
        let parts: Vec<&str> = path.split('.').collect();
        for (i, part) in parts.iter().enumerate() {
            let last = i + 1 == parts.len();
            let entry = node
                .entry(part.to_string())
                .or_insert_with(|| if last { Value::Bool(true) } else { Value::Object(Map::new()) });
            if last {
                *entry = Value::Bool(true);
                return;
            }
            if !entry.is_object() {
                // A shorter path already covers this one.
                return;
            }
            match entry {
                Value::Object(next) => node = next,
                _ => return,
            }
        }
    }
}

fn is_truthy(value: &Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
        other => bail!("unsupported projection value {other}"),
    }
}

/// Apply an inclusion or exclusion projection. `_id` is kept unless
/// explicitly excluded.
pub fn project(doc: &Value, projection: Option<&Map<String, Value>>) -> Result<Value> {
    let Some(projection) = projection.filter(|p| !p.is_empty()) else {
        return Ok(doc.clone());
    };
    let Some(source) = doc.as_object() else {
        return Ok(doc.clone());
    };

    let mut include = PathTree::default();
    let mut exclude = PathTree::default();
    let mut keep_id = true;
    let mut id_requested = false;
    for (path, flag) in projection {
        let on = is_truthy(flag)?;
        if path == "_id" {
            keep_id = on;
            id_requested = on;
            continue;
        }
        if on {
            include.insert(path);
        } else {
            exclude.insert(path);
        }
    }
    if !include.children.is_empty() && !exclude.children.is_empty() {
        bail!("projection cannot mix inclusion and exclusion");
    }

    // `{_id: 1}` alone is an inclusion projection of `_id` only.
    let inclusive =
        !include.children.is_empty() || (id_requested && exclude.children.is_empty());
    let mut out = if !inclusive {
        exclude_tree(source, &exclude.children)
    } else {
        let mut kept = include_tree(source, &include.children);
        if keep_id {
            if let Some(id) = source.get("_id") {
                let mut with_id = Map::new();
                with_id.insert("_id".to_string(), id.clone());
                with_id.extend(kept);
                kept = with_id;
            }
        }
        kept
    };
    if !keep_id {
        out.remove("_id");
    }
    Ok(Value::Object(out))
}

fn include_tree(source: &Map<String, Value>, tree: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in source {
        match tree.get(key) {
            None => {}
            Some(Value::Object(sub)) => match value {
                Value::Object(inner) => {
                    out.insert(key.clone(), Value::Object(include_tree(inner, sub)));
                }
                Value::Array(items) => {
                    let projected = items
                        .iter()
                        .filter_map(Value::as_object)
                        .map(|inner| Value::Object(include_tree(inner, sub)))
                        .collect();
                    out.insert(key.clone(), Value::Array(projected));
                }
                _ => {}
            },
            Some(_) => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    out
}

fn exclude_tree(source: &Map<String, Value>, tree: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in source {
        match tree.get(key) {
            None => {
                out.insert(key.clone(), value.clone());
            }
            Some(Value::Object(sub)) => {
                let projected = match value {
                    Value::Object(inner) => Value::Object(exclude_tree(inner, sub)),
                    Value::Array(items) => Value::Array(
                        items
                            .iter()
                            .map(|item| match item {
                                Value::Object(inner) => Value::Object(exclude_tree(inner, sub)),
                                other => other.clone(),
                            })
                            .collect(),
                    ),
                    other => other.clone(),
                };
                out.insert(key.clone(), projected);
            }
            Some(_) => {}
        }
    }
    out
}
