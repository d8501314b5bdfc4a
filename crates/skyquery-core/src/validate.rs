//! Query validator: decides whether a request may run and builds its
//! [`NormalizedPlan`].
//!
//! General searches go through, in order: the literal-prefix check, the
//! allow-list, the deny-list, the typed [`ReadCall`] parse, the privileged
//! collection check, and a recursive walk of any aggregation pipeline.
//! The administrative identity skips every policy check but never the
//! typed parse.
//!
//! Cone searches decode the radius, unit, positions, and per-catalog
//! filter/projection into one `(catalog, object) → (filter, projection)`
//! map, with the spherical range predicate embedded in every filter.

use serde_json::{json, Map, Value};

use crate::coords::{pair_to_geo_point, to_radians, AngularUnit, CoordinateError};
use crate::error::Rejection;
use crate::general::{ReadCall, ReadOp};
use crate::literal::{parse_document, parse_literal, Literal};
use crate::models::{
    CatalogQuery, CatalogSpec, ConePlan, ExecutionOptions, Identity, NormalizedPlan,
    ObjectCoordinates, PlanBody, QueryPayload, QueryRequest,
};
use crate::policy::QueryPolicy;

/// Document field holding the GeoJSON position of a catalog source.
pub const POSITION_FIELD: &str = "coordinates.radec_geojson";

/// Operators that run server-side code; refused in cone-search filters.
const CODE_OPERATORS: &[&str] = &["$where", "$function", "$accumulator"];

const LITERAL_PREFIXES: &[char] = &['"', '\'', '[', '(', '{'];

pub struct Validator {
    policy: QueryPolicy,
}

impl Validator {
    pub fn new(policy: QueryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &QueryPolicy {
        &self.policy
    }

    pub fn validate(
        &self,
        request: &QueryRequest,
        caller: &Identity,
    ) -> Result<NormalizedPlan, Rejection> {
        ExecutionOptions::from_kwargs(&request.kwargs)?;
        let admin = self.policy.is_admin(&caller.username);
        let body = match &request.payload {
            QueryPayload::GeneralSearch { query } => self.general_search(query, admin)?,
            QueryPayload::ConeSearch {
                object_coordinates,
                catalogs,
            } => PlanBody::ConeSearch(self.cone_search(object_coordinates, catalogs, admin)?),
        };
        let plan = NormalizedPlan {
            user: caller.username.clone(),
            body,
            kwargs: request.kwargs.clone(),
        };
        tracing::debug!(
            user = %plan.user,
            query_type = plan.query_type().as_str(),
            "validated query"
        );
        Ok(plan)
    }

    fn general_search(&self, query: &str, admin: bool) -> Result<PlanBody, Rejection> {
        if !admin {
            if query.trim_start().starts_with(LITERAL_PREFIXES) {
                return Err(Rejection::LiteralPrefix);
            }
            if !self.policy.calls_allowed_verb(query) {
                return Err(Rejection::MissingReadOperation);
            }
            if let Some(token) = self.policy.denied_token(query) {
                return Err(Rejection::DeniedToken(token.to_string()));
            }
        }

        let call = ReadCall::parse(query)?;

        if !admin {
            if !self
                .policy
                .allowed_verbs
                .iter()
                .any(|verb| verb == call.op.verb())
            {
                return Err(Rejection::MissingReadOperation);
            }
            if self.policy.is_privileged(&call.collection) {
                return Err(Rejection::PrivilegedCollection(call.collection));
            }
            if let ReadOp::Aggregate { pipeline } = &call.op {
                for stage in pipeline {
                    self.check_stage(stage)?;
                }
            }
        }

        Ok(PlanBody::GeneralSearch {
            query: query.to_string(),
            call,
        })
    }

    /// Walks a pipeline stage, including sub-pipelines nested anywhere in it.
    fn check_stage(&self, stage: &Map<String, Value>) -> Result<(), Rejection> {
        for (key, value) in stage {
            match key.as_str() {
                "$out" | "$merge" => return Err(Rejection::WriteStage(key.clone())),
                "$lookup" | "$graphLookup" => {
                    if let Some(from) = value.get("from").and_then(Value::as_str) {
                        self.check_lookup_target(from)?;
                    }
                }
                "$unionWith" => {
                    let target = match value {
                        Value::String(coll) => Some(coll.as_str()),
                        other => other.get("coll").and_then(Value::as_str),
                    };
                    if let Some(target) = target {
                        self.check_lookup_target(target)?;
                    }
                }
                _ => {}
            }
            self.check_nested(value)?;
        }
        Ok(())
    }

    fn check_nested(&self, value: &Value) -> Result<(), Rejection> {
        match value {
            Value::Object(map) => self.check_stage(map),
            Value::Array(items) => items.iter().try_for_each(|item| self.check_nested(item)),
            _ => Ok(()),
        }
    }

    fn check_lookup_target(&self, collection: &str) -> Result<(), Rejection> {
        if self.policy.is_privileged(collection) {
            Err(Rejection::PrivilegedLookup(collection.to_string()))
        } else {
            Ok(())
        }
    }

    fn cone_search(
        &self,
        coordinates: &ObjectCoordinates,
        catalogs: &std::collections::BTreeMap<String, CatalogSpec>,
        admin: bool,
    ) -> Result<ConePlan, Rejection> {
        let unit: AngularUnit = coordinates
            .cone_search_unit
            .parse()
            .map_err(|_| Rejection::UnknownUnit(coordinates.cone_search_unit.clone()))?;
        let radius = to_radians(parse_radius(&coordinates.cone_search_radius)?, unit);
        let positions = decode_positions(&coordinates.radec)?;

        if catalogs.is_empty() {
            return Err(Rejection::NoCatalogs);
        }

        let mut plan = ConePlan::new();
        for (catalog, spec) in catalogs {
            if !admin && self.policy.is_privileged(catalog) {
                return Err(Rejection::PrivilegedCollection(catalog.clone()));
            }
            let filter = decode_document(catalog, "filter", &spec.filter)?;
            if !admin {
                reject_code_operators(&Value::Object(filter.clone()))?;
            }
            let projection = Some(decode_document(catalog, "projection", &spec.projection)?)
                .filter(|p| !p.is_empty());

            let per_object = plan.entry(catalog.clone()).or_default();
            for (name, (lon, lat)) in &positions {
                per_object.insert(
                    name.clone(),
                    CatalogQuery {
                        filter: cone_filter(*lon, *lat, radius, &filter),
                        projection: projection.clone(),
                    },
                );
            }
        }
        Ok(plan)
    }
}

fn parse_radius(value: &Value) -> Result<f64, Rejection> {
    let radius = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| Rejection::InvalidRadius(value.to_string()))?;
    if !radius.is_finite() || radius < 0.0 {
        return Err(Rejection::InvalidRadius(value.to_string()));
    }
    Ok(radius)
}

/// Decode `radec` into `(object name, (lon, lat))` pairs, in input order.
///
/// A list of pairs names each object by the `str()` of its pair; a mapping
/// names each object by the `str()` of its key.
pub fn decode_positions(radec: &Value) -> Result<Vec<(String, (f64, f64))>, Rejection> {
    let literal = match radec {
        Value::String(src) => {
            parse_literal(src.trim()).map_err(|source| Rejection::InvalidLiteral {
                field: "radec".to_string(),
                source,
            })?
        }
        other => Literal::from_json(other),
    };
    let positions = match &literal {
        Literal::List(pairs) | Literal::Tuple(pairs) => pairs
            .iter()
            .map(|pair| Ok((pair.to_display_string(), pair_to_geo_point(pair)?)))
            .collect::<Result<Vec<_>, CoordinateError>>()?,
        Literal::Dict(entries) => entries
            .iter()
            .map(|(name, pair)| Ok((name.to_display_string(), pair_to_geo_point(pair)?)))
            .collect::<Result<Vec<_>, CoordinateError>>()?,
        other => {
            return Err(Rejection::Malformed(format!(
                "radec must be a list of pairs or a mapping, got {}",
                other.kind()
            )))
        }
    };
    if positions.is_empty() {
        return Err(Rejection::EmptyPositions);
    }
    Ok(positions)
}

fn decode_document(
    catalog: &str,
    field: &str,
    value: &Value,
) -> Result<Map<String, Value>, Rejection> {
    match value {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map.clone()),
        Value::String(src) => parse_document(src).map_err(|err| Rejection::MalformedCatalog {
            catalog: catalog.to_string(),
            reason: format!("{field}: {err}"),
        }),
        other => Err(Rejection::MalformedCatalog {
            catalog: catalog.to_string(),
            reason: format!("{field} must be a mapping, got {other}"),
        }),
    }
}

fn reject_code_operators(value: &Value) -> Result<(), Rejection> {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                if CODE_OPERATORS.contains(&key.as_str()) {
                    return Err(Rejection::DeniedToken(key.clone()));
                }
                reject_code_operators(nested)?;
            }
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(reject_code_operators),
        _ => Ok(()),
    }
}

/// Intersect the caller filter with the cone around `(lon, lat)`.
pub fn cone_filter(
    lon: f64,
    lat: f64,
    radius: f64,
    caller_filter: &Map<String, Value>,
) -> Map<String, Value> {
    let cone = json!({"$geoWithin": {"$centerSphere": [[lon, lat], radius]}});
    let mut filter = Map::new();
    if caller_filter.contains_key(POSITION_FIELD) {
        let mut position = Map::new();
        position.insert(POSITION_FIELD.to_string(), cone);
        filter.insert(
            "$and".to_string(),
            Value::Array(vec![
                Value::Object(position),
                Value::Object(caller_filter.clone()),
            ]),
        );
    } else {
        filter.insert(POSITION_FIELD.to_string(), cone);
        filter.extend(caller_filter.clone());
    }
    filter
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::f64::consts::PI;

    fn validator() -> Validator {
        Validator::new(QueryPolicy::default())
    }

    fn general(query: &str) -> QueryRequest {
        serde_json::from_value(json!({"query_type": "general_search", "query": query})).unwrap()
    }

    fn cone(radec: Value, radius: Value, unit: &str, catalogs: Value) -> QueryRequest {
        serde_json::from_value(json!({
            "query_type": "cone_search",
            "object_coordinates": {
                "radec": radec,
                "cone_search_radius": radius,
                "cone_search_unit": unit
            },
            "catalogs": catalogs
        }))
        .unwrap()
    }

    fn alice() -> Identity {
        Identity::new("alice")
    }

    #[test]
    fn test_privileged_collection_rejected() {
        let err = validator()
            .validate(&general("db['users'].find({})"), &alice())
            .unwrap_err();
        assert_eq!(err, Rejection::PrivilegedCollection("users".into()));
    }

    #[test]
    fn test_accepted_body_is_verbatim() {
        let query = "db['sources'].find({}, {'_id': 1})";
        let plan = validator().validate(&general(query), &alice()).unwrap();
        assert_eq!(plan.user, "alice");
        assert_eq!(plan.body.to_json(), Value::String(query.to_string()));
    }

    #[test]
    fn test_dotted_field_filter_is_accepted() {
        let query = "db['sources'].find({'photometry.updated_at': {'$exists': True}})";
        let plan = validator().validate(&general(query), &alice()).unwrap();
        assert_eq!(plan.body.to_json(), Value::String(query.to_string()));
        assert!(matches!(
            validator().validate(&general("db['sources'].delete_many({})"), &alice()),
            Err(Rejection::DeniedToken(_))
        ));
    }

    #[test]
    fn test_general_search_check_order() {
        let v = validator();
        assert_eq!(
            v.validate(&general("  {'a': 1}"), &alice()).unwrap_err(),
            Rejection::LiteralPrefix
        );
        assert_eq!(
            v.validate(&general("db['s'].watch()"), &alice()).unwrap_err(),
            Rejection::MissingReadOperation
        );
        assert_eq!(
            v.validate(&general("db['s'].find({}).delete_one({})"), &alice())
                .unwrap_err(),
            Rejection::DeniedToken(".delete".into())
        );
        assert!(matches!(
            v.validate(&general("db['s'].find({}) if True else 1"), &alice())
                .unwrap_err(),
            Rejection::Malformed(_)
        ));
    }

    #[test]
    fn test_admin_bypasses_policy_but_not_parse() {
        let v = validator();
        let admin = Identity::new("admin");
        assert!(v.validate(&general("db['users'].find({})"), &admin).is_ok());
        assert!(v
            .validate(&general("db['users'].drop()"), &admin)
            .is_err());
    }

    #[test]
    fn test_pipeline_lookup_into_privileged_collection() {
        let v = validator();
        let err = v
            .validate(
                &general(
                    "db['sources'].aggregate([{'$match': {}}, {'$lookup': {'from': 'users', 'localField': 'a', 'foreignField': 'b', 'as': 'u'}}])",
                ),
                &alice(),
            )
            .unwrap_err();
        assert_eq!(err, Rejection::PrivilegedLookup("users".into()));

        let err = v
            .validate(
                &general("db['sources'].aggregate([{'$facet': {'x': [{'$unionWith': 'queries'}]}}])"),
                &alice(),
            )
            .unwrap_err();
        assert_eq!(err, Rejection::PrivilegedLookup("queries".into()));

        assert!(v
            .validate(
                &general("db['sources'].aggregate([{'$lookup': {'from': 'ztf', 'localField': 'a', 'foreignField': 'b', 'as': 'z'}}])"),
                &alice()
            )
            .is_ok());
    }

    #[test]
    fn test_cone_search_arcsec_radius() {
        let req = cone(
            json!("[(10.0, 20.0)]"),
            json!("3600"),
            "arcsec",
            json!({"sources": {"filter": "{}", "projection": "{'_id': 1}"}}),
        );
        let plan = validator().validate(&req, &alice()).unwrap();
        let PlanBody::ConeSearch(body) = plan.body else {
            panic!("expected cone search");
        };
        let query = &body["sources"]["(10.0, 20.0)"];
        let center = &query.filter[POSITION_FIELD]["$geoWithin"]["$centerSphere"];
        assert_eq!(center[0], json!([-170.0, 20.0]));
        let radius = center[1].as_f64().unwrap();
        assert!((radius - PI / 180.0).abs() < 1e-12);
        assert_eq!(
            query.projection,
            Some(json!({"_id": 1}).as_object().cloned().unwrap())
        );
    }

    #[test]
    fn test_cone_search_named_positions_and_filter_merge() {
        let req = cone(
            json!({"M31": [10.68, 41.27], "obj.2": ["00:42:44", "+41:16:09"]}),
            json!(2),
            "arcmin",
            json!({"ztf": {"filter": {"mag": {"$lt": 18}}, "projection": {}}}),
        );
        let plan = validator().validate(&req, &alice()).unwrap();
        let PlanBody::ConeSearch(body) = plan.body else {
            panic!("expected cone search");
        };
        let objects = &body["ztf"];
        assert_eq!(
            objects.keys().cloned().collect::<Vec<_>>(),
            vec!["M31".to_string(), "obj.2".to_string()]
        );
        let m31 = &objects["M31"];
        assert_eq!(m31.filter["mag"], json!({"$lt": 18}));
        assert!(m31.filter.contains_key(POSITION_FIELD));
        assert_eq!(m31.projection, None);
    }

    #[test]
    fn test_caller_cannot_override_cone_predicate() {
        let caller = json!({"coordinates.radec_geojson": {"$exists": true}});
        let filter = cone_filter(0.0, 0.0, 0.1, caller.as_object().unwrap());
        assert_eq!(filter.len(), 1);
        assert_eq!(filter["$and"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_cone_search_rejections() {
        let v = validator();
        let catalogs = json!({"sources": {}});
        let cases = [
            (
                cone(json!("[(1, 2)]"), json!(1), "parsec", catalogs.clone()),
                Rejection::UnknownUnit("parsec".into()),
            ),
            (
                cone(json!("[]"), json!(1), "deg", catalogs.clone()),
                Rejection::EmptyPositions,
            ),
            (
                cone(json!("[(1, 2)]"), json!(-1), "deg", catalogs.clone()),
                Rejection::InvalidRadius("-1".into()),
            ),
            (
                cone(json!("[(1, 2)]"), json!(1), "deg", json!({})),
                Rejection::NoCatalogs,
            ),
            (
                cone(json!("[(1, 2)]"), json!(1), "deg", json!({"users": {}})),
                Rejection::PrivilegedCollection("users".into()),
            ),
            (
                cone(
                    json!("[(1, 2)]"),
                    json!(1),
                    "deg",
                    json!({"s": {"filter": {"$where": "1"}}}),
                ),
                Rejection::DeniedToken("$where".into()),
            ),
            (
                cone(json!("[(400, 2)]"), json!(1), "deg", catalogs.clone()),
                Rejection::InvalidCoordinates(CoordinateError::RaOutOfRange(400.0)),
            ),
        ];
        for (req, expected) in cases {
            assert_eq!(v.validate(&req, &alice()).unwrap_err(), expected);
        }

        let err = v
            .validate(
                &cone(
                    json!("__import__('os')"),
                    json!(1),
                    "deg",
                    catalogs.clone(),
                ),
                &alice(),
            )
            .unwrap_err();
        assert!(matches!(err, Rejection::InvalidLiteral { .. }));

        let err = v
            .validate(
                &cone(json!("[(1, 2)]"), json!(1), "deg", json!({"s": {"filter": "[1]"}})),
                &alice(),
            )
            .unwrap_err();
        assert!(matches!(err, Rejection::MalformedCatalog { .. }));
    }

    #[test]
    fn test_malformed_kwargs_rejected() {
        let mut req = general("db['s'].find({})");
        req.kwargs.insert("save".into(), json!("yes"));
        assert!(matches!(
            validator().validate(&req, &alice()).unwrap_err(),
            Rejection::Malformed(_)
        ));
    }
}
