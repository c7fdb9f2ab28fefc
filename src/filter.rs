//! OSM tags filters and feature-id filters.
//!
//! A tags filter is either a flat mapping `{key -> spec}` or a grouped
//! mapping `{group -> {key -> spec}}` where a spec is `true`/`false`, a
//! single value, or a list of values. Grouped filters are flattened into a
//! flat filter for matching; grouping only affects the result schema.

use std::collections::BTreeMap;

use ahash::AHashSet;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Discriminator for the three OSM element kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Node,
    Way,
    Relation,
}

impl ElementKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Way => "way",
            Self::Relation => "relation",
        }
    }
}

/// A single tag clause: `true` keeps any value, `false` is a negative spec
/// that never matches on its own, a string keeps one value, a list keeps any
/// of its values.
#[derive(Debug, Clone, PartialEq)]
pub enum TagSpec {
    Present(bool),
    Value(String),
    OneOf(Vec<String>),
}

/// Ordered `(key, spec)` clauses of a flat filter.
pub type TagClauses = Vec<(String, TagSpec)>;

/// A flat or grouped OSM tags filter.
#[derive(Debug, Clone, PartialEq)]
pub enum TagsFilter {
    Flat(TagClauses),
    Grouped(Vec<(String, TagClauses)>),
}

impl TagsFilter {
    /// Parse a filter from its JSON shape, rejecting anything that is
    /// neither a flat nor a grouped mapping.
    pub fn from_json(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::FilterShapeInvalid("filter must be a JSON object".into()))?;

        let nested = object.values().filter(|v| v.is_object()).count();
        if nested > 0 && nested < object.len() {
            return Err(Error::FilterShapeInvalid(
                "filter mixes grouped and flat entries".into(),
            ));
        }

        if nested == object.len() && !object.is_empty() {
            let mut groups = Vec::with_capacity(object.len());
            for (group, inner) in object {
                let inner = inner.as_object().expect("checked above");
                groups.push((group.clone(), parse_clauses(inner)?));
            }
            Ok(Self::Grouped(groups))
        } else {
            Ok(Self::Flat(parse_clauses(object)?))
        }
    }

    /// Flatten into the clauses used for matching. Grouped filters merge all
    /// groups; conflicting positive/negative specs for one key are rejected.
    pub fn merged(&self) -> Result<TagClauses> {
        match self {
            Self::Flat(clauses) => merge_clause_lists(std::slice::from_ref(clauses)),
            Self::Grouped(groups) => {
                let lists: Vec<TagClauses> = groups.iter().map(|(_, c)| c.clone()).collect();
                merge_clause_lists(&lists)
            }
        }
    }

    /// Serialize back to the JSON shape, used by the result-path hasher.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Flat(clauses) => Value::Object(clauses_to_map(clauses)),
            Self::Grouped(groups) => {
                let mut map = Map::new();
                for (group, clauses) in groups {
                    map.insert(group.clone(), Value::Object(clauses_to_map(clauses)));
                }
                Value::Object(map)
            }
        }
    }

    pub fn is_grouped(&self) -> bool {
        matches!(self, Self::Grouped(_))
    }
}

fn parse_clauses(object: &Map<String, Value>) -> Result<TagClauses> {
    let mut clauses = Vec::with_capacity(object.len());
    for (key, value) in object {
        let spec = match value {
            Value::Bool(b) => TagSpec::Present(*b),
            Value::String(s) => TagSpec::Value(s.clone()),
            Value::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(s) => values.push(s.clone()),
                        other => {
                            return Err(Error::FilterShapeInvalid(format!(
                                "key '{key}' has a non-string list entry: {other}"
                            )))
                        }
                    }
                }
                TagSpec::OneOf(values)
            }
            other => {
                return Err(Error::FilterShapeInvalid(format!(
                    "key '{key}' has unsupported value: {other}"
                )))
            }
        };
        clauses.push((key.clone(), spec));
    }
    Ok(clauses)
}

fn clauses_to_map(clauses: &TagClauses) -> Map<String, Value> {
    let mut map = Map::new();
    for (key, spec) in clauses {
        let value = match spec {
            TagSpec::Present(b) => Value::Bool(*b),
            TagSpec::Value(s) => Value::String(s.clone()),
            TagSpec::OneOf(values) => {
                Value::Array(values.iter().cloned().map(Value::String).collect())
            }
        };
        map.insert(key.clone(), value);
    }
    map
}

/// Merge several clause lists into one, unioning value lists, saturating on
/// `true`, and rejecting a mix of positive and negative specs for one key.
fn merge_clause_lists(lists: &[TagClauses]) -> Result<TagClauses> {
    let mut merged: TagClauses = Vec::new();
    for clauses in lists {
        for (key, spec) in clauses {
            let Some(index) = merged.iter().position(|(k, _)| k == key) else {
                merged.push((key.clone(), spec.clone()));
                continue;
            };
            let current = &mut merged[index].1;

            let current_negative = matches!(current, TagSpec::Present(false));
            let incoming_negative = matches!(spec, TagSpec::Present(false));
            if current_negative != incoming_negative {
                return Err(Error::FilterShapeInvalid(format!(
                    "conflicting positive and negative specs for key '{key}'"
                )));
            }

            if matches!(current, TagSpec::Present(_)) {
                // `true` saturates; a second `false` changes nothing.
                continue;
            }
            let incoming: Vec<String> = match spec {
                TagSpec::Present(true) => {
                    *current = TagSpec::Present(true);
                    continue;
                }
                TagSpec::Present(false) => continue,
                TagSpec::Value(value) => vec![value.clone()],
                TagSpec::OneOf(values) => values.clone(),
            };
            let mut values = match current {
                TagSpec::Value(existing) => vec![existing.clone()],
                TagSpec::OneOf(existing) => existing.clone(),
                TagSpec::Present(_) => continue,
            };
            extend_unique(&mut values, &incoming);
            *current = TagSpec::OneOf(values);
        }
    }
    Ok(merged)
}

fn extend_unique(values: &mut Vec<String>, incoming: &[String]) {
    for value in incoming {
        if !values.iter().any(|v| v == value) {
            values.push(value.clone());
        }
    }
}

/// True when the tag set satisfies the disjunction of the clauses. Negative
/// specs contribute no clause; a filter with no positive clause matches all.
pub fn clauses_match(clauses: &TagClauses, tags: &BTreeMap<String, String>) -> bool {
    let mut any_positive = false;
    for (key, spec) in clauses {
        match spec {
            TagSpec::Present(false) => continue,
            TagSpec::Present(true) => {
                any_positive = true;
                if tags.contains_key(key) {
                    return true;
                }
            }
            TagSpec::Value(value) => {
                any_positive = true;
                if tags.get(key) == Some(value) {
                    return true;
                }
            }
            TagSpec::OneOf(values) => {
                any_positive = true;
                if tags.get(key).is_some_and(|v| values.iter().any(|c| c == v)) {
                    return true;
                }
            }
        }
    }
    !any_positive
}

/// An explicit feature-identifier filter, partitioned by element kind.
#[derive(Debug, Clone, Default)]
pub struct OsmIdsFilter {
    nodes: AHashSet<i64>,
    ways: AHashSet<i64>,
    relations: AHashSet<i64>,
}

impl OsmIdsFilter {
    /// Parse identifiers of the form `node/<id>`, `way/<id>`,
    /// `relation/<id>`. Returns `None` for an empty list.
    pub fn parse(ids: &[String]) -> Result<Option<Self>> {
        if ids.is_empty() {
            return Ok(None);
        }
        let mut filter = Self::default();
        for id in ids {
            let (kind, raw) = id.split_once('/').ok_or_else(|| {
                Error::FilterShapeInvalid(format!(
                    "feature id '{id}' is not of the form node/<id>, way/<id> or relation/<id>"
                ))
            })?;
            let number: i64 = raw.parse().map_err(|_| {
                Error::FilterShapeInvalid(format!("feature id '{id}' has a non-integer id part"))
            })?;
            match kind {
                "node" => filter.nodes.insert(number),
                "way" => filter.ways.insert(number),
                "relation" => filter.relations.insert(number),
                other => {
                    return Err(Error::FilterShapeInvalid(format!(
                        "feature id '{id}' has unknown kind '{other}'"
                    )))
                }
            };
        }
        Ok(Some(filter))
    }

    /// Whether an element passes the id filter. A kind with no listed ids
    /// keeps nothing of that kind, matching the reference behavior.
    pub fn allows(&self, kind: ElementKind, id: i64) -> bool {
        match kind {
            ElementKind::Node => self.nodes.contains(&id),
            ElementKind::Way => self.ways.contains(&id),
            ElementKind::Relation => self.relations.contains(&id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn parses_flat_filter() {
        let filter =
            TagsFilter::from_json(&json!({"building": true, "highway": ["primary", "secondary"], "amenity": "bench"}))
                .unwrap();
        assert!(!filter.is_grouped());
        let merged = filter.merged().unwrap();
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn parses_grouped_filter() {
        let filter = TagsFilter::from_json(&json!({
            "group": {"building": true, "amenity": "bench"}
        }))
        .unwrap();
        assert!(filter.is_grouped());
        let merged = filter.merged().unwrap();
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn rejects_mixed_shapes() {
        let err = TagsFilter::from_json(&json!({"a": {"b": true}, "c": true})).unwrap_err();
        assert!(matches!(err, Error::FilterShapeInvalid(_)));
    }

    #[test]
    fn rejects_positive_negative_conflict() {
        let filter = TagsFilter::from_json(&json!({
            "g1": {"building": true},
            "g2": {"building": false}
        }))
        .unwrap();
        assert!(matches!(filter.merged(), Err(Error::FilterShapeInvalid(_))));
    }

    #[test]
    fn merging_unions_value_lists() {
        let filter = TagsFilter::from_json(&json!({
            "g1": {"highway": ["primary"]},
            "g2": {"highway": ["primary", "secondary"]}
        }))
        .unwrap();
        let merged = filter.merged().unwrap();
        assert_eq!(
            merged,
            vec![(
                "highway".to_string(),
                TagSpec::OneOf(vec!["primary".to_string(), "secondary".to_string()])
            )]
        );
    }

    #[test]
    fn matching_is_a_disjunction() {
        let filter = TagsFilter::from_json(&json!({"building": true, "amenity": "bench"})).unwrap();
        let merged = filter.merged().unwrap();
        assert!(clauses_match(&merged, &tags(&[("building", "yes")])));
        assert!(clauses_match(&merged, &tags(&[("amenity", "bench")])));
        assert!(!clauses_match(&merged, &tags(&[("amenity", "fountain")])));
        assert!(!clauses_match(&merged, &tags(&[])));
    }

    #[test]
    fn negative_specs_do_not_filter_on_their_own() {
        let filter = TagsFilter::from_json(&json!({"building": false})).unwrap();
        let merged = filter.merged().unwrap();
        assert!(clauses_match(&merged, &tags(&[("amenity", "bench")])));
    }

    #[test]
    fn id_filter_partitions_by_kind() {
        let filter = OsmIdsFilter::parse(&["way/1".to_string(), "node/2".to_string()])
            .unwrap()
            .unwrap();
        assert!(filter.allows(ElementKind::Way, 1));
        assert!(filter.allows(ElementKind::Node, 2));
        assert!(!filter.allows(ElementKind::Node, 1));
        assert!(!filter.allows(ElementKind::Relation, 1));
    }

    #[test]
    fn id_filter_rejects_malformed_ids() {
        assert!(OsmIdsFilter::parse(&["way-1".to_string()]).is_err());
        assert!(OsmIdsFilter::parse(&["road/1".to_string()]).is_err());
        assert!(OsmIdsFilter::parse(&["way/x".to_string()]).is_err());
    }
}
