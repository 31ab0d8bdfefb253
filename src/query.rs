//! Query and predicate engine.
//!
//! Evaluates a JSON query map against document slices. Per field path the
//! condition is a literal value, a predicate object (`$in`, `$like`, `$ne`,
//! `$exists`), or the nested root predicate `$or`. Field paths use dot
//! notation; when a segment addresses an array of objects and the next
//! segment is not a numeric index, evaluation flattens into every element
//! and concatenates results.
//!
//! # Example
//!
//! ```
//! use docstore_engine::{Doc, query};
//! use serde_json::json;
//!
//! let docs = vec![
//!     Doc::new("a".into(), "c".into(), "s".into(), "u".into(), json!({"title": "alpha"})),
//!     Doc::new("b".into(), "c".into(), "s".into(), "u".into(), json!({"title": "beta"})),
//! ];
//!
//! let query = json!({"title": {"$like": "a%"}}).as_object().unwrap().clone();
//! let hits = query::find_query(&query, &docs);
//! assert_eq!(hits.len(), 1);
//! assert_eq!(hits[0].id, "a");
//! ```

use std::cmp::Ordering;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::warn;

use crate::document::Doc;

/// A query: field path (dot notation) to condition.
pub type QueryMap = Map<String, Value>;

/// Sort direction for one key of a [`SortSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Ordered list of (field path, direction) pairs; first non-zero wins.
pub type SortSpec = Vec<(String, SortOrder)>;

/// Filter `docs` down to those matching `query`.
#[must_use]
pub fn find_query(query: &QueryMap, docs: &[Doc]) -> Vec<Doc> {
    docs.iter().filter(|doc| matches(doc, query)).cloned().collect()
}

/// Whether a single document satisfies every condition of the query.
#[must_use]
pub fn matches(doc: &Doc, query: &QueryMap) -> bool {
    query.iter().all(|(path, condition)| {
        if path == "$or" {
            return match condition {
                Value::Array(branches) => branches.iter().any(|branch| {
                    branch
                        .as_object()
                        .map(|sub| matches(doc, sub))
                        .unwrap_or(false)
                }),
                _ => false,
            };
        }
        let values = resolve_path(doc, path);
        match condition {
            Value::Object(predicate) if is_predicate(predicate) => {
                eval_predicate(predicate, &values)
            }
            literal => values.iter().any(|v| v == literal),
        }
    })
}

/// Sort documents in place by a sequence of (field, direction) keys.
pub fn sort_docs(docs: &mut [Doc], spec: &SortSpec) {
    docs.sort_by(|a, b| {
        for (field, order) in spec {
            let left = resolve_path(a, field).into_iter().next();
            let right = resolve_path(b, field).into_iter().next();
            let cmp = compare_values(left.as_ref(), right.as_ref());
            if cmp != Ordering::Equal {
                return match order {
                    SortOrder::Asc => cmp,
                    SortOrder::Desc => cmp.reverse(),
                };
            }
        }
        Ordering::Equal
    });
}

/// Resolve a dot path against a document, flattening through arrays of
/// objects whenever the next segment is not a numeric index.
#[must_use]
pub fn resolve_path(doc: &Doc, path: &str) -> Vec<Value> {
    let mut segments = path.split('.');
    let Some(first) = segments.next() else {
        return Vec::new();
    };
    let Some(root) = doc.field(first) else {
        return Vec::new();
    };
    let rest: Vec<&str> = segments.collect();
    let mut out = Vec::new();
    descend(&root, &rest, &mut out);
    out
}

fn descend(value: &Value, segments: &[&str], out: &mut Vec<Value>) {
    let Some((segment, rest)) = segments.split_first() else {
        out.push(value.clone());
        return;
    };
    match value {
        Value::Object(map) => {
            if let Some(next) = map.get(*segment) {
                descend(next, rest, out);
            }
        }
        Value::Array(items) => {
            // Numeric segment indexes into the array; anything else fans out
            // into every element (one-to-many back-reference shapes).
            if let Ok(index) = segment.parse::<usize>() {
                if let Some(next) = items.get(index) {
                    descend(next, rest, out);
                }
            } else {
                for item in items {
                    descend(item, segments, out);
                }
            }
        }
        _ => {}
    }
}

fn is_predicate(map: &Map<String, Value>) -> bool {
    map.keys().any(|k| k.starts_with('$'))
}

fn eval_predicate(predicate: &Map<String, Value>, values: &[Value]) -> bool {
    predicate.iter().all(|(op, operand)| match op.as_str() {
        "$in" => match operand {
            Value::Array(options) => values.iter().any(|v| options.contains(v)),
            _ => false,
        },
        "$like" => match operand.as_str() {
            Some(pattern) => match like_to_regex(pattern) {
                Some(re) => values
                    .iter()
                    .filter_map(Value::as_str)
                    .any(|s| re.is_match(s)),
                None => false,
            },
            None => false,
        },
        "$ne" => values.iter().all(|v| v != operand),
        "$exists" => {
            let want = operand.as_bool().unwrap_or(true);
            values.is_empty() != want
        }
        other => {
            warn!(operator = other, "unsupported query operator");
            false
        }
    })
}

/// Translate a `%` glob into an anchored regex, escaping everything else.
fn like_to_regex(pattern: &str) -> Option<Regex> {
    let body = pattern
        .split('%')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    match Regex::new(&format!("^{body}$")) {
        Ok(re) => Some(re),
        Err(err) => {
            warn!(pattern, error = %err, "invalid $like pattern");
            None
        }
    }
}

fn compare_values(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    match (left, right) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, attributes: Value) -> Doc {
        Doc::new(id.into(), "c".into(), "s".into(), "u".into(), attributes)
    }

    fn query(value: Value) -> QueryMap {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_literal_match() {
        let docs = vec![doc("a", json!({"n": 1})), doc("b", json!({"n": 2}))];
        let hits = find_query(&query(json!({"n": 2})), &docs);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "b");
    }

    #[test]
    fn test_metadata_fields_queryable() {
        let docs = vec![doc("a", json!({})), doc("b", json!({}))];
        let hits = find_query(&query(json!({"id": "a"})), &docs);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_in_operator() {
        let docs = vec![
            doc("a", json!({"state": "open"})),
            doc("b", json!({"state": "closed"})),
            doc("c", json!({"state": "done"})),
        ];
        let hits = find_query(&query(json!({"state": {"$in": ["open", "done"]}})), &docs);
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_like_operator_translates_percent() {
        let docs = vec![
            doc("a", json!({"title": "alpha"})),
            doc("b", json!({"title": "beta"})),
            doc("c", json!({"title": "a.b"})),
        ];
        assert_eq!(find_query(&query(json!({"title": {"$like": "a%"}})), &docs).len(), 2);
        assert_eq!(find_query(&query(json!({"title": {"$like": "%eta"}})), &docs).len(), 1);
        // Regex metacharacters in the pattern are literal.
        assert_eq!(find_query(&query(json!({"title": {"$like": "a.b"}})), &docs).len(), 1);
        // Anchored: no substring match without %.
        assert_eq!(find_query(&query(json!({"title": {"$like": "lph"}})), &docs).len(), 0);
    }

    #[test]
    fn test_ne_and_exists() {
        let docs = vec![doc("a", json!({"x": 1})), doc("b", json!({}))];
        assert_eq!(find_query(&query(json!({"x": {"$ne": 1}})), &docs).len(), 1);
        assert_eq!(find_query(&query(json!({"x": {"$exists": true}})), &docs).len(), 1);
        assert_eq!(find_query(&query(json!({"x": {"$exists": false}})), &docs).len(), 1);
    }

    #[test]
    fn test_or_unions_by_identity() {
        let docs = vec![
            doc("a", json!({"x": 1, "y": 9})),
            doc("b", json!({"x": 2})),
            doc("c", json!({"x": 3})),
        ];
        // "a" satisfies both branches but appears once.
        let hits = find_query(
            &query(json!({"$or": [{"x": 1}, {"y": 9}, {"x": 3}]})),
            &docs,
        );
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[1].id, "c");
    }

    #[test]
    fn test_nested_path_through_object() {
        let docs = vec![doc("a", json!({"author": {"name": "ada"}}))];
        assert_eq!(find_query(&query(json!({"author.name": "ada"})), &docs).len(), 1);
    }

    #[test]
    fn test_array_flattening() {
        let docs = vec![doc(
            "a",
            json!({"backrefs": [{"to": "x"}, {"to": "y"}]}),
        )];
        // Non-numeric next segment fans out into every element.
        assert_eq!(find_query(&query(json!({"backrefs.to": "y"})), &docs).len(), 1);
        assert_eq!(find_query(&query(json!({"backrefs.to": "z"})), &docs).len(), 0);
    }

    #[test]
    fn test_array_numeric_index() {
        let docs = vec![doc("a", json!({"tags": ["red", "blue"]}))];
        assert_eq!(find_query(&query(json!({"tags.0": "red"})), &docs).len(), 1);
        assert_eq!(find_query(&query(json!({"tags.1": "red"})), &docs).len(), 0);
    }

    #[test]
    fn test_sort_numbers_then_strings() {
        let mut docs = vec![
            doc("a", json!({"rank": 2, "title": "bb"})),
            doc("b", json!({"rank": 1, "title": "zz"})),
            doc("c", json!({"rank": 2, "title": "aa"})),
        ];
        sort_docs(
            &mut docs,
            &vec![
                ("rank".to_string(), SortOrder::Asc),
                ("title".to_string(), SortOrder::Asc),
            ],
        );
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_sort_desc() {
        let mut docs = vec![
            doc("a", json!({"rank": 1})),
            doc("b", json!({"rank": 3})),
            doc("c", json!({"rank": 2})),
        ];
        sort_docs(&mut docs, &vec![("rank".to_string(), SortOrder::Desc)]);
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_empty_query_matches_all() {
        let docs = vec![doc("a", json!({})), doc("b", json!({}))];
        assert_eq!(find_query(&QueryMap::new(), &docs).len(), 2);
    }
}
