// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Rule evaluation: turning one source document into N attribute bags.
//!
//! Rules are applied in a stable order with non-fan-out rules first, so
//! field assignment is deterministic regardless of how the descriptor
//! author interleaved them. A pattern rule runs its regex globally over the
//! source string; with `multi_doc` set, every match after the first starts
//! a fresh result document once the target field is already taken.

use regex::Regex;
use serde_json::{Map, Value};
use tracing::warn;

use crate::derived::descriptor::{Descriptor, MappingRule};
use crate::document::Doc;

/// Evaluate a descriptor's mapping rules against a source document.
///
/// Returns the raw attribute bags; the engine seeds identity, back-references
/// and the init template afterwards.
#[must_use]
pub fn eval_rules(descriptor: &Descriptor, doc: &Doc) -> Vec<Map<String, Value>> {
    let mut ordered: Vec<&MappingRule> = descriptor.rules.iter().collect();
    // Stable: ties keep the descriptor's original rule order.
    ordered.sort_by_key(|rule| rule.pattern.as_ref().map_or(false, |p| p.multi_doc));

    let mut results: Vec<Map<String, Value>> = Vec::new();
    for rule in ordered {
        let Some(value) = doc.field(&rule.source_field) else {
            continue;
        };
        match &rule.pattern {
            None => {
                if results.is_empty() {
                    results.push(Map::new());
                }
                results[0].insert(rule.target_field.clone(), value);
            }
            Some(pattern) => {
                let Some(source) = value.as_str() else {
                    continue;
                };
                let regex = match Regex::new(&pattern.pattern) {
                    Ok(regex) => regex,
                    Err(err) => {
                        warn!(
                            descriptor = %descriptor.id,
                            pattern = %pattern.pattern,
                            error = %err,
                            "skipping rule with invalid pattern"
                        );
                        continue;
                    }
                };

                let mut cursor = 0usize;
                for captures in regex.captures_iter(source) {
                    let extracted = match pattern.group {
                        Some(group) => captures.get(group),
                        None => captures.get(0),
                    };
                    let Some(extracted) = extracted else { continue };

                    if pattern.multi_doc {
                        // Advance past documents that already carry this
                        // target field, opening a new one at the end.
                        while cursor < results.len()
                            && results[cursor].contains_key(&rule.target_field)
                        {
                            cursor += 1;
                        }
                        if cursor == results.len() {
                            results.push(Map::new());
                        }
                    } else if results.is_empty() {
                        results.push(Map::new());
                    }
                    let target = if pattern.multi_doc { cursor } else { 0 };
                    results[target].insert(
                        rule.target_field.clone(),
                        Value::String(extracted.as_str().to_string()),
                    );
                }
            }
        }
    }
    results
}

/// Evaluate collection-rule mapping rules into a single embedded summary.
/// No fan-out: the first produced bag wins.
#[must_use]
pub fn eval_summary(rules: &[MappingRule], doc: &Doc) -> Map<String, Value> {
    let mut summary = Map::new();
    for rule in rules {
        if let Some(value) = doc.field(&rule.source_field) {
            summary.insert(rule.target_field.clone(), value);
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derived::descriptor::DescriptorBuilder;
    use serde_json::json;

    fn task(attributes: Value) -> Doc {
        Doc::new(
            "t1".into(),
            "task.class.Task".into(),
            "s".into(),
            "u".into(),
            attributes,
        )
    }

    fn descriptor_from(builder: DescriptorBuilder) -> Descriptor {
        let doc = Doc::new(
            "dd-1".into(),
            crate::hierarchy::CLASS_DERIVED_DATA_DESCRIPTOR.into(),
            crate::hierarchy::SPACE_MODEL.into(),
            "system".into(),
            builder.build_attributes(),
        );
        Descriptor::from_doc(&doc).unwrap()
    }

    fn titles(results: &[Map<String, Value>], field: &str) -> Vec<String> {
        results
            .iter()
            .filter_map(|r| r.get(field))
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_plain_copy_rule() {
        let d = descriptor_from(
            DescriptorBuilder::new("task.class.Task", "task.class.Title").rule("shortId", "title"),
        );
        let results = eval_rules(&d, &task(json!({"shortId": "TASK-1"})));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["title"], "TASK-1");
    }

    #[test]
    fn test_missing_source_field_produces_nothing() {
        let d = descriptor_from(
            DescriptorBuilder::new("task.class.Task", "task.class.Title").rule("shortId", "title"),
        );
        assert!(eval_rules(&d, &task(json!({}))).is_empty());
    }

    #[test]
    fn test_multi_doc_fan_out() {
        let d = descriptor_from(
            DescriptorBuilder::new("task.class.Task", "task.class.Title")
                .pattern_rule("title", "title", "A.", None, true),
        );
        let results = eval_rules(&d, &task(json!({"title": "AB AC DAD QAE"})));
        assert_eq!(titles(&results, "title"), vec!["AB", "AC", "AD", "AE"]);
    }

    #[test]
    fn test_capture_group_extraction() {
        let d = descriptor_from(
            DescriptorBuilder::new("task.class.Task", "task.class.Title")
                .pattern_rule("title", "title", "(A(.))", Some(2), true),
        );
        let results = eval_rules(&d, &task(json!({"title": "qwe AB AC DAD QAE"})));
        assert_eq!(titles(&results, "title"), vec!["B", "C", "D", "E"]);
    }

    #[test]
    fn test_pattern_without_multi_doc_keeps_last_match() {
        let d = descriptor_from(
            DescriptorBuilder::new("task.class.Task", "task.class.Title")
                .pattern_rule("title", "title", "A.", None, false),
        );
        let results = eval_rules(&d, &task(json!({"title": "AB AC"})));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["title"], "AC");
    }

    #[test]
    fn test_plain_rules_apply_before_fan_out() {
        // The descriptor lists the multi-doc rule first, but the plain copy
        // still lands on the first result document.
        let d = descriptor_from(
            DescriptorBuilder::new("task.class.Task", "task.class.Title")
                .pattern_rule("title", "tag", "A.", None, true)
                .rule("shortId", "shortId"),
        );
        let results = eval_rules(&d, &task(json!({"title": "AB AC", "shortId": "TASK-9"})));
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["shortId"], "TASK-9");
        assert_eq!(results[0]["tag"], "AB");
        assert_eq!(results[1]["tag"], "AC");
        assert!(!results[1].contains_key("shortId"));
    }

    #[test]
    fn test_two_fan_out_rules_fill_pairwise() {
        let d = descriptor_from(
            DescriptorBuilder::new("task.class.Task", "task.class.Title")
                .pattern_rule("a", "first", "\\w+", None, true)
                .pattern_rule("b", "second", "\\w+", None, true),
        );
        let results = eval_rules(&d, &task(json!({"a": "x y", "b": "1 2"})));
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["first"], "x");
        assert_eq!(results[0]["second"], "1");
        assert_eq!(results[1]["first"], "y");
        assert_eq!(results[1]["second"], "2");
    }

    #[test]
    fn test_invalid_pattern_is_skipped() {
        let d = descriptor_from(
            DescriptorBuilder::new("task.class.Task", "task.class.Title")
                .pattern_rule("title", "title", "(unclosed", None, true)
                .rule("shortId", "shortId"),
        );
        let results = eval_rules(&d, &task(json!({"title": "AB", "shortId": "TASK-1"})));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["shortId"], "TASK-1");
    }

    #[test]
    fn test_summary_copies_fields() {
        let rules = vec![
            MappingRule {
                source_field: "title".into(),
                target_field: "title".into(),
                pattern: None,
            },
            MappingRule {
                source_field: "missing".into(),
                target_field: "gone".into(),
                pattern: None,
            },
        ];
        let summary = eval_summary(&rules, &task(json!({"title": "hello"})));
        assert_eq!(summary.len(), 1);
        assert_eq!(summary["title"], "hello");
    }
}
