// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Class hierarchy: extension graph, ancestry, and storage domain resolution.
//!
//! Classes form a forest rooted at classes with no `extends`. The hierarchy
//! is an arena of class records indexed by id; ancestry is resolved by id
//! lookups and cached per class, and each class's storage domain is the
//! domain declared by the nearest ancestor that declares one.
//!
//! # Example
//!
//! ```
//! use docstore_engine::hierarchy::{ClassDef, Hierarchy};
//!
//! let hierarchy = Hierarchy::with_core_classes();
//! hierarchy.record_class(ClassDef {
//!     id: "task.class.Task".into(),
//!     extends: Some(docstore_engine::hierarchy::CLASS_DOC.into()),
//!     domain: Some("task".into()),
//! });
//! hierarchy.record_class(ClassDef {
//!     id: "task.class.Issue".into(),
//!     extends: Some("task.class.Task".into()),
//!     domain: None,
//! });
//!
//! // Domain is inherited from the nearest declaring ancestor.
//! assert_eq!(hierarchy.domain("task.class.Issue").unwrap(), "task");
//! assert!(hierarchy.is_derived("task.class.Issue", "task.class.Task"));
//! ```

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use crate::document::Doc;
use crate::error::{EngineError, Result};

/// Root class every document ultimately extends.
pub const CLASS_DOC: &str = "core.class.Doc";
/// Class definition documents.
pub const CLASS_CLASS: &str = "core.class.Class";
/// Base class of every transaction.
pub const CLASS_TX: &str = "core.class.Tx";
/// Materialization rule documents.
pub const CLASS_DERIVED_DATA_DESCRIPTOR: &str = "core.class.DerivedDataDescriptor";
/// Base class of engine-produced documents.
pub const CLASS_DERIVED_DATA: &str = "core.class.DerivedData";
/// Short reference counter documents.
pub const CLASS_SHORT_REF: &str = "core.class.ShortRef";

/// Domain holding the model (classes, descriptors).
pub const DOMAIN_MODEL: &str = "model";
/// Reserved domain holding the transaction log itself.
pub const DOMAIN_TX: &str = "tx";
/// Domain holding short reference counters.
pub const DOMAIN_SHORT_REF: &str = "shortref";

/// Space where model documents live.
pub const SPACE_MODEL: &str = "core.space.Model";

/// A registered class: identifier, optional parent, optional declared domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDef {
    pub id: String,
    pub extends: Option<String>,
    pub domain: Option<String>,
}

impl ClassDef {
    /// Parse a class definition from a stored `core.class.Class` document.
    #[must_use]
    pub fn from_doc(doc: &Doc) -> Self {
        Self {
            id: doc.id.clone(),
            extends: doc.attr_str("extends").map(str::to_string),
            domain: doc.attr_str("domain").map(str::to_string),
        }
    }

    /// Attribute bag for storing this definition as a class document.
    #[must_use]
    pub fn to_attributes(&self) -> Value {
        let mut map = serde_json::Map::new();
        if let Some(extends) = &self.extends {
            map.insert("extends".into(), Value::String(extends.clone()));
        }
        if let Some(domain) = &self.domain {
            map.insert("domain".into(), Value::String(domain.clone()));
        }
        Value::Object(map)
    }
}

#[derive(Debug)]
struct ClassRecord {
    def: ClassDef,
    /// All classes whose ancestry includes this one, registration order.
    descendants: Vec<String>,
    /// Memoized class-to-root chain (including self).
    ancestors: Option<Vec<String>>,
    /// Memoized resolved domain.
    domain: Option<String>,
}

/// The class-extension graph plus derived ancestry/domain/descendant indices.
///
/// Thread-safe; reads memoize into the arena under a write lock on first use.
#[derive(Debug, Default)]
pub struct Hierarchy {
    classes: RwLock<HashMap<String, ClassRecord>>,
}

impl Hierarchy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A hierarchy seeded with the reserved core classes.
    #[must_use]
    pub fn with_core_classes() -> Self {
        let hierarchy = Self::new();
        for def in core_classes() {
            hierarchy.record_class(def);
        }
        hierarchy
    }

    /// Register a class, or replace its attributes if already registered.
    ///
    /// Registration is idempotent per class id: re-registering replaces the
    /// definition and drops its memoized ancestry/domain, but preserves the
    /// descendant links already pointing at it.
    pub fn record_class(&self, def: ClassDef) {
        let mut classes = self.classes.write();
        let id = def.id.clone();

        match classes.get_mut(&id) {
            Some(record) => {
                debug!(class = %id, "replacing class definition");
                record.def = def;
                // Memoized chains of every descendant may reach through this
                // class, drop them all.
                let stale = record.descendants.clone();
                for descendant in stale {
                    if let Some(record) = classes.get_mut(&descendant) {
                        record.ancestors = None;
                        record.domain = None;
                    }
                }
            }
            None => {
                classes.insert(
                    id.clone(),
                    ClassRecord {
                        def,
                        descendants: vec![id.clone()],
                        ancestors: None,
                        domain: None,
                    },
                );
                // Append the new class to each ancestor's descendant list.
                // A cyclic extends chain terminates the walk; it is reported
                // as a fatal error on the first ancestry lookup.
                let mut visited = std::collections::HashSet::new();
                visited.insert(id.clone());
                let mut parent = classes
                    .get(&id)
                    .and_then(|r| r.def.extends.clone());
                while let Some(ancestor) = parent {
                    if !visited.insert(ancestor.clone()) {
                        debug!(class = %id, through = %ancestor, "cyclic extends chain");
                        break;
                    }
                    match classes.get_mut(&ancestor) {
                        Some(record) => {
                            record.descendants.push(id.clone());
                            parent = record.def.extends.clone();
                        }
                        None => break,
                    }
                }
            }
        }
    }

    /// Record a class document arriving through the transaction stream.
    pub fn record_class_doc(&self, doc: &Doc) {
        if doc.class == CLASS_CLASS {
            self.record_class(ClassDef::from_doc(doc));
        }
    }

    #[must_use]
    pub fn has_class(&self, class: &str) -> bool {
        self.classes.read().contains_key(class)
    }

    /// Ordered ancestry from the class itself up to its root.
    pub fn ancestors(&self, class: &str) -> Result<Vec<String>> {
        if let Some(cached) = self
            .classes
            .read()
            .get(class)
            .and_then(|r| r.ancestors.clone())
        {
            return Ok(cached);
        }

        let mut classes = self.classes.write();
        let mut chain: Vec<String> = Vec::new();
        let mut cursor = Some(class.to_string());
        while let Some(id) = cursor {
            if chain.contains(&id) {
                return Err(EngineError::ClassCycle {
                    class: class.to_string(),
                });
            }
            let record = classes.get(&id).ok_or(EngineError::ClassNotFound {
                class: id.clone(),
            })?;
            chain.push(id);
            cursor = record.def.extends.clone();
        }
        if let Some(record) = classes.get_mut(class) {
            record.ancestors = Some(chain.clone());
        }
        Ok(chain)
    }

    /// The storage domain governing documents of this class.
    ///
    /// Resolved to the nearest ancestor declaring a domain and memoized on
    /// the class record. An undeclared domain is a fatal configuration error.
    pub fn domain(&self, class: &str) -> Result<String> {
        if let Some(cached) = self
            .classes
            .read()
            .get(class)
            .and_then(|r| r.domain.clone())
        {
            return Ok(cached);
        }

        let chain = self.ancestors(class)?;
        let mut classes = self.classes.write();
        for id in &chain {
            let declared = classes.get(id).and_then(|r| r.def.domain.clone());
            if let Some(domain) = declared {
                if let Some(record) = classes.get_mut(class) {
                    record.domain = Some(domain.clone());
                }
                return Ok(domain);
            }
        }
        Err(EngineError::DomainNotFound {
            class: class.to_string(),
        })
    }

    /// Whether `class` is `ancestor` or extends it, directly or transitively.
    #[must_use]
    pub fn is_derived(&self, class: &str, ancestor: &str) -> bool {
        self.ancestors(class)
            .map(|chain| chain.iter().any(|c| c == ancestor))
            .unwrap_or(false)
    }

    /// All classes whose ancestry includes `class` (including itself).
    pub fn descendants(&self, class: &str) -> Result<Vec<String>> {
        self.classes
            .read()
            .get(class)
            .map(|r| r.descendants.clone())
            .ok_or(EngineError::ClassNotFound {
                class: class.to_string(),
            })
    }
}

/// Reserved classes installed at bootstrap.
fn core_classes() -> Vec<ClassDef> {
    let class = |id: &str, extends: Option<&str>, domain: Option<&str>| ClassDef {
        id: id.into(),
        extends: extends.map(str::to_string),
        domain: domain.map(str::to_string),
    };
    vec![
        class(CLASS_DOC, None, None),
        class(CLASS_CLASS, Some(CLASS_DOC), Some(DOMAIN_MODEL)),
        class(CLASS_TX, Some(CLASS_DOC), Some(DOMAIN_TX)),
        class(CLASS_DERIVED_DATA, Some(CLASS_DOC), None),
        class(
            CLASS_DERIVED_DATA_DESCRIPTOR,
            Some(CLASS_DOC),
            Some(DOMAIN_MODEL),
        ),
        class(CLASS_SHORT_REF, Some(CLASS_DOC), Some(DOMAIN_SHORT_REF)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_hierarchy() -> Hierarchy {
        let h = Hierarchy::with_core_classes();
        h.record_class(ClassDef {
            id: "task.class.Task".into(),
            extends: Some(CLASS_DOC.into()),
            domain: Some("task".into()),
        });
        h.record_class(ClassDef {
            id: "task.class.Issue".into(),
            extends: Some("task.class.Task".into()),
            domain: None,
        });
        h.record_class(ClassDef {
            id: "task.class.Defect".into(),
            extends: Some("task.class.Issue".into()),
            domain: None,
        });
        h
    }

    #[test]
    fn test_ancestors_ordered_class_to_root() {
        let h = task_hierarchy();
        let chain = h.ancestors("task.class.Defect").unwrap();
        assert_eq!(
            chain,
            vec![
                "task.class.Defect".to_string(),
                "task.class.Issue".to_string(),
                "task.class.Task".to_string(),
                CLASS_DOC.to_string(),
            ]
        );
    }

    #[test]
    fn test_domain_inherited_from_nearest_ancestor() {
        let h = task_hierarchy();
        assert_eq!(h.domain("task.class.Task").unwrap(), "task");
        assert_eq!(h.domain("task.class.Defect").unwrap(), "task");
        // Second call hits the memoized value.
        assert_eq!(h.domain("task.class.Defect").unwrap(), "task");
    }

    #[test]
    fn test_domain_not_found_is_error() {
        let h = Hierarchy::with_core_classes();
        h.record_class(ClassDef {
            id: "orphan.class.Thing".into(),
            extends: Some(CLASS_DOC.into()),
            domain: None,
        });
        let err = h.domain("orphan.class.Thing").unwrap_err();
        assert!(matches!(err, EngineError::DomainNotFound { .. }));
    }

    #[test]
    fn test_unknown_class_is_error() {
        let h = Hierarchy::with_core_classes();
        assert!(matches!(
            h.ancestors("nope.class.Nope").unwrap_err(),
            EngineError::ClassNotFound { .. }
        ));
    }

    #[test]
    fn test_is_derived() {
        let h = task_hierarchy();
        assert!(h.is_derived("task.class.Defect", "task.class.Task"));
        assert!(h.is_derived("task.class.Defect", CLASS_DOC));
        assert!(h.is_derived("task.class.Task", "task.class.Task"));
        assert!(!h.is_derived("task.class.Task", "task.class.Defect"));
        assert!(!h.is_derived("missing", "task.class.Task"));
    }

    #[test]
    fn test_descendants_maintained_incrementally() {
        let h = task_hierarchy();
        let descendants = h.descendants("task.class.Task").unwrap();
        assert_eq!(
            descendants,
            vec![
                "task.class.Task".to_string(),
                "task.class.Issue".to_string(),
                "task.class.Defect".to_string(),
            ]
        );
    }

    #[test]
    fn test_reregistration_replaces_but_keeps_descendants() {
        let h = task_hierarchy();
        h.record_class(ClassDef {
            id: "task.class.Task".into(),
            extends: Some(CLASS_DOC.into()),
            domain: Some("renamed".into()),
        });
        // Descendant links survive re-registration.
        let descendants = h.descendants("task.class.Task").unwrap();
        assert!(descendants.contains(&"task.class.Issue".to_string()));
        // And the memoized domain was recomputed.
        assert_eq!(h.domain("task.class.Defect").unwrap(), "renamed");
    }

    #[test]
    fn test_cyclic_extends_chain_is_fatal_not_a_hang() {
        let h = Hierarchy::with_core_classes();
        // Two class documents arriving over the wire can close a loop;
        // registration must terminate and lookups must report it.
        h.record_class(ClassDef {
            id: "bad.class.A".into(),
            extends: Some("bad.class.B".into()),
            domain: None,
        });
        h.record_class(ClassDef {
            id: "bad.class.B".into(),
            extends: Some("bad.class.A".into()),
            domain: None,
        });
        for class in ["bad.class.A", "bad.class.B"] {
            assert!(matches!(
                h.ancestors(class).unwrap_err(),
                EngineError::ClassCycle { .. }
            ));
            assert!(matches!(
                h.domain(class).unwrap_err(),
                EngineError::ClassCycle { .. }
            ));
        }
    }

    #[test]
    fn test_self_extends_is_fatal_not_a_hang() {
        let h = Hierarchy::with_core_classes();
        h.record_class(ClassDef {
            id: "bad.class.Selfie".into(),
            extends: Some("bad.class.Selfie".into()),
            domain: None,
        });
        assert!(matches!(
            h.ancestors("bad.class.Selfie").unwrap_err(),
            EngineError::ClassCycle { .. }
        ));
    }

    #[test]
    fn test_reregistration_closing_a_cycle_is_fatal() {
        let h = task_hierarchy();
        // Re-point the base class at its own descendant.
        h.record_class(ClassDef {
            id: "task.class.Task".into(),
            extends: Some("task.class.Issue".into()),
            domain: Some("task".into()),
        });
        assert!(matches!(
            h.ancestors("task.class.Defect").unwrap_err(),
            EngineError::ClassCycle { .. }
        ));
    }

    #[test]
    fn test_domain_equals_ancestor_domain_when_undeclared() {
        let h = task_hierarchy();
        for class in ["task.class.Issue", "task.class.Defect"] {
            assert_eq!(h.domain(class).unwrap(), h.domain("task.class.Task").unwrap());
        }
    }

    #[test]
    fn test_class_def_doc_round_trip() {
        let def = ClassDef {
            id: "task.class.Task".into(),
            extends: Some(CLASS_DOC.into()),
            domain: Some("task".into()),
        };
        let doc = Doc::new(
            def.id.clone(),
            CLASS_CLASS.into(),
            SPACE_MODEL.into(),
            "system".into(),
            def.to_attributes(),
        );
        assert_eq!(ClassDef::from_doc(&doc), def);
    }
}
