//! Derived data descriptors.
//!
//! A descriptor is itself a document (class
//! [`CLASS_DERIVED_DATA_DESCRIPTOR`](crate::hierarchy::CLASS_DERIVED_DATA_DESCRIPTOR))
//! configuring one materialization: which source class it watches, what
//! target class it produces, and how fields map across.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::document::Doc;
use crate::error::{EngineError, Result};
use crate::query::QueryMap;

/// Derived document attribute: originating descriptor id.
pub const ATTR_DESCRIPTOR_ID: &str = "descriptorId";
/// Derived document attribute: source document id.
pub const ATTR_SOURCE_DOC_ID: &str = "sourceDocId";
/// Derived document attribute: source document class.
pub const ATTR_SOURCE_CLASS: &str = "sourceClass";
/// Embedded collection item attribute: source document id of the push.
pub const ATTR_ITEM_ID: &str = "_id";

/// Regex applied to a source field, optionally fanning out into multiple
/// derived documents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatternRule {
    /// Pattern run as a global regular expression against the source string.
    pub pattern: String,
    /// Capture group index to extract; whole match when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<usize>,
    /// Each match after the first starts a brand-new result document.
    #[serde(default)]
    pub multi_doc: bool,
}

/// One field mapping from source to target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MappingRule {
    pub source_field: String,
    pub target_field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<PatternRule>,
}

/// Back-reference rule: pushes an embedded summary of the source document
/// into an array field of a referenced parent document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CollectionRule {
    /// Field on the source document holding the parent reference.
    pub source_field: String,
    /// Array field on the parent that receives the summary.
    pub target_field: String,
    /// Mapping rules building the embedded summary (no fan-out).
    #[serde(default)]
    pub rules: Vec<MappingRule>,
}

/// Stored attribute shape of a descriptor document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct DescriptorAttributes {
    source_class: String,
    target_class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    query: Option<QueryMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    init_value: Option<Map<String, Value>>,
    #[serde(default)]
    rules: Vec<MappingRule>,
    #[serde(default)]
    collections: Vec<CollectionRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mapper: Option<String>,
}

/// A parsed, ready-to-evaluate descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    pub id: String,
    pub space: String,
    pub source_class: String,
    pub target_class: String,
    /// Restricts which source documents are eligible.
    pub query: Option<QueryMap>,
    /// Template merged into every produced document before rule output.
    pub init_value: Option<Map<String, Value>>,
    pub rules: Vec<MappingRule>,
    pub collections: Vec<CollectionRule>,
    /// Opaque key into the mapper registry; when set, rules are skipped.
    pub mapper: Option<String>,
}

impl Descriptor {
    /// Parse a descriptor from its stored document.
    pub fn from_doc(doc: &Doc) -> Result<Self> {
        let attrs: DescriptorAttributes =
            serde_json::from_value(Value::Object(doc.attributes.clone())).map_err(|err| {
                EngineError::InvalidDescriptor {
                    id: doc.id.clone(),
                    reason: err.to_string(),
                }
            })?;
        if attrs.source_class.is_empty() || attrs.target_class.is_empty() {
            return Err(EngineError::InvalidDescriptor {
                id: doc.id.clone(),
                reason: "sourceClass and targetClass are required".into(),
            });
        }
        Ok(Self {
            id: doc.id.clone(),
            space: doc.space.clone(),
            source_class: attrs.source_class,
            target_class: attrs.target_class,
            query: attrs.query,
            init_value: attrs.init_value,
            rules: attrs.rules,
            collections: attrs.collections,
            mapper: attrs.mapper,
        })
    }

    /// Attribute bag for storing this descriptor as a document.
    #[must_use]
    pub fn to_attributes(&self) -> Value {
        serde_json::to_value(DescriptorAttributes {
            source_class: self.source_class.clone(),
            target_class: self.target_class.clone(),
            query: self.query.clone(),
            init_value: self.init_value.clone(),
            rules: self.rules.clone(),
            collections: self.collections.clone(),
            mapper: self.mapper.clone(),
        })
        .unwrap_or(Value::Null)
    }

    /// Query selecting this descriptor's derived documents for one source.
    #[must_use]
    pub fn derived_query(&self, source_id: &str, source_class: &str) -> QueryMap {
        let mut query = QueryMap::new();
        query.insert(ATTR_DESCRIPTOR_ID.into(), Value::String(self.id.clone()));
        query.insert(ATTR_SOURCE_DOC_ID.into(), Value::String(source_id.into()));
        query.insert(ATTR_SOURCE_CLASS.into(), Value::String(source_class.into()));
        query
    }
}

/// Convenience builder used by tests, demos and bootstrap code.
#[derive(Debug, Default)]
pub struct DescriptorBuilder {
    source_class: String,
    target_class: String,
    query: Option<QueryMap>,
    init_value: Option<Map<String, Value>>,
    rules: Vec<MappingRule>,
    collections: Vec<CollectionRule>,
    mapper: Option<String>,
}

impl DescriptorBuilder {
    #[must_use]
    pub fn new(source_class: &str, target_class: &str) -> Self {
        Self {
            source_class: source_class.into(),
            target_class: target_class.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn rule(mut self, source_field: &str, target_field: &str) -> Self {
        self.rules.push(MappingRule {
            source_field: source_field.into(),
            target_field: target_field.into(),
            pattern: None,
        });
        self
    }

    #[must_use]
    pub fn pattern_rule(
        mut self,
        source_field: &str,
        target_field: &str,
        pattern: &str,
        group: Option<usize>,
        multi_doc: bool,
    ) -> Self {
        self.rules.push(MappingRule {
            source_field: source_field.into(),
            target_field: target_field.into(),
            pattern: Some(PatternRule {
                pattern: pattern.into(),
                group,
                multi_doc,
            }),
        });
        self
    }

    #[must_use]
    pub fn collection(mut self, rule: CollectionRule) -> Self {
        self.collections.push(rule);
        self
    }

    #[must_use]
    pub fn query(mut self, query: QueryMap) -> Self {
        self.query = Some(query);
        self
    }

    #[must_use]
    pub fn init_value(mut self, init: Map<String, Value>) -> Self {
        self.init_value = Some(init);
        self
    }

    #[must_use]
    pub fn mapper(mut self, key: &str) -> Self {
        self.mapper = Some(key.into());
        self
    }

    /// The attribute bag for a create-descriptor transaction.
    #[must_use]
    pub fn build_attributes(self) -> Value {
        Descriptor {
            id: String::new(),
            space: String::new(),
            source_class: self.source_class,
            target_class: self.target_class,
            query: self.query,
            init_value: self.init_value,
            rules: self.rules,
            collections: self.collections,
            mapper: self.mapper,
        }
        .to_attributes()
    }
}
