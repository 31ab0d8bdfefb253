//! Document value record.
//!
//! A [`Doc`] is the core data unit of the store: an immutable value record
//! owned by exactly one class and one space. Mutation is expressed only
//! through transactions ([`crate::tx::Tx`]); stores produce new `Doc` values
//! when applying them.
//!
//! # Example
//!
//! ```
//! use docstore_engine::Doc;
//! use serde_json::json;
//!
//! let doc = Doc::new(
//!     "task-1".into(),
//!     "task.class.Task".into(),
//!     "space-1".into(),
//!     "user-1".into(),
//!     json!({"title": "Fix the roof", "shortId": "TASK-1"}),
//! );
//!
//! assert_eq!(doc.class, "task.class.Task");
//! assert_eq!(doc.attributes["title"], "Fix the roof");
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Epoch millis, the way all timestamps travel through the system.
#[must_use]
pub fn timestamp_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Generate a fresh document identifier.
#[must_use]
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// An immutable document record.
///
/// Identity (`id`) is unique within the class lineage. The attribute bag is
/// schemaless JSON; typed views (descriptors, class definitions) are parsed
/// from it on demand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Doc {
    /// Document identifier, unique within its class lineage.
    pub id: String,
    /// Owning class id.
    pub class: String,
    /// Owning space (logical partition).
    pub space: String,
    /// Last modifier account.
    pub modified_by: String,
    /// Last modification time (epoch millis).
    pub modified_on: i64,
    /// Schemaless attribute bag.
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl Doc {
    /// Create a document stamped with the current time.
    #[must_use]
    pub fn new(
        id: String,
        class: String,
        space: String,
        modified_by: String,
        attributes: Value,
    ) -> Self {
        let attributes = match attributes {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            id,
            class,
            space,
            modified_by,
            modified_on: timestamp_now(),
            attributes,
        }
    }

    /// Read a top-level attribute, or a metadata field by its wire name
    /// (`id`, `class`, `space`, `modifiedBy`, `modifiedOn`).
    #[must_use]
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::String(self.id.clone())),
            "class" => Some(Value::String(self.class.clone())),
            "space" => Some(Value::String(self.space.clone())),
            "modifiedBy" => Some(Value::String(self.modified_by.clone())),
            "modifiedOn" => Some(Value::Number(self.modified_on.into())),
            _ => self.attributes.get(name).cloned(),
        }
    }

    /// String view of an attribute, if present and a string.
    #[must_use]
    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Value::as_str)
    }
}
