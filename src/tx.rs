// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transaction model.
//!
//! A [`Tx`] is an append-only log entry: once committed it is never edited
//! or deleted, corrections are new transactions. The document store and
//! every other consumer is a projection of the log and can be rebuilt by
//! replay.
//!
//! [`Tx`] is a closed tagged union so the dispatcher gets exhaustiveness
//! checking; on the wire it serializes as `{"class": "CreateDoc", ...}` per
//! the transaction envelope.
//!
//! Stores plug into the stream through [`TxProcessor`]: the provided
//! [`TxProcessor::process`] routes each variant to a type-specific handler,
//! and a concrete store overrides only the handlers it cares about.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::document::{generate_id, timestamp_now, Doc};
use crate::error::Result;

/// A transaction, tagged by kind on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "class")]
pub enum Tx {
    CreateDoc(TxCreateDoc),
    UpdateDoc(TxUpdateDoc),
    RemoveDoc(TxRemoveDoc),
    AddCollection(TxAddCollection),
    UpdateCollection(TxUpdateCollection),
}

/// Create a new document from an attribute bag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TxCreateDoc {
    pub id: String,
    pub object_id: String,
    pub object_class: String,
    pub object_space: String,
    pub modified_by: String,
    pub modified_on: i64,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

/// Partial attribute update and/or `$push`/`$pull` collection operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TxUpdateDoc {
    pub id: String,
    pub object_id: String,
    pub object_class: String,
    pub object_space: String,
    pub modified_by: String,
    pub modified_on: i64,
    pub operations: UpdateOps,
}

/// Remove a document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TxRemoveDoc {
    pub id: String,
    pub object_id: String,
    pub object_class: String,
    pub object_space: String,
    pub modified_by: String,
    pub modified_on: i64,
}

/// Add an embedded item to a named collection field of the target document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TxAddCollection {
    pub id: String,
    pub object_id: String,
    pub object_class: String,
    pub object_space: String,
    pub modified_by: String,
    pub modified_on: i64,
    /// Array field on the target document.
    pub collection: String,
    /// Class of the embedded item.
    pub item_class: String,
    /// Item identifier, local to the collection.
    pub local_id: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

/// Update an embedded item inside a named collection field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TxUpdateCollection {
    pub id: String,
    pub object_id: String,
    pub object_class: String,
    pub object_space: String,
    pub modified_by: String,
    pub modified_on: i64,
    pub collection: String,
    pub item_class: String,
    pub local_id: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

/// Update operations: plain field sets plus array `$push` / `$pull`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UpdateOps {
    /// Fields to set (shallow merge into the attribute bag).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub set: Map<String, Value>,
    /// Values to append to array fields.
    #[serde(default, skip_serializing_if = "Map::is_empty", rename = "$push")]
    pub push: Map<String, Value>,
    /// Values to remove from array fields (exact or object-subset match).
    #[serde(default, skip_serializing_if = "Map::is_empty", rename = "$pull")]
    pub pull: Map<String, Value>,
    /// Fields to delete from the attribute bag.
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "$unset")]
    pub unset: Vec<String>,
}

impl UpdateOps {
    /// Operations that only set plain fields.
    #[must_use]
    pub fn set_fields(set: Map<String, Value>) -> Self {
        Self { set, ..Self::default() }
    }

    /// Operations that make `current` into exactly `target`: every target
    /// field is set, every current field absent from the target is unset.
    #[must_use]
    pub fn replace_fields(current: &Map<String, Value>, target: Map<String, Value>) -> Self {
        let unset = current
            .keys()
            .filter(|key| !target.contains_key(*key))
            .cloned()
            .collect();
        Self { set: target, unset, ..Self::default() }
    }

    /// Operations that push one value onto one array field.
    #[must_use]
    pub fn push_one(field: &str, value: Value) -> Self {
        let mut push = Map::new();
        push.insert(field.to_string(), value);
        Self { push, ..Self::default() }
    }

    /// Operations that pull one value from one array field.
    #[must_use]
    pub fn pull_one(field: &str, value: Value) -> Self {
        let mut pull = Map::new();
        pull.insert(field.to_string(), value);
        Self { pull, ..Self::default() }
    }
}

impl Tx {
    /// Transaction identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Tx::CreateDoc(tx) => &tx.id,
            Tx::UpdateDoc(tx) => &tx.id,
            Tx::RemoveDoc(tx) => &tx.id,
            Tx::AddCollection(tx) => &tx.id,
            Tx::UpdateCollection(tx) => &tx.id,
        }
    }

    /// Target document identifier.
    #[must_use]
    pub fn object_id(&self) -> &str {
        match self {
            Tx::CreateDoc(tx) => &tx.object_id,
            Tx::UpdateDoc(tx) => &tx.object_id,
            Tx::RemoveDoc(tx) => &tx.object_id,
            Tx::AddCollection(tx) => &tx.object_id,
            Tx::UpdateCollection(tx) => &tx.object_id,
        }
    }

    /// Target document class.
    #[must_use]
    pub fn object_class(&self) -> &str {
        match self {
            Tx::CreateDoc(tx) => &tx.object_class,
            Tx::UpdateDoc(tx) => &tx.object_class,
            Tx::RemoveDoc(tx) => &tx.object_class,
            Tx::AddCollection(tx) => &tx.object_class,
            Tx::UpdateCollection(tx) => &tx.object_class,
        }
    }

    /// Target space.
    #[must_use]
    pub fn object_space(&self) -> &str {
        match self {
            Tx::CreateDoc(tx) => &tx.object_space,
            Tx::UpdateDoc(tx) => &tx.object_space,
            Tx::RemoveDoc(tx) => &tx.object_space,
            Tx::AddCollection(tx) => &tx.object_space,
            Tx::UpdateCollection(tx) => &tx.object_space,
        }
    }

    #[must_use]
    pub fn modified_by(&self) -> &str {
        match self {
            Tx::CreateDoc(tx) => &tx.modified_by,
            Tx::UpdateDoc(tx) => &tx.modified_by,
            Tx::RemoveDoc(tx) => &tx.modified_by,
            Tx::AddCollection(tx) => &tx.modified_by,
            Tx::UpdateCollection(tx) => &tx.modified_by,
        }
    }

    #[must_use]
    pub fn modified_on(&self) -> i64 {
        match self {
            Tx::CreateDoc(tx) => tx.modified_on,
            Tx::UpdateDoc(tx) => tx.modified_on,
            Tx::RemoveDoc(tx) => tx.modified_on,
            Tx::AddCollection(tx) => tx.modified_on,
            Tx::UpdateCollection(tx) => tx.modified_on,
        }
    }

    /// Wire name of the transaction kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Tx::CreateDoc(_) => "CreateDoc",
            Tx::UpdateDoc(_) => "UpdateDoc",
            Tx::RemoveDoc(_) => "RemoveDoc",
            Tx::AddCollection(_) => "AddCollection",
            Tx::UpdateCollection(_) => "UpdateCollection",
        }
    }

    // --- Builders ---

    /// Create-document transaction with a fresh tx id and current timestamp.
    #[must_use]
    pub fn create(
        object_id: &str,
        object_class: &str,
        object_space: &str,
        modified_by: &str,
        attributes: Value,
    ) -> Tx {
        let attributes = match attributes {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Tx::CreateDoc(TxCreateDoc {
            id: generate_id(),
            object_id: object_id.to_string(),
            object_class: object_class.to_string(),
            object_space: object_space.to_string(),
            modified_by: modified_by.to_string(),
            modified_on: timestamp_now(),
            attributes,
        })
    }

    /// Update-document transaction with a fresh tx id and current timestamp.
    #[must_use]
    pub fn update(
        object_id: &str,
        object_class: &str,
        object_space: &str,
        modified_by: &str,
        operations: UpdateOps,
    ) -> Tx {
        Tx::UpdateDoc(TxUpdateDoc {
            id: generate_id(),
            object_id: object_id.to_string(),
            object_class: object_class.to_string(),
            object_space: object_space.to_string(),
            modified_by: modified_by.to_string(),
            modified_on: timestamp_now(),
            operations,
        })
    }

    /// Remove-document transaction with a fresh tx id and current timestamp.
    #[must_use]
    pub fn remove(
        object_id: &str,
        object_class: &str,
        object_space: &str,
        modified_by: &str,
    ) -> Tx {
        Tx::RemoveDoc(TxRemoveDoc {
            id: generate_id(),
            object_id: object_id.to_string(),
            object_class: object_class.to_string(),
            object_space: object_space.to_string(),
            modified_by: modified_by.to_string(),
            modified_on: timestamp_now(),
        })
    }
}

impl TxCreateDoc {
    /// Materialize the document this transaction creates.
    #[must_use]
    pub fn to_doc(&self) -> Doc {
        Doc {
            id: self.object_id.clone(),
            class: self.object_class.clone(),
            space: self.object_space.clone(),
            modified_by: self.modified_by.clone(),
            modified_on: self.modified_on,
            attributes: self.attributes.clone(),
        }
    }

    /// Synthesize a create transaction from a document's stored state.
    ///
    /// Used by the rebuild path to re-run descriptor evaluation over the
    /// whole source collection.
    #[must_use]
    pub fn from_doc(doc: &Doc) -> Self {
        Self {
            id: generate_id(),
            object_id: doc.id.clone(),
            object_class: doc.class.clone(),
            object_space: doc.space.clone(),
            modified_by: doc.modified_by.clone(),
            modified_on: doc.modified_on,
            attributes: doc.attributes.clone(),
        }
    }
}

/// Generic transaction dispatcher.
///
/// The provided [`process`](TxProcessor::process) matches the closed [`Tx`]
/// union and routes each variant to a handler; every handler defaults to a
/// no-op so a store implements only the ones it cares about (an append-only
/// log overrides none of them, the model store overrides all five).
#[async_trait]
pub trait TxProcessor: Send + Sync {
    async fn process(&self, tx: &Tx) -> Result<()> {
        match tx {
            Tx::CreateDoc(tx) => self.on_create_doc(tx).await,
            Tx::UpdateDoc(tx) => self.on_update_doc(tx).await,
            Tx::RemoveDoc(tx) => self.on_remove_doc(tx).await,
            Tx::AddCollection(tx) => self.on_add_collection(tx).await,
            Tx::UpdateCollection(tx) => self.on_update_collection(tx).await,
        }
    }

    async fn on_create_doc(&self, _tx: &TxCreateDoc) -> Result<()> {
        Ok(())
    }
    async fn on_update_doc(&self, _tx: &TxUpdateDoc) -> Result<()> {
        Ok(())
    }
    async fn on_remove_doc(&self, _tx: &TxRemoveDoc) -> Result<()> {
        Ok(())
    }
    async fn on_add_collection(&self, _tx: &TxAddCollection) -> Result<()> {
        Ok(())
    }
    async fn on_update_collection(&self, _tx: &TxUpdateCollection) -> Result<()> {
        Ok(())
    }
}
