//! In-memory stores: the model document index and the append-only log.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::document::Doc;
use crate::error::{EngineError, Result};
use crate::hierarchy::{Hierarchy, DOMAIN_MODEL};
use crate::query::{find_query, sort_docs, QueryMap};
use crate::storage::traits::{FindOptions, Storage};
use crate::tx::{
    Tx, TxAddCollection, TxCreateDoc, TxProcessor, TxRemoveDoc, TxUpdateCollection, TxUpdateDoc,
    UpdateOps,
};

/// Collection item field carrying the local id.
pub const ITEM_LOCAL_ID: &str = "_localId";
/// Collection item field carrying the embedded class.
pub const ITEM_CLASS: &str = "_class";

/// In-memory document store.
///
/// Every document is indexed under its own class and **every** ancestor
/// class simultaneously, so `find_all` against a base class transparently
/// returns instances of all subclasses.
pub struct MemDb {
    hierarchy: Arc<Hierarchy>,
    docs: DashMap<String, Doc>,
    /// class id -> ordered document ids (insertion order).
    buckets: DashMap<String, Vec<String>>,
}

impl MemDb {
    #[must_use]
    pub fn new(hierarchy: Arc<Hierarchy>) -> Self {
        Self {
            hierarchy,
            docs: DashMap::new(),
            buckets: DashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Direct id lookup, bypassing the query engine.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Doc> {
        self.docs.get(id).map(|r| r.value().clone())
    }

    fn index(&self, doc: &Doc) -> Result<()> {
        for ancestor in self.hierarchy.ancestors(&doc.class)? {
            self.buckets.entry(ancestor).or_default().push(doc.id.clone());
        }
        Ok(())
    }

    fn unindex(&self, doc: &Doc) -> Result<()> {
        for ancestor in self.hierarchy.ancestors(&doc.class)? {
            if let Some(mut bucket) = self.buckets.get_mut(&ancestor) {
                bucket.retain(|id| id != &doc.id);
            }
        }
        Ok(())
    }

    fn apply_ops(doc: &mut Doc, ops: &UpdateOps) {
        for field in &ops.unset {
            doc.attributes.remove(field);
        }
        for (field, value) in &ops.set {
            doc.attributes.insert(field.clone(), value.clone());
        }
        for (field, value) in &ops.push {
            match doc.attributes.get_mut(field) {
                Some(Value::Array(items)) => items.push(value.clone()),
                _ => {
                    doc.attributes
                        .insert(field.clone(), Value::Array(vec![value.clone()]));
                }
            }
        }
        for (field, value) in &ops.pull {
            if let Some(Value::Array(items)) = doc.attributes.get_mut(field) {
                items.retain(|item| !pull_matches(item, value));
            }
        }
    }
}

/// Exact equality, or object-subset match so items can be pulled by a
/// distinguishing field (e.g. `{"_localId": "x"}`).
fn pull_matches(item: &Value, pattern: &Value) -> bool {
    if item == pattern {
        return true;
    }
    match (item, pattern) {
        (Value::Object(item), Value::Object(pattern)) => pattern
            .iter()
            .all(|(k, v)| item.get(k) == Some(v)),
        _ => false,
    }
}

#[async_trait]
impl TxProcessor for MemDb {
    async fn on_create_doc(&self, tx: &TxCreateDoc) -> Result<()> {
        // Duplicate detection and insertion must be one atomic step: the
        // short-ref allocator relies on exactly one of two racing creates
        // winning. The entry guard holds the id's shard until we decide.
        match self.docs.entry(tx.object_id.clone()) {
            Entry::Occupied(_) => Err(EngineError::DuplicateId {
                id: tx.object_id.clone(),
            }),
            Entry::Vacant(slot) => {
                let doc = tx.to_doc();
                self.index(&doc)?;
                slot.insert(doc);
                Ok(())
            }
        }
    }

    async fn on_update_doc(&self, tx: &TxUpdateDoc) -> Result<()> {
        let mut entry = self
            .docs
            .get_mut(&tx.object_id)
            .ok_or_else(|| EngineError::DocNotFound {
                id: tx.object_id.clone(),
            })?;
        let doc = entry.value_mut();
        Self::apply_ops(doc, &tx.operations);
        doc.modified_by = tx.modified_by.clone();
        doc.modified_on = tx.modified_on;
        Ok(())
    }

    async fn on_remove_doc(&self, tx: &TxRemoveDoc) -> Result<()> {
        let (_, doc) = self
            .docs
            .remove(&tx.object_id)
            .ok_or_else(|| EngineError::DocNotFound {
                id: tx.object_id.clone(),
            })?;
        self.unindex(&doc)?;
        Ok(())
    }

    async fn on_add_collection(&self, tx: &TxAddCollection) -> Result<()> {
        let mut entry = self
            .docs
            .get_mut(&tx.object_id)
            .ok_or_else(|| EngineError::DocNotFound {
                id: tx.object_id.clone(),
            })?;
        let doc = entry.value_mut();

        let mut item = tx.attributes.clone();
        item.insert(ITEM_LOCAL_ID.into(), Value::String(tx.local_id.clone()));
        item.insert(ITEM_CLASS.into(), Value::String(tx.item_class.clone()));

        match doc.attributes.get_mut(&tx.collection) {
            Some(Value::Array(items)) => items.push(Value::Object(item)),
            _ => {
                doc.attributes.insert(
                    tx.collection.clone(),
                    Value::Array(vec![Value::Object(item)]),
                );
            }
        }
        doc.modified_by = tx.modified_by.clone();
        doc.modified_on = tx.modified_on;
        Ok(())
    }

    async fn on_update_collection(&self, tx: &TxUpdateCollection) -> Result<()> {
        let mut entry = self
            .docs
            .get_mut(&tx.object_id)
            .ok_or_else(|| EngineError::DocNotFound {
                id: tx.object_id.clone(),
            })?;
        let doc = entry.value_mut();

        let items = match doc.attributes.get_mut(&tx.collection) {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(EngineError::CollectionItemNotFound {
                    id: tx.object_id.clone(),
                    collection: tx.collection.clone(),
                    local_id: tx.local_id.clone(),
                })
            }
        };
        let item = items
            .iter_mut()
            .filter_map(Value::as_object_mut)
            .find(|item| {
                item.get(ITEM_LOCAL_ID).and_then(Value::as_str) == Some(tx.local_id.as_str())
            })
            .ok_or_else(|| EngineError::CollectionItemNotFound {
                id: tx.object_id.clone(),
                collection: tx.collection.clone(),
                local_id: tx.local_id.clone(),
            })?;
        for (field, value) in &tx.attributes {
            item.insert(field.clone(), value.clone());
        }
        doc.modified_by = tx.modified_by.clone();
        doc.modified_on = tx.modified_on;
        Ok(())
    }
}

#[async_trait]
impl Storage for MemDb {
    async fn find_all(
        &self,
        class: &str,
        query: &QueryMap,
        options: Option<FindOptions>,
    ) -> Result<Vec<Doc>> {
        let ids = self
            .buckets
            .get(class)
            .map(|bucket| bucket.clone())
            .unwrap_or_default();
        let docs: Vec<Doc> = ids
            .iter()
            .filter_map(|id| self.docs.get(id).map(|r| r.value().clone()))
            .collect();
        let mut docs = find_query(query, &docs);
        if let Some(options) = options {
            if !options.sort.is_empty() {
                sort_docs(&mut docs, &options.sort);
            }
            if let Some(limit) = options.limit {
                docs.truncate(limit);
            }
        }
        Ok(docs)
    }

    async fn tx(&self, tx: &Tx) -> Result<()> {
        self.process(tx).await
    }
}

/// Append-only transaction log. Applying any transaction appends it; the
/// log is never edited afterwards.
#[derive(Default)]
pub struct TxLog {
    txes: RwLock<Vec<Tx>>,
}

impl TxLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, tx: Tx) {
        self.txes.write().push(tx);
    }

    #[must_use]
    pub fn all(&self) -> Vec<Tx> {
        self.txes.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.txes.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.txes.read().is_empty()
    }

    /// The slice of the log whose targets live in the model domain,
    /// in commit order. Served to clients during bootstrap.
    #[must_use]
    pub fn model_txes(&self, hierarchy: &Hierarchy) -> Vec<Tx> {
        self.txes
            .read()
            .iter()
            .filter(|tx| {
                hierarchy
                    .domain(tx.object_class())
                    .map(|d| d == DOMAIN_MODEL)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Update transactions whose `$push` on `field` pushed an object whose
    /// `key` attribute equals `value`.
    #[must_use]
    pub fn find_pushes(&self, field: &str, key: &str, value: &str) -> Vec<TxUpdateDoc> {
        self.txes
            .read()
            .iter()
            .filter_map(|tx| match tx {
                Tx::UpdateDoc(update) => {
                    let pushed = update.operations.push.get(field)?;
                    let matches = pushed
                        .as_object()
                        .and_then(|obj| obj.get(key))
                        .and_then(Value::as_str)
                        == Some(value);
                    matches.then(|| update.clone())
                }
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl TxProcessor for TxLog {
    async fn on_create_doc(&self, tx: &TxCreateDoc) -> Result<()> {
        self.append(Tx::CreateDoc(tx.clone()));
        Ok(())
    }
    async fn on_update_doc(&self, tx: &TxUpdateDoc) -> Result<()> {
        self.append(Tx::UpdateDoc(tx.clone()));
        Ok(())
    }
    async fn on_remove_doc(&self, tx: &TxRemoveDoc) -> Result<()> {
        self.append(Tx::RemoveDoc(tx.clone()));
        Ok(())
    }
    async fn on_add_collection(&self, tx: &TxAddCollection) -> Result<()> {
        self.append(Tx::AddCollection(tx.clone()));
        Ok(())
    }
    async fn on_update_collection(&self, tx: &TxUpdateCollection) -> Result<()> {
        self.append(Tx::UpdateCollection(tx.clone()));
        Ok(())
    }
}
