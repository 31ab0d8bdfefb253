// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Derived data engine.
//!
//! Watches the transaction stream and keeps secondary documents consistent
//! with their sources under descriptor-defined rules or external mappers.
//! For every incoming transaction the engine resolves the applicable
//! descriptors through class ancestry, computes the new derived set, and
//! reconciles it against what storage currently holds; descriptor changes
//! trigger a full rebuild of exactly that descriptor's output.
//!
//! Derived writes are best-effort with respect to the triggering
//! transaction: the source write has already succeeded, so a failing
//! derived side-effect is logged and dropped rather than propagated.

pub mod descriptor;
pub mod mapper;
pub mod reconcile;
pub mod rules;

pub use descriptor::{
    CollectionRule, Descriptor, DescriptorBuilder, MappingRule, PatternRule, ATTR_DESCRIPTOR_ID,
    ATTR_ITEM_ID, ATTR_SOURCE_CLASS, ATTR_SOURCE_DOC_ID,
};
pub use mapper::{DocMapper, MapperContext, MapperRegistry};
pub use reconcile::{reconcile, Reconciliation};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::document::{generate_id, Doc};
use crate::error::Result;
use crate::hierarchy::{Hierarchy, CLASS_DERIVED_DATA_DESCRIPTOR};
use crate::query::{self, QueryMap};
use crate::storage::memory::TxLog;
use crate::storage::traits::Storage;
use crate::tx::{Tx, TxCreateDoc, UpdateOps};

/// Source of past back-reference pushes, consulted when a source document
/// is removed and its data is no longer available for direct comparison.
///
/// The log-scanning implementation preserves the documented search-based
/// behavior; an index kept at push time can replace it behind this trait.
pub trait BackrefSource: Send + Sync {
    /// Update transactions whose `$push` on `field` carried an embedded
    /// summary originating from `source_id`.
    fn find_pushes(&self, field: &str, source_id: &str) -> Vec<crate::tx::TxUpdateDoc>;
}

impl BackrefSource for TxLog {
    fn find_pushes(&self, field: &str, source_id: &str) -> Vec<crate::tx::TxUpdateDoc> {
        TxLog::find_pushes(self, field, ATTR_ITEM_ID, source_id)
    }
}

/// The derived data engine.
pub struct DerivedDataEngine {
    hierarchy: Arc<Hierarchy>,
    storage: Arc<dyn Storage>,
    backrefs: Arc<dyn BackrefSource>,
    mappers: Arc<MapperRegistry>,
    /// source class -> descriptors registered against it.
    descriptors: RwLock<HashMap<String, Vec<Descriptor>>>,
}

impl DerivedDataEngine {
    /// Build the engine, loading every descriptor currently in storage.
    pub async fn new(
        hierarchy: Arc<Hierarchy>,
        storage: Arc<dyn Storage>,
        backrefs: Arc<dyn BackrefSource>,
        mappers: Arc<MapperRegistry>,
    ) -> Result<Self> {
        let engine = Self {
            hierarchy,
            storage,
            backrefs,
            mappers,
            descriptors: RwLock::new(HashMap::new()),
        };
        let stored = engine
            .storage
            .find_all(CLASS_DERIVED_DATA_DESCRIPTOR, &QueryMap::new(), None)
            .await?;
        for doc in &stored {
            match Descriptor::from_doc(doc) {
                Ok(descriptor) => engine.register(descriptor),
                Err(err) => warn!(descriptor = %doc.id, error = %err, "skipping stored descriptor"),
            }
        }
        info!(count = stored.len(), "derived data engine initialized");
        Ok(engine)
    }

    /// Number of registered descriptors.
    #[must_use]
    pub fn descriptor_count(&self) -> usize {
        self.descriptors.read().values().map(Vec::len).sum()
    }

    /// React to one committed transaction.
    ///
    /// Returns the derived transactions that were successfully applied to
    /// storage, in application order, for fan-out to connected clients.
    #[tracing::instrument(skip(self, tx), fields(kind = tx.kind(), object = %tx.object_id()))]
    pub async fn process(&self, tx: &Tx) -> Vec<Tx> {
        let start = std::time::Instant::now();
        let out = if self
            .hierarchy
            .is_derived(tx.object_class(), CLASS_DERIVED_DATA_DESCRIPTOR)
        {
            self.process_descriptor_tx(tx).await
        } else {
            match tx {
                Tx::CreateDoc(create) => self.on_source_created(tx, create).await,
                Tx::UpdateDoc(_) => self.on_source_updated(tx).await,
                Tx::RemoveDoc(_) => self.on_source_removed(tx).await,
                // Embedded collection items carry no descriptors of their own.
                Tx::AddCollection(_) | Tx::UpdateCollection(_) => Vec::new(),
            }
        };
        crate::metrics::record_derived_latency(start.elapsed());
        out
    }

    /// Descriptors applicable to a class: the union over the class and all
    /// of its ancestors.
    fn descriptors_for(&self, class: &str) -> Vec<Descriptor> {
        let Ok(ancestors) = self.hierarchy.ancestors(class) else {
            return Vec::new();
        };
        let registry = self.descriptors.read();
        ancestors
            .iter()
            .filter_map(|ancestor| registry.get(ancestor))
            .flatten()
            .cloned()
            .collect()
    }

    fn register(&self, descriptor: Descriptor) {
        let mut registry = self.descriptors.write();
        let bucket = registry.entry(descriptor.source_class.clone()).or_default();
        match bucket.iter_mut().find(|d| d.id == descriptor.id) {
            Some(slot) => *slot = descriptor,
            None => bucket.push(descriptor),
        }
    }

    fn unregister(&self, descriptor_id: &str) -> Option<Descriptor> {
        let mut registry = self.descriptors.write();
        for bucket in registry.values_mut() {
            if let Some(position) = bucket.iter().position(|d| d.id == descriptor_id) {
                return Some(bucket.remove(position));
            }
        }
        None
    }

    // --- Source document dispatch ---

    async fn on_source_created(&self, tx: &Tx, create: &TxCreateDoc) -> Vec<Tx> {
        let doc = create.to_doc();
        let mut out = Vec::new();
        for descriptor in self.descriptors_for(&doc.class) {
            out.extend(self.materialize(&descriptor, tx, Some(&doc)).await);
            if eligible(&descriptor, &doc) {
                out.extend(self.push_backrefs(&descriptor, &doc).await);
            }
        }
        out
    }

    async fn on_source_updated(&self, tx: &Tx) -> Vec<Tx> {
        // Re-read the authoritative post-update state; the transaction alone
        // only carries the delta.
        let current = match self.read_current(tx.object_class(), tx.object_id()).await {
            Some(doc) => doc,
            None => {
                warn!(object = %tx.object_id(), "updated document not found, skipping derivation");
                return Vec::new();
            }
        };
        let mut out = Vec::new();
        for descriptor in self.descriptors_for(tx.object_class()) {
            out.extend(self.materialize(&descriptor, tx, Some(&current)).await);
        }
        out
    }

    async fn on_source_removed(&self, tx: &Tx) -> Vec<Tx> {
        let mut out = Vec::new();
        for descriptor in self.descriptors_for(tx.object_class()) {
            out.extend(self.materialize(&descriptor, tx, None).await);
            out.extend(self.pull_backrefs(&descriptor, tx).await);
        }
        out
    }

    /// Compute the new derived set for one descriptor and reconcile it
    /// against storage. `doc` is `None` on removal (empty new set).
    async fn materialize(&self, descriptor: &Descriptor, tx: &Tx, doc: Option<&Doc>) -> Vec<Tx> {
        let new_docs = match doc {
            Some(doc) if eligible(descriptor, doc) => self.compute(descriptor, tx, doc).await,
            _ => Vec::new(),
        };
        let old_docs = match self
            .storage
            .find_all(
                &descriptor.target_class,
                &descriptor.derived_query(tx.object_id(), tx.object_class()),
                None,
            )
            .await
        {
            Ok(docs) => docs,
            Err(err) => {
                warn!(descriptor = %descriptor.id, error = %err, "failed to load derived set");
                return Vec::new();
            }
        };
        let diff = reconcile(&old_docs, new_docs);
        self.apply_reconciliation(descriptor, diff).await
    }

    /// Mapper output when the descriptor names one, rule output otherwise,
    /// seeded into full documents.
    async fn compute(&self, descriptor: &Descriptor, tx: &Tx, doc: &Doc) -> Vec<Doc> {
        let bags = match &descriptor.mapper {
            Some(key) => match self.mappers.get(key) {
                Some(mapper) => {
                    let ctx = MapperContext {
                        descriptor,
                        hierarchy: self.hierarchy.as_ref(),
                        storage: self.storage.as_ref(),
                    };
                    match mapper.map(tx, ctx).await {
                        Ok(bags) => bags,
                        Err(err) => {
                            warn!(descriptor = %descriptor.id, mapper = %key, error = %err, "mapper failed");
                            return Vec::new();
                        }
                    }
                }
                None => {
                    warn!(descriptor = %descriptor.id, mapper = %key, "mapper not registered");
                    return Vec::new();
                }
            },
            None => rules::eval_rules(descriptor, doc),
        };

        bags.into_iter()
            .map(|bag| {
                let mut attributes = descriptor.init_value.clone().unwrap_or_default();
                attributes.extend(bag);
                attributes.insert(ATTR_DESCRIPTOR_ID.into(), Value::String(descriptor.id.clone()));
                attributes.insert(ATTR_SOURCE_DOC_ID.into(), Value::String(doc.id.clone()));
                attributes.insert(ATTR_SOURCE_CLASS.into(), Value::String(doc.class.clone()));
                Doc {
                    id: generate_id(),
                    class: descriptor.target_class.clone(),
                    space: doc.space.clone(),
                    modified_by: doc.modified_by.clone(),
                    modified_on: doc.modified_on,
                    attributes,
                }
            })
            .collect()
    }

    /// Turn a reconciliation into storage writes. Failures are logged and
    /// the corresponding transaction dropped from the fan-out.
    async fn apply_reconciliation(&self, descriptor: &Descriptor, diff: Reconciliation) -> Vec<Tx> {
        if diff.is_noop() {
            debug!(descriptor = %descriptor.id, kept = diff.kept, "derived set unchanged");
            return Vec::new();
        }
        let mut txes = Vec::new();
        for doc in diff.additions {
            crate::metrics::record_derived_write("create");
            txes.push(Tx::CreateDoc(TxCreateDoc::from_doc(&doc)));
        }
        for (old, new) in diff.updates {
            crate::metrics::record_derived_write("update");
            // The update must leave exactly the computed bag behind:
            // fields the old document carries but the new one lacks are
            // unset, otherwise every later recomputation sees stored !=
            // computed and keeps emitting writes.
            txes.push(Tx::update(
                &old.id,
                &old.class,
                &old.space,
                &new.modified_by,
                UpdateOps::replace_fields(&old.attributes, new.attributes),
            ));
        }
        for doc in diff.removals {
            crate::metrics::record_derived_write("remove");
            txes.push(Tx::remove(&doc.id, &doc.class, &doc.space, &doc.modified_by));
        }

        let mut applied = Vec::with_capacity(txes.len());
        for tx in txes {
            match self.storage.tx(&tx).await {
                Ok(()) => applied.push(tx),
                Err(err) => {
                    warn!(descriptor = %descriptor.id, kind = tx.kind(), error = %err, "derived write failed")
                }
            }
        }
        applied
    }

    // --- Collection (back-reference) rules ---

    /// Push an embedded summary of a fresh source document into each parent
    /// it references.
    async fn push_backrefs(&self, descriptor: &Descriptor, doc: &Doc) -> Vec<Tx> {
        let mut out = Vec::new();
        for rule in &descriptor.collections {
            let Some(parent_id) = doc.attr_str(&rule.source_field) else {
                continue;
            };
            let mut summary = rules::eval_summary(&rule.rules, doc);
            // The source id disambiguates the summary so the matching pull
            // retracts exactly this element.
            summary.insert(ATTR_ITEM_ID.into(), Value::String(doc.id.clone()));

            let tx = Tx::update(
                parent_id,
                &descriptor.target_class,
                &doc.space,
                &doc.modified_by,
                UpdateOps::push_one(&rule.target_field, Value::Object(summary)),
            );
            match self.storage.tx(&tx).await {
                Ok(()) => out.push(tx),
                Err(err) => warn!(
                    descriptor = %descriptor.id,
                    parent = %parent_id,
                    error = %err,
                    "collection push failed"
                ),
            }
        }
        out
    }

    /// Retract back-references of a removed source document by locating the
    /// update transactions that performed the original pushes.
    async fn pull_backrefs(&self, descriptor: &Descriptor, tx: &Tx) -> Vec<Tx> {
        let mut out = Vec::new();
        for rule in &descriptor.collections {
            for push in self.backrefs.find_pushes(&rule.target_field, tx.object_id()) {
                let Some(pushed) = push.operations.push.get(&rule.target_field) else {
                    continue;
                };
                let pull = Tx::update(
                    &push.object_id,
                    &push.object_class,
                    &push.object_space,
                    tx.modified_by(),
                    UpdateOps::pull_one(&rule.target_field, pushed.clone()),
                );
                match self.storage.tx(&pull).await {
                    Ok(()) => out.push(pull),
                    Err(err) => warn!(
                        descriptor = %descriptor.id,
                        parent = %push.object_id,
                        error = %err,
                        "collection pull failed"
                    ),
                }
            }
        }
        out
    }

    // --- Descriptor lifecycle ---

    async fn process_descriptor_tx(&self, tx: &Tx) -> Vec<Tx> {
        match tx {
            Tx::CreateDoc(create) => {
                let descriptor = match Descriptor::from_doc(&create.to_doc()) {
                    Ok(descriptor) => descriptor,
                    Err(err) => {
                        warn!(object = %create.object_id, error = %err, "rejecting descriptor");
                        return Vec::new();
                    }
                };
                info!(descriptor = %descriptor.id, source = %descriptor.source_class, "descriptor registered");
                self.register(descriptor.clone());
                self.rebuild(&descriptor, true).await
            }
            Tx::UpdateDoc(update) => {
                let Some(doc) = self
                    .read_current(&update.object_class, &update.object_id)
                    .await
                else {
                    warn!(object = %update.object_id, "updated descriptor not found");
                    return Vec::new();
                };
                let descriptor = match Descriptor::from_doc(&doc) {
                    Ok(descriptor) => descriptor,
                    Err(err) => {
                        warn!(object = %doc.id, error = %err, "rejecting descriptor update");
                        return Vec::new();
                    }
                };
                info!(descriptor = %descriptor.id, "descriptor replaced, rebuilding");
                self.register(descriptor.clone());
                self.rebuild(&descriptor, true).await
            }
            Tx::RemoveDoc(remove) => match self.unregister(&remove.object_id) {
                Some(descriptor) => {
                    info!(descriptor = %descriptor.id, "descriptor removed, deleting output");
                    self.rebuild(&descriptor, false).await
                }
                None => {
                    warn!(object = %remove.object_id, "removed descriptor was not registered");
                    Vec::new()
                }
            },
            Tx::AddCollection(_) | Tx::UpdateCollection(_) => Vec::new(),
        }
    }

    /// Recompute a descriptor's entire output. With `apply` false, only
    /// delete what the descriptor produced.
    pub async fn rebuild(&self, descriptor: &Descriptor, apply: bool) -> Vec<Tx> {
        crate::metrics::record_rebuild(&descriptor.target_class);
        if !apply {
            let mut query = QueryMap::new();
            query.insert(ATTR_DESCRIPTOR_ID.into(), Value::String(descriptor.id.clone()));
            let stale = match self
                .storage
                .find_all(&descriptor.target_class, &query, None)
                .await
            {
                Ok(docs) => docs,
                Err(err) => {
                    warn!(descriptor = %descriptor.id, error = %err, "rebuild scan failed");
                    return Vec::new();
                }
            };
            let diff = reconcile(&stale, Vec::new());
            return self.apply_reconciliation(descriptor, diff).await;
        }

        let sources = match self
            .storage
            .find_all(&descriptor.source_class, &QueryMap::new(), None)
            .await
        {
            Ok(docs) => docs,
            Err(err) => {
                warn!(descriptor = %descriptor.id, error = %err, "rebuild scan failed");
                return Vec::new();
            }
        };
        info!(descriptor = %descriptor.id, sources = sources.len(), "rebuilding derived data");

        let mut out = Vec::new();
        for source in sources {
            // Re-run evaluation as if the document were being created from
            // its stored state; reconciliation converges the existing set.
            let synthetic = Tx::CreateDoc(TxCreateDoc::from_doc(&source));
            out.extend(self.materialize(descriptor, &synthetic, Some(&source)).await);
        }
        out
    }

    async fn read_current(&self, class: &str, id: &str) -> Option<Doc> {
        let mut query = QueryMap::new();
        query.insert("id".into(), Value::String(id.to_string()));
        self.storage
            .find_all(class, &query, None)
            .await
            .ok()?
            .into_iter()
            .next()
    }
}

fn eligible(descriptor: &Descriptor, doc: &Doc) -> bool {
    descriptor
        .query
        .as_ref()
        .map(|q| query::matches(doc, q))
        .unwrap_or(true)
}
