// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Commit pipeline.
//!
//! A [`Workspace`] owns one isolated universe of documents: its class
//! hierarchy, its append-only transaction log, the in-memory model built
//! from that log, and a derived data engine watching the stream. The
//! pipeline orders commits under a single write lock so derivation always
//! observes the post-commit state it was triggered by.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::derived::{DerivedDataEngine, MapperRegistry};
use crate::document::Doc;
use crate::error::Result;
use crate::hierarchy::{Hierarchy, CLASS_CLASS};
use crate::query::QueryMap;
use crate::storage::memory::{MemDb, TxLog};
use crate::storage::traits::{FindOptions, Storage};
use crate::tx::Tx;

/// Log-then-model storage used for derived writes.
///
/// Every successful write lands in the model and is recorded in the log, so
/// replaying the log always reproduces the model, derived output included.
pub struct PipelineStorage {
    log: Arc<TxLog>,
    model: Arc<MemDb>,
}

impl PipelineStorage {
    #[must_use]
    pub fn new(log: Arc<TxLog>, model: Arc<MemDb>) -> Self {
        Self { log, model }
    }
}

#[async_trait]
impl Storage for PipelineStorage {
    async fn find_all(
        &self,
        class: &str,
        query: &QueryMap,
        options: Option<FindOptions>,
    ) -> Result<Vec<Doc>> {
        self.model.find_all(class, query, options).await
    }

    async fn tx(&self, tx: &Tx) -> Result<()> {
        // Rejected transactions never reach the log.
        self.model.tx(tx).await?;
        self.log.append(tx.clone());
        Ok(())
    }
}

/// One workspace: hierarchy + log + model + derived data, committed in order.
pub struct Workspace {
    hierarchy: Arc<Hierarchy>,
    log: Arc<TxLog>,
    model: Arc<MemDb>,
    derived: DerivedDataEngine,
    write_lock: Mutex<()>,
}

impl Workspace {
    /// Fresh workspace with the core classes and the given mappers.
    pub async fn new(mappers: Arc<MapperRegistry>) -> Result<Self> {
        let hierarchy = Arc::new(Hierarchy::with_core_classes());
        let log = Arc::new(TxLog::new());
        let model = Arc::new(MemDb::new(hierarchy.clone()));
        let storage = Arc::new(PipelineStorage::new(log.clone(), model.clone()));
        let derived =
            DerivedDataEngine::new(hierarchy.clone(), storage, log.clone(), mappers).await?;
        Ok(Self {
            hierarchy,
            log,
            model,
            derived,
            write_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn hierarchy(&self) -> &Arc<Hierarchy> {
        &self.hierarchy
    }

    #[must_use]
    pub fn model(&self) -> &Arc<MemDb> {
        &self.model
    }

    /// Commit one transaction.
    ///
    /// Returns the committed transaction followed by every derived
    /// transaction it triggered, in application order. A rejected
    /// transaction leaves no trace: nothing is logged and nothing derives.
    #[instrument(skip(self, tx), fields(kind = tx.kind(), object = %tx.object_id()))]
    pub async fn tx(&self, tx: Tx) -> Result<Vec<Tx>> {
        let _commit = self.write_lock.lock().await;
        let start = std::time::Instant::now();

        if let Err(err) = self.model.tx(&tx).await {
            crate::metrics::record_tx(tx.kind(), "error");
            return Err(err);
        }
        self.log.append(tx.clone());
        self.record_hierarchy(&tx);

        let derived = self.derived.process(&tx).await;
        debug!(derived = derived.len(), "transaction committed");
        crate::metrics::record_tx(tx.kind(), "success");
        crate::metrics::record_tx_latency(start.elapsed());
        crate::metrics::set_docs(self.model.len());

        let mut out = Vec::with_capacity(1 + derived.len());
        out.push(tx);
        out.extend(derived);
        Ok(out)
    }

    /// Class documents feed the hierarchy as they are committed.
    fn record_hierarchy(&self, tx: &Tx) {
        if !self.hierarchy.is_derived(tx.object_class(), CLASS_CLASS) {
            return;
        }
        match tx {
            Tx::CreateDoc(create) => self.hierarchy.record_class_doc(&create.to_doc()),
            Tx::UpdateDoc(update) => {
                if let Some(doc) = self.model.get(&update.object_id) {
                    self.hierarchy.record_class_doc(&doc);
                }
            }
            _ => {}
        }
    }

    /// Documents of `class` (including subclasses) matching `query`.
    pub async fn find_all(
        &self,
        class: &str,
        query: &QueryMap,
        options: Option<FindOptions>,
    ) -> Result<Vec<Doc>> {
        self.model.find_all(class, query, options).await
    }

    /// The model-domain slice of the log, for client bootstrap.
    #[must_use]
    pub fn model_txes(&self) -> Vec<Tx> {
        self.log.model_txes(&self.hierarchy)
    }

    /// The full log, in commit order.
    #[must_use]
    pub fn all_txes(&self) -> Vec<Tx> {
        self.log.all()
    }
}

#[async_trait]
impl Storage for Workspace {
    async fn find_all(
        &self,
        class: &str,
        query: &QueryMap,
        options: Option<FindOptions>,
    ) -> Result<Vec<Doc>> {
        self.model.find_all(class, query, options).await
    }

    async fn tx(&self, tx: &Tx) -> Result<()> {
        Workspace::tx(self, tx.clone()).await.map(|_| ())
    }
}
