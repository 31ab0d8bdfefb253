// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Human-readable sequential reference allocation (`TASK-17`).
//!
//! Counters are plain documents, one per issued reference, so allocation
//! needs no coordinator: read the highest counter in the namespace, create
//! the successor, and rely on the duplicate-id conflict to detect a racing
//! allocator. Races are resolved by retrying with jitter.

use std::sync::Arc;

use rand::Rng;
use serde_json::json;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::hierarchy::CLASS_SHORT_REF;
use crate::query::{QueryMap, SortOrder};
use crate::storage::traits::{FindOptions, Storage};
use crate::tx::Tx;

/// Attribute holding the namespace a reference belongs to.
pub const ATTR_NAMESPACE: &str = "namespace";
/// Attribute holding the numeric counter of a reference.
pub const ATTR_COUNTER: &str = "counter";

/// Optimistic allocator of namespace-scoped sequential references.
pub struct ShortRefAllocator {
    storage: Arc<dyn Storage>,
    max_attempts: u32,
    jitter_min_ms: u64,
    jitter_max_ms: u64,
}

impl ShortRefAllocator {
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, config: &EngineConfig) -> Self {
        Self {
            storage,
            max_attempts: config.shortref_max_attempts.max(1),
            jitter_min_ms: config.shortref_jitter_min_ms,
            jitter_max_ms: config.shortref_jitter_max_ms.max(config.shortref_jitter_min_ms),
        }
    }

    /// Allocate the next reference in `namespace`, e.g. `TASK-17`.
    ///
    /// Returns [`EngineError::ShortRefExhausted`] when every attempt lost
    /// its race; any other storage error aborts immediately.
    #[tracing::instrument(skip(self), fields(namespace = %namespace))]
    pub async fn allocate(
        &self,
        namespace: &str,
        space: &str,
        modified_by: &str,
    ) -> Result<String> {
        for attempt in 1..=self.max_attempts {
            let next = self.highest(namespace).await? + 1;
            let reference = format!("{namespace}-{next}");
            let tx = Tx::create(
                &reference,
                CLASS_SHORT_REF,
                space,
                modified_by,
                json!({ ATTR_NAMESPACE: namespace, ATTR_COUNTER: next }),
            );
            match self.storage.tx(&tx).await {
                Ok(()) => {
                    debug!(reference = %reference, attempt, "short ref allocated");
                    crate::metrics::record_shortref(namespace, "success");
                    crate::metrics::record_shortref_attempts(attempt);
                    return Ok(reference);
                }
                Err(err) if err.is_conflict() => {
                    warn!(reference = %reference, attempt, "short ref race lost, retrying");
                    let jitter = {
                        let mut rng = rand::thread_rng();
                        rng.gen_range(self.jitter_min_ms..=self.jitter_max_ms)
                    };
                    sleep(Duration::from_millis(jitter)).await;
                }
                Err(err) => {
                    crate::metrics::record_shortref(namespace, "error");
                    return Err(err);
                }
            }
        }
        crate::metrics::record_shortref(namespace, "exhausted");
        Err(EngineError::ShortRefExhausted {
            namespace: namespace.to_string(),
            attempts: self.max_attempts as usize,
        })
    }

    /// Highest counter issued in the namespace so far, 0 when none.
    async fn highest(&self, namespace: &str) -> Result<i64> {
        let mut query = QueryMap::new();
        query.insert(ATTR_NAMESPACE.into(), json!(namespace));
        let top = self
            .storage
            .find_all(
                CLASS_SHORT_REF,
                &query,
                Some(FindOptions::sorted_by(ATTR_COUNTER, SortOrder::Desc).with_limit(1)),
            )
            .await?;
        Ok(top
            .first()
            .and_then(|doc| doc.field(ATTR_COUNTER))
            .and_then(|v| v.as_i64())
            .unwrap_or(0))
    }
}
