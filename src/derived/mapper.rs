//! Mapper registry.
//!
//! A mapper is an externally supplied function identified by an opaque
//! resource key; when a descriptor names one, the mapper fully owns output
//! construction and rule evaluation is skipped. The registry is an explicit
//! object built at startup and passed by reference into the engine, so
//! tests can run with isolated registries.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::derived::descriptor::Descriptor;
use crate::error::Result;
use crate::hierarchy::Hierarchy;
use crate::storage::traits::Storage;
use crate::tx::Tx;

/// Everything a mapper may consult while building output.
pub struct MapperContext<'a> {
    pub descriptor: &'a Descriptor,
    pub hierarchy: &'a Hierarchy,
    pub storage: &'a dyn Storage,
}

/// An externally registered derived-data producer.
///
/// Returns raw attribute bags; the engine seeds identity and
/// back-references exactly as it does for rule output, so mapper results
/// reconcile the same way.
#[async_trait]
pub trait DocMapper: Send + Sync {
    async fn map(&self, tx: &Tx, ctx: MapperContext<'_>) -> Result<Vec<Map<String, Value>>>;
}

/// Registry of mappers keyed by opaque resource id.
#[derive(Default)]
pub struct MapperRegistry {
    mappers: HashMap<String, Arc<dyn DocMapper>>,
}

impl MapperRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mapper under its resource key. Last registration wins.
    pub fn register(&mut self, key: &str, mapper: Arc<dyn DocMapper>) {
        self.mappers.insert(key.to_string(), mapper);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<dyn DocMapper>> {
        self.mappers.get(key).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }
}
