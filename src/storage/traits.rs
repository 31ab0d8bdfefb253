use async_trait::async_trait;

use crate::document::Doc;
use crate::error::Result;
use crate::query::{QueryMap, SortSpec};
use crate::tx::Tx;

/// Result shaping options for [`Storage::find_all`].
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: SortSpec,
    pub limit: Option<usize>,
}

impl FindOptions {
    /// Sort by one field, optionally limited.
    #[must_use]
    pub fn sorted_by(field: &str, order: crate::query::SortOrder) -> Self {
        Self {
            sort: vec![(field.to_string(), order)],
            limit: None,
        }
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// The storage contract every backend satisfies, persistent or in-memory.
///
/// Any collaborator that can answer class-scoped predicate queries and
/// accept transactions participates in the system through this shape.
#[async_trait]
pub trait Storage: Send + Sync {
    /// All documents of `class` (including subclasses) matching `query`.
    async fn find_all(
        &self,
        class: &str,
        query: &QueryMap,
        options: Option<FindOptions>,
    ) -> Result<Vec<Doc>>;

    /// Apply one transaction.
    async fn tx(&self, tx: &Tx) -> Result<()>;
}
