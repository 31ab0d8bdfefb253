// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for the document store.
//!
//! Errors fall into four families with different handling contracts:
//! - **Configuration** ([`EngineError::DomainNotFound`], [`EngineError::ClassNotFound`],
//!   [`EngineError::ClassCycle`]): the model itself is broken. Fatal, never retried.
//! - **Not found** ([`EngineError::DocNotFound`], [`EngineError::CollectionItemNotFound`]):
//!   reported to the caller as typed failures, never swallowed.
//! - **Conflict** ([`EngineError::DuplicateId`]): retried transparently by the
//!   short-reference allocator with jittered backoff.
//! - **Connection** ([`EngineError::ConnectionClosed`], [`EngineError::Unknown`]):
//!   close the connection and fail in-flight requests explicitly.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// No ancestor of the class declares a storage domain. Broken model.
    #[error("no storage domain declared for class '{class}' or any of its ancestors")]
    DomainNotFound { class: String },

    /// The class was never registered in the hierarchy. Broken model.
    #[error("unknown class '{class}'")]
    ClassNotFound { class: String },

    /// The `extends` chain loops back on itself. Broken model.
    #[error("cyclic extends chain through class '{class}'")]
    ClassCycle { class: String },

    /// Update/remove/collection op targeted a document that does not exist.
    #[error("document not found: '{id}'")]
    DocNotFound { id: String },

    /// Collection op targeted an embedded item that does not exist.
    #[error("embedded item '{local_id}' not found in collection '{collection}' of '{id}'")]
    CollectionItemNotFound {
        id: String,
        collection: String,
        local_id: String,
    },

    /// Create collided with an existing document id (duplicate key).
    #[error("duplicate document id: '{id}'")]
    DuplicateId { id: String },

    /// A descriptor document could not be parsed into a usable descriptor.
    #[error("invalid derived data descriptor '{id}': {reason}")]
    InvalidDescriptor { id: String, reason: String },

    /// Allocator gave up after exhausting its retry budget.
    #[error("short reference allocation for '{namespace}' exhausted after {attempts} attempts")]
    ShortRefExhausted { namespace: String, attempts: usize },

    /// Malformed frame, unknown method, or bad parameters on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The remote side went away; in-flight requests fail with this.
    #[error("connection closed")]
    ConnectionClosed,

    /// Catch-all reported across the RPC boundary as `unknownError`.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl EngineError {
    /// Conflicts are the only retryable family (allocator backoff loop).
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::DuplicateId { .. })
    }

    /// Wire error code for the RPC envelope.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::DomainNotFound { .. } | Self::ClassNotFound { .. } | Self::ClassCycle { .. } => {
                "configuration"
            }
            Self::DocNotFound { .. } | Self::CollectionItemNotFound { .. } => "notFound",
            Self::DuplicateId { .. } => "conflict",
            Self::InvalidDescriptor { .. } | Self::Protocol(_) => "badRequest",
            Self::ShortRefExhausted { .. } => "exhausted",
            Self::ConnectionClosed | Self::Unknown(_) => "unknownError",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_detection() {
        assert!(EngineError::DuplicateId { id: "x".into() }.is_conflict());
        assert!(!EngineError::DocNotFound { id: "x".into() }.is_conflict());
        assert!(!EngineError::ConnectionClosed.is_conflict());
    }

    #[test]
    fn test_error_codes() {
        let err = EngineError::DomainNotFound { class: "task.class.Task".into() };
        assert_eq!(err.code(), "configuration");

        let err = EngineError::DocNotFound { id: "doc-1".into() };
        assert_eq!(err.code(), "notFound");

        let err = EngineError::Unknown("boom".into());
        assert_eq!(err.code(), "unknownError");
    }

    #[test]
    fn test_display_includes_ids() {
        let err = EngineError::DuplicateId { id: "TASK-7".into() };
        assert!(err.to_string().contains("TASK-7"));

        let err = EngineError::ShortRefExhausted { namespace: "TASK".into(), attempts: 32 };
        assert!(err.to_string().contains("32"));
    }
}
