//! # Docstore Engine
//!
//! A transactional document store with a class hierarchy, a derived-data
//! materialization engine, and client/server replication.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Sync Layer                            │
//! │  • WebSocket server, one hub entry per workspace            │
//! │  • Every committed tx pushed to every client but its origin │
//! │  • Clients bootstrap a local model-domain projection        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Commit Pipeline                         │
//! │  • Append-only transaction log (ground truth)               │
//! │  • In-memory model indexed under every ancestor class       │
//! │  • Single write lock orders commits per workspace           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Derived Data Engine                        │
//! │  • Descriptors map source classes to derived documents      │
//! │  • Regex rules fan one source out into many documents       │
//! │  • Identity-agnostic reconciliation of old vs. new sets     │
//! │  • Back-reference summaries pushed into parent collections  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Documents are schemaless attribute bags typed by a class; classes form
//! a single-inheritance hierarchy and inherit their domain from the
//! nearest ancestor that declares one. Every mutation is a [`tx::Tx`]; the
//! log replays into the model, so the store can always be rebuilt.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docstore_engine::derived::MapperRegistry;
//! use docstore_engine::hierarchy::{CLASS_CLASS, SPACE_MODEL};
//! use docstore_engine::{QueryMap, Tx, Workspace};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> docstore_engine::Result<()> {
//!     let ws = Workspace::new(Arc::new(MapperRegistry::new())).await?;
//!
//!     // Declare a class, then create a document of it.
//!     ws.tx(Tx::create(
//!         "task.class.Task",
//!         CLASS_CLASS,
//!         SPACE_MODEL,
//!         "system",
//!         json!({"extends": "core.class.Doc", "domain": "task"}),
//!     ))
//!     .await?;
//!     ws.tx(Tx::create(
//!         "task-1",
//!         "task.class.Task",
//!         "space-1",
//!         "alice",
//!         json!({"title": "fix the roof", "state": "open"}),
//!     ))
//!     .await?;
//!
//!     let open = ws
//!         .find_all("task.class.Task", &QueryMap::new(), None)
//!         .await?;
//!     assert_eq!(open.len(), 1);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod derived;
pub mod document;
pub mod error;
pub mod hierarchy;
pub mod metrics;
pub mod pipeline;
pub mod query;
pub mod shortref;
pub mod storage;
pub mod sync;
pub mod tx;

pub use config::EngineConfig;
pub use derived::{DerivedDataEngine, Descriptor, DescriptorBuilder};
pub use document::Doc;
pub use error::{EngineError, Result};
pub use hierarchy::{ClassDef, Hierarchy};
pub use pipeline::Workspace;
pub use query::{QueryMap, SortOrder};
pub use shortref::ShortRefAllocator;
pub use storage::{FindOptions, MemDb, Storage, TxLog};
pub use sync::{SyncClient, SyncServer};
pub use tx::{Tx, TxProcessor, UpdateOps};
