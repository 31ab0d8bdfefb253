//! Storage contract and the in-memory implementations.

pub mod memory;
pub mod traits;

pub use memory::{MemDb, TxLog};
pub use traits::{FindOptions, Storage};
