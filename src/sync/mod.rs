//! Client/server replication over WebSocket.
//!
//! The [`server`] hosts workspaces and fans committed transactions out to
//! every client but their origin; the [`client`] keeps a local projection
//! of the model domain and forwards everything else. [`protocol`] defines
//! the JSON envelope both sides speak.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::SyncClient;
pub use protocol::{FindParams, Hello, RpcError, RpcRequest, RpcResponse};
pub use server::SyncServer;
