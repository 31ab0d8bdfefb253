//! Configuration for the document store engine.
//!
//! # Example
//!
//! ```
//! use docstore_engine::EngineConfig;
//!
//! // Minimal config (uses defaults)
//! let config = EngineConfig::default();
//! assert_eq!(config.shortref_max_attempts, 32);
//!
//! // Full config
//! let config = EngineConfig {
//!     listen_addr: "0.0.0.0:3653".into(),
//!     shortref_max_attempts: 16,
//!     ..Default::default()
//! };
//! ```

use serde::Deserialize;

/// Configuration for the engine and its sync server.
///
/// All fields have sensible defaults; an embedded, single-process store
/// needs none of them.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Address the sync server binds to (e.g., "127.0.0.1:3653")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Short-ref allocation attempts before giving up
    #[serde(default = "default_shortref_max_attempts")]
    pub shortref_max_attempts: u32,

    /// Short-ref retry jitter bounds in milliseconds
    #[serde(default = "default_shortref_jitter_min_ms")]
    pub shortref_jitter_min_ms: u64,
    #[serde(default = "default_shortref_jitter_max_ms")]
    pub shortref_jitter_max_ms: u64,

    /// Capacity of the client's push-subscriber feed; slow subscribers
    /// observe a lag error past this many unread transactions
    #[serde(default = "default_broadcast_queue")]
    pub broadcast_queue: usize,

    /// Client RPC timeout in milliseconds
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
}

fn default_listen_addr() -> String { "127.0.0.1:3653".into() }
fn default_shortref_max_attempts() -> u32 { 32 }
fn default_shortref_jitter_min_ms() -> u64 { 5 }
fn default_shortref_jitter_max_ms() -> u64 { 105 }
fn default_broadcast_queue() -> usize { 1024 }
fn default_rpc_timeout_ms() -> u64 { 30_000 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            shortref_max_attempts: default_shortref_max_attempts(),
            shortref_jitter_min_ms: default_shortref_jitter_min_ms(),
            shortref_jitter_max_ms: default_shortref_jitter_max_ms(),
            broadcast_queue: default_broadcast_queue(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3653");
        assert_eq!(config.shortref_max_attempts, 32);
        assert_eq!(config.shortref_jitter_min_ms, 5);
        assert_eq!(config.shortref_jitter_max_ms, 105);
    }

    #[test]
    fn test_partial_override() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"listen_addr": "0.0.0.0:9000"}"#).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.broadcast_queue, 1024);
    }
}
