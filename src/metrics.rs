// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the document store.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter
//! (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `docstore_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `kind`: CreateDoc, UpdateDoc, RemoveDoc, AddCollection, UpdateCollection
//! - `action`: create, update, remove
//! - `status`: success, error

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record one committed transaction.
pub fn record_tx(kind: &str, status: &str) {
    counter!(
        "docstore_tx_total",
        "kind" => kind.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record end-to-end commit latency (apply + derivation).
pub fn record_tx_latency(duration: Duration) {
    histogram!("docstore_tx_seconds").record(duration.as_secs_f64());
}

/// Record one derived-data write.
pub fn record_derived_write(action: &str) {
    counter!(
        "docstore_derived_writes_total",
        "action" => action.to_string()
    )
    .increment(1);
}

/// Record the time spent deriving for one transaction.
pub fn record_derived_latency(duration: Duration) {
    histogram!("docstore_derived_seconds").record(duration.as_secs_f64());
}

/// Record a full descriptor rebuild.
pub fn record_rebuild(target_class: &str) {
    counter!(
        "docstore_rebuilds_total",
        "class" => target_class.to_string()
    )
    .increment(1);
}

/// Record one short-ref allocation, labelled by how it ended.
pub fn record_shortref(namespace: &str, status: &str) {
    counter!(
        "docstore_shortref_total",
        "namespace" => namespace.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record the attempts one short-ref allocation consumed.
pub fn record_shortref_attempts(attempts: u32) {
    histogram!("docstore_shortref_attempts").record(f64::from(attempts));
}

/// Record transactions fanned out to peers of the originating client.
pub fn record_broadcast(count: usize) {
    counter!("docstore_broadcast_tx_total").increment(count as u64);
}

/// Set the current number of connected clients.
pub fn set_connected_clients(count: usize) {
    gauge!("docstore_connected_clients").set(count as f64);
}

/// Set the current number of live workspaces on the server.
pub fn set_workspaces(count: usize) {
    gauge!("docstore_workspaces").set(count as f64);
}

/// Set the number of documents held by the in-memory store.
pub fn set_docs(count: usize) {
    gauge!("docstore_docs").set(count as f64);
}
