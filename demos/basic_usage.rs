// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic docstore-engine usage example.
//!
//! Demonstrates:
//! 1. Starting a sync server on an ephemeral port
//! 2. Declaring a small class schema through transactions
//! 3. Registering a derived-data descriptor (regex fan-out)
//! 4. Watching derived documents follow their source
//! 5. Allocating human-readable short references
//! 6. Live fan-out to a second client
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use docstore_engine::derived::{DescriptorBuilder, MapperRegistry};
use docstore_engine::hierarchy::{
    CLASS_CLASS, CLASS_DERIVED_DATA_DESCRIPTOR, CLASS_DOC, SPACE_MODEL,
};
use docstore_engine::sync::{SyncClient, SyncServer};
use docstore_engine::{
    EngineConfig, Hierarchy, MemDb, QueryMap, ShortRefAllocator, Tx, UpdateOps,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n=== docstore-engine: basic usage ===\n");

    // ── 1. Server ────────────────────────────────────────────────────────
    let config = EngineConfig {
        listen_addr: "127.0.0.1:0".into(),
        ..EngineConfig::default()
    };
    let server = SyncServer::bind(&config, Arc::new(MapperRegistry::new())).await?;
    let url = format!("ws://{}", server.local_addr()?);
    tokio::spawn(server.run());
    println!("server listening at {url}");

    // ── 2. Schema ────────────────────────────────────────────────────────
    let alice = SyncClient::connect(&url, "demo", &config).await?;
    alice
        .tx(Tx::create(
            "task.class.Task",
            CLASS_CLASS,
            SPACE_MODEL,
            "system",
            json!({"extends": CLASS_DOC, "domain": "task"}),
        ))
        .await?;
    alice
        .tx(Tx::create(
            "task.class.Label",
            CLASS_CLASS,
            SPACE_MODEL,
            "system",
            json!({"extends": CLASS_DOC, "domain": "task"}),
        ))
        .await?;
    println!("schema declared: task.class.Task, task.class.Label");

    // ── 3. Descriptor: every #hashtag in a task body becomes a Label ─────
    alice
        .tx(Tx::create(
            "dd-labels",
            CLASS_DERIVED_DATA_DESCRIPTOR,
            SPACE_MODEL,
            "system",
            DescriptorBuilder::new("task.class.Task", "task.class.Label")
                .pattern_rule("body", "tag", "#([a-z]+)", Some(1), true)
                .build_attributes(),
        ))
        .await?;

    // ── 4. Watch derived documents follow the source ─────────────────────
    let bob = SyncClient::connect(&url, "demo", &config).await?;
    let mut feed = bob.subscribe();

    let produced = alice
        .tx(Tx::create(
            "t1",
            "task.class.Task",
            "space-1",
            "alice",
            json!({"title": "fix the roof", "body": "#urgent before #winter"}),
        ))
        .await?;
    println!(
        "committed 1 task, server derived {} label(s)",
        produced.len() - 1
    );

    while let Ok(Ok(tx)) = timeout(Duration::from_millis(500), feed.recv()).await {
        println!("  bob <- push {} {}", tx.kind(), tx.object_class());
    }

    let labels = bob
        .find_all("task.class.Label", &QueryMap::new(), None)
        .await?;
    println!(
        "labels now: {:?}",
        labels.iter().filter_map(|d| d.attr_str("tag")).collect::<Vec<_>>()
    );

    // Editing the body re-derives; stale labels disappear.
    alice
        .tx(Tx::update(
            "t1",
            "task.class.Task",
            "space-1",
            "alice",
            UpdateOps::set_fields(
                json!({"body": "#urgent only"}).as_object().unwrap().clone(),
            ),
        ))
        .await?;
    let labels = alice
        .find_all("task.class.Label", &QueryMap::new(), None)
        .await?;
    println!(
        "after edit: {:?}",
        labels.iter().filter_map(|d| d.attr_str("tag")).collect::<Vec<_>>()
    );

    // ── 5. Short references ──────────────────────────────────────────────
    let db = Arc::new(MemDb::new(Arc::new(Hierarchy::with_core_classes())));
    let allocator = ShortRefAllocator::new(db, &config);
    for _ in 0..3 {
        let short = allocator.allocate("TASK", "space-1", "alice").await?;
        println!("allocated {short}");
    }

    alice.close();
    bob.close();
    println!("\ndone");
    Ok(())
}
