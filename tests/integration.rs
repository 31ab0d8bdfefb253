//! Integration Tests for the Document Store Engine
//!
//! End-to-end scenarios exercising the full commit pipeline and the
//! WebSocket sync layer on a localhost socket. No external services are
//! required; the server binds an ephemeral port per test.
//!
//! # Test Organization
//! - `pipeline_*` - workspace-level scenarios: derivation, collections
//! - `shortref_*` - allocator behavior under contention
//! - `sync_*` - client/server replication over a real socket

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::timeout;

use docstore_engine::derived::{CollectionRule, DescriptorBuilder, MapperRegistry, MappingRule};
use docstore_engine::hierarchy::{
    CLASS_CLASS, CLASS_DERIVED_DATA_DESCRIPTOR, CLASS_DOC, SPACE_MODEL,
};
use docstore_engine::sync::{SyncClient, SyncServer};
use docstore_engine::{
    EngineConfig, EngineError, Hierarchy, MemDb, QueryMap, ShortRefAllocator, SortOrder, Storage,
    Tx, UpdateOps, Workspace,
};

// =============================================================================
// Helpers
// =============================================================================

async fn class(ws: &impl Commit, id: &str, extends: &str, domain: Option<&str>) {
    let mut attrs = json!({ "extends": extends });
    if let Some(domain) = domain {
        attrs["domain"] = Value::String(domain.into());
    }
    ws.commit(Tx::create(id, CLASS_CLASS, SPACE_MODEL, "system", attrs))
        .await;
}

/// Both `Workspace` and `SyncClient` commit transactions; the helpers only
/// need that much.
trait Commit {
    async fn commit(&self, tx: Tx) -> Vec<Tx>;
}

impl Commit for Workspace {
    async fn commit(&self, tx: Tx) -> Vec<Tx> {
        self.tx(tx).await.expect("commit failed")
    }
}

impl Commit for SyncClient {
    async fn commit(&self, tx: Tx) -> Vec<Tx> {
        self.tx(tx).await.expect("commit failed")
    }
}

async fn task_schema(ws: &impl Commit) {
    class(ws, "task.class.Task", CLASS_DOC, Some("task")).await;
    class(ws, "task.class.Title", CLASS_DOC, Some("task")).await;
}

async fn titles(ws: &Workspace) -> Vec<String> {
    let docs = ws
        .find_all(
            "task.class.Title",
            &QueryMap::new(),
            Some(docstore_engine::FindOptions::sorted_by("title", SortOrder::Asc)),
        )
        .await
        .unwrap();
    docs.iter()
        .filter_map(|d| d.attr_str("title"))
        .map(str::to_string)
        .collect()
}

// =============================================================================
// Pipeline scenarios
// =============================================================================

#[tokio::test]
async fn pipeline_multi_doc_fan_out_and_collapse() {
    let ws = Workspace::new(Arc::new(MapperRegistry::new())).await.unwrap();
    task_schema(&ws).await;
    ws.commit(Tx::create(
        "dd-1",
        CLASS_DERIVED_DATA_DESCRIPTOR,
        SPACE_MODEL,
        "system",
        DescriptorBuilder::new("task.class.Task", "task.class.Title")
            .pattern_rule("name", "title", "A.", None, true)
            .build_attributes(),
    ))
    .await;

    ws.commit(Tx::create(
        "t1",
        "task.class.Task",
        "space-1",
        "alice",
        json!({"name": "AB AC DAD QAE"}),
    ))
    .await;
    assert_eq!(titles(&ws).await, vec!["AB", "AC", "AD", "AE"]);

    ws.commit(Tx::update(
        "t1",
        "task.class.Task",
        "space-1",
        "alice",
        UpdateOps::set_fields(json!({"name": "AQ"}).as_object().unwrap().clone()),
    ))
    .await;
    assert_eq!(titles(&ws).await, vec!["AQ"]);

    ws.commit(Tx::remove("t1", "task.class.Task", "space-1", "alice"))
        .await;
    assert!(titles(&ws).await.is_empty());
}

#[tokio::test]
async fn pipeline_capture_group_extraction() {
    let ws = Workspace::new(Arc::new(MapperRegistry::new())).await.unwrap();
    task_schema(&ws).await;
    ws.commit(Tx::create(
        "dd-1",
        CLASS_DERIVED_DATA_DESCRIPTOR,
        SPACE_MODEL,
        "system",
        DescriptorBuilder::new("task.class.Task", "task.class.Title")
            .pattern_rule("name", "title", "(A(.))", Some(2), true)
            .build_attributes(),
    ))
    .await;

    ws.commit(Tx::create(
        "t1",
        "task.class.Task",
        "space-1",
        "alice",
        json!({"name": "qwe AB AC DAD QAE"}),
    ))
    .await;
    assert_eq!(titles(&ws).await, vec!["B", "C", "D", "E"]);
}

#[tokio::test]
async fn pipeline_collection_summaries_track_children() {
    let ws = Workspace::new(Arc::new(MapperRegistry::new())).await.unwrap();
    task_schema(&ws).await;
    ws.commit(Tx::create(
        "dd-1",
        CLASS_DERIVED_DATA_DESCRIPTOR,
        SPACE_MODEL,
        "system",
        DescriptorBuilder::new("task.class.Task", "task.class.Title")
            .rule("shortId", "title")
            .collection(CollectionRule {
                source_field: "parent".into(),
                target_field: "children".into(),
                rules: vec![MappingRule {
                    source_field: "shortId".into(),
                    target_field: "shortId".into(),
                    pattern: None,
                }],
            })
            .build_attributes(),
    ))
    .await;

    ws.commit(Tx::create(
        "p1",
        "task.class.Title",
        "space-1",
        "alice",
        json!({"children": []}),
    ))
    .await;

    for i in 0..10 {
        ws.commit(Tx::create(
            &format!("t{i}"),
            "task.class.Task",
            "space-1",
            "alice",
            json!({"shortId": format!("TASK-{i}"), "parent": "p1"}),
        ))
        .await;
    }

    let children = |parent: docstore_engine::Doc| -> usize {
        parent.attributes["children"].as_array().unwrap().len()
    };
    assert_eq!(children(ws.model().get("p1").unwrap()), 10);

    ws.commit(Tx::remove("t3", "task.class.Task", "space-1", "alice"))
        .await;
    let parent = ws.model().get("p1").unwrap();
    let remaining = parent.attributes["children"].as_array().unwrap();
    assert_eq!(remaining.len(), 9);
    assert!(remaining
        .iter()
        .all(|item| item["shortId"] != json!("TASK-3")));
}

#[tokio::test]
async fn pipeline_replay_reproduces_model() {
    let ws = Workspace::new(Arc::new(MapperRegistry::new())).await.unwrap();
    task_schema(&ws).await;
    ws.commit(Tx::create(
        "dd-1",
        CLASS_DERIVED_DATA_DESCRIPTOR,
        SPACE_MODEL,
        "system",
        DescriptorBuilder::new("task.class.Task", "task.class.Title")
            .rule("shortId", "title")
            .build_attributes(),
    ))
    .await;
    ws.commit(Tx::create(
        "t1",
        "task.class.Task",
        "space-1",
        "alice",
        json!({"shortId": "TASK-1"}),
    ))
    .await;

    // Replay the log into a fresh model with no derived engine: the logged
    // derived writes alone must reproduce the full state.
    let hierarchy = Arc::new(Hierarchy::with_core_classes());
    let replica = MemDb::new(hierarchy.clone());
    for tx in ws.all_txes() {
        if hierarchy.is_derived(tx.object_class(), CLASS_CLASS) {
            if let Tx::CreateDoc(create) = &tx {
                hierarchy.record_class_doc(&create.to_doc());
            }
        }
        use docstore_engine::TxProcessor;
        replica.process(&tx).await.unwrap();
    }
    assert_eq!(replica.len(), ws.model().len());
    let derived = replica
        .find_all("task.class.Title", &QueryMap::new(), None)
        .await
        .unwrap();
    assert_eq!(derived.len(), 1);
    assert_eq!(derived[0].attr_str("title"), Some("TASK-1"));
}

// =============================================================================
// Short-ref allocation
// =============================================================================

#[tokio::test]
async fn shortref_concurrent_allocations_stay_unique() {
    let db = Arc::new(MemDb::new(Arc::new(Hierarchy::with_core_classes())));
    let config = EngineConfig {
        shortref_jitter_min_ms: 0,
        shortref_jitter_max_ms: 5,
        ..EngineConfig::default()
    };
    let allocator = Arc::new(ShortRefAllocator::new(db.clone(), &config));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let allocator = allocator.clone();
        handles.push(tokio::spawn(async move {
            allocator.allocate("TASK", "space-1", "alice").await
        }));
    }

    let mut refs = Vec::new();
    for handle in handles {
        refs.push(handle.await.unwrap().unwrap());
    }
    refs.sort();
    refs.dedup();
    assert_eq!(refs.len(), 16, "allocations must be unique");
    for n in 1..=16 {
        assert!(refs.contains(&format!("TASK-{n}")), "missing TASK-{n}");
    }
}

// =============================================================================
// Sync over a real socket
// =============================================================================

async fn spawn_server() -> String {
    let config = EngineConfig {
        listen_addr: "127.0.0.1:0".into(),
        ..EngineConfig::default()
    };
    let server = SyncServer::bind(&config, Arc::new(MapperRegistry::new()))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    format!("ws://{addr}")
}

#[tokio::test]
async fn sync_peers_receive_commits_in_order() {
    let url = spawn_server().await;
    let config = EngineConfig::default();

    let alice = SyncClient::connect(&url, "acme", &config).await.unwrap();
    let bob = SyncClient::connect(&url, "acme", &config).await.unwrap();
    let mut feed = bob.subscribe();

    task_schema(&alice).await;
    alice
        .commit(Tx::create(
            "t1",
            "task.class.Task",
            "space-1",
            "alice",
            json!({"title": "hello"}),
        ))
        .await;

    // Bob sees the two class docs and then the task, in commit order.
    let mut received = Vec::new();
    for _ in 0..3 {
        let tx = timeout(Duration::from_secs(5), feed.recv())
            .await
            .expect("push timed out")
            .unwrap();
        received.push(tx);
    }
    assert_eq!(received[0].object_id(), "task.class.Task");
    assert_eq!(received[1].object_id(), "task.class.Title");
    assert_eq!(received[2].object_id(), "t1");

    // The class docs landed in Bob's local projection.
    assert!(bob.hierarchy().has_class("task.class.Task"));
    assert_eq!(bob.hierarchy().domain("task.class.Task").unwrap(), "task");

    // Non-model reads go to the server.
    let tasks = bob
        .find_all("task.class.Task", &QueryMap::new(), None)
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].attr_str("title"), Some("hello"));
}

#[tokio::test]
async fn sync_originator_gets_derived_txes_in_result_not_pushed() {
    let url = spawn_server().await;
    let config = EngineConfig::default();

    let alice = SyncClient::connect(&url, "acme", &config).await.unwrap();
    let bob = SyncClient::connect(&url, "acme", &config).await.unwrap();
    let mut alice_feed = alice.subscribe();
    let mut bob_feed = bob.subscribe();

    task_schema(&alice).await;
    alice
        .commit(Tx::create(
            "dd-1",
            CLASS_DERIVED_DATA_DESCRIPTOR,
            SPACE_MODEL,
            "system",
            DescriptorBuilder::new("task.class.Task", "task.class.Title")
                .rule("shortId", "title")
                .build_attributes(),
        ))
        .await;

    let produced = alice
        .commit(Tx::create(
            "t1",
            "task.class.Task",
            "space-1",
            "alice",
            json!({"shortId": "TASK-1"}),
        ))
        .await;
    // Source tx plus the derived title, returned to the originator.
    assert_eq!(produced.len(), 2);
    assert_eq!(produced[1].object_class(), "task.class.Title");

    // Bob receives every produced tx; Alice receives none of her own.
    let mut bob_seen = Vec::new();
    for _ in 0..5 {
        let tx = timeout(Duration::from_secs(5), bob_feed.recv())
            .await
            .expect("push timed out")
            .unwrap();
        bob_seen.push(tx.id().to_string());
    }
    assert!(bob_seen.contains(&produced[1].id().to_string()));
    assert!(
        timeout(Duration::from_millis(200), alice_feed.recv())
            .await
            .is_err(),
        "originator must not be echoed"
    );
}

#[tokio::test]
async fn sync_late_joiner_bootstraps_model() {
    let url = spawn_server().await;
    let config = EngineConfig::default();

    let alice = SyncClient::connect(&url, "acme", &config).await.unwrap();
    task_schema(&alice).await;
    alice
        .commit(Tx::create(
            "t1",
            "task.class.Task",
            "space-1",
            "alice",
            json!({"title": "early"}),
        ))
        .await;

    // Carol joins after the fact; loadModel replays the class docs.
    let carol = SyncClient::connect(&url, "acme", &config).await.unwrap();
    assert!(carol.hierarchy().has_class("task.class.Task"));
    let classes = carol
        .find_all(CLASS_CLASS, &QueryMap::new(), None)
        .await
        .unwrap();
    assert_eq!(classes.len(), 2);

    // Data documents are not in the local projection; they are served
    // remotely.
    assert!(carol.model().get("t1").is_none());
    let tasks = carol
        .find_all("task.class.Task", &QueryMap::new(), None)
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
}

#[tokio::test]
async fn sync_conflict_propagates_to_caller() {
    let url = spawn_server().await;
    let config = EngineConfig::default();

    let alice = SyncClient::connect(&url, "acme", &config).await.unwrap();
    task_schema(&alice).await;
    alice
        .commit(Tx::create("t1", "task.class.Task", "space-1", "alice", json!({})))
        .await;

    let err = alice
        .tx(Tx::create("t1", "task.class.Task", "space-1", "alice", json!({})))
        .await
        .unwrap_err();
    match err {
        EngineError::Protocol(message) => assert!(message.contains("conflict"), "{message}"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn sync_workspaces_are_isolated() {
    let url = spawn_server().await;
    let config = EngineConfig::default();

    let acme = SyncClient::connect(&url, "acme", &config).await.unwrap();
    let globex = SyncClient::connect(&url, "globex", &config).await.unwrap();
    let mut globex_feed = globex.subscribe();

    task_schema(&acme).await;
    acme.commit(Tx::create("t1", "task.class.Task", "space-1", "alice", json!({})))
        .await;

    assert!(
        timeout(Duration::from_millis(200), globex_feed.recv())
            .await
            .is_err(),
        "workspaces must not leak"
    );
    assert!(!globex.hierarchy().has_class("task.class.Task"));
}
