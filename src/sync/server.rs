// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! WebSocket sync server with workspace-scoped broadcast.
//!
//! ```text
//! Client A ──┐
//!             ├── Workspace "acme" ── log + model + derived engine
//! Client B ──┘          │
//!                       └── fan-out: every committed tx to every
//!                           client of the workspace except its origin
//! ```
//!
//! The first frame of every connection names a workspace; all later frames
//! are [`RpcRequest`]s. Workspaces are created on first use and dropped
//! from the hub when their last client disconnects.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::derived::MapperRegistry;
use crate::error::{EngineError, Result};
use crate::pipeline::Workspace;
use crate::sync::protocol::{
    FindParams, Hello, RpcRequest, RpcResponse, METHOD_FIND_ALL, METHOD_LOAD_MODEL, METHOD_TX,
};
use crate::tx::Tx;

type PeerSender = mpsc::UnboundedSender<Message>;

/// One live workspace on the hub: the engine plus its connected peers.
struct WorkspaceEntry {
    workspace: Arc<Workspace>,
    peers: Mutex<HashMap<Uuid, PeerSender>>,
    /// Serializes commit + fan-out so peers observe commit order.
    commit: Mutex<()>,
}

type Hub = Arc<RwLock<HashMap<String, Arc<WorkspaceEntry>>>>;

/// The sync server.
pub struct SyncServer {
    listener: TcpListener,
    mappers: Arc<MapperRegistry>,
    workspaces: Hub,
}

impl SyncServer {
    /// Bind to the configured address. The returned server owns the socket;
    /// call [`run`](Self::run) to serve.
    pub async fn bind(config: &EngineConfig, mappers: Arc<MapperRegistry>) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|e| EngineError::Protocol(format!("bind {}: {e}", config.listen_addr)))?;
        info!(addr = %config.listen_addr, "sync server listening");
        Ok(Self {
            listener,
            mappers,
            workspaces: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// The bound address, useful when binding to port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| EngineError::Protocol(format!("local_addr: {e}")))
    }

    /// Accept loop. Runs until the task is dropped.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, addr) = self
                .listener
                .accept()
                .await
                .map_err(|e| EngineError::Protocol(format!("accept: {e}")))?;
            debug!(%addr, "incoming connection");

            let workspaces = self.workspaces.clone();
            let mappers = self.mappers.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, addr, workspaces, mappers).await {
                    warn!(%addr, error = %err, "connection ended with error");
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    workspaces: Hub,
    mappers: Arc<MapperRegistry>,
) -> Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| EngineError::Protocol(format!("handshake: {e}")))?;
    let (mut sender, mut receiver) = ws_stream.split();

    // First frame names the workspace.
    let hello: Hello = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                break serde_json::from_str(&text)
                    .map_err(|e| EngineError::Protocol(format!("hello: {e}")))?;
            }
            Some(Ok(Message::Ping(data))) => {
                sender
                    .send(Message::Pong(data))
                    .await
                    .map_err(|e| EngineError::Protocol(e.to_string()))?;
            }
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(EngineError::Protocol(format!("hello: {e}"))),
        }
    };

    let peer_id = Uuid::new_v4();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let entry = register(&workspaces, &hello.workspace, &mappers, peer_id, &out_tx).await?;
    info!(%addr, %peer_id, workspace = %hello.workspace, "client joined");

    let result = loop {
        tokio::select! {
            // Queued broadcast for this peer.
            queued = out_rx.recv() => {
                match queued {
                    Some(message) => {
                        if let Err(e) = sender.send(message).await {
                            break Err(EngineError::Protocol(e.to_string()));
                        }
                    }
                    None => break Ok(()),
                }
            }
            // Next client frame.
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let request: RpcRequest = match serde_json::from_str(&text) {
                            Ok(request) => request,
                            Err(e) => {
                                warn!(%addr, error = %e, "unparseable request");
                                continue;
                            }
                        };
                        let response = dispatch(&entry, peer_id, request).await;
                        let text = match serde_json::to_string(&response) {
                            Ok(text) => text,
                            Err(e) => {
                                error!(error = %e, "response serialization failed");
                                continue;
                            }
                        };
                        if let Err(e) = sender.send(Message::Text(text.into())).await {
                            break Err(EngineError::Protocol(e.to_string()));
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            break Err(EngineError::Protocol(e.to_string()));
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(EngineError::Protocol(e.to_string())),
                }
            }
        }
    };

    deregister(&workspaces, &hello.workspace, &entry, peer_id).await;
    info!(%addr, %peer_id, "client left");
    result
}

/// Resolve the workspace and insert the peer, retrying if the entry was
/// dropped from the hub between the lookup and the insert (a departing
/// last client races joiners).
async fn register(
    workspaces: &Hub,
    name: &str,
    mappers: &Arc<MapperRegistry>,
    peer_id: Uuid,
    out_tx: &PeerSender,
) -> Result<Arc<WorkspaceEntry>> {
    loop {
        let entry = get_or_create(workspaces, name, mappers).await?;
        {
            let mut peers = entry.peers.lock().await;
            peers.insert(peer_id, out_tx.clone());
            crate::metrics::set_connected_clients(peers.len());
        }
        // Deregistration checks peers under the hub write lock, so once we
        // re-observe our entry here it can no longer be dropped from under
        // us while the peer is in it.
        let still_live = workspaces
            .read()
            .await
            .get(name)
            .is_some_and(|current| Arc::ptr_eq(current, &entry));
        if still_live {
            return Ok(entry);
        }
        entry.peers.lock().await.remove(&peer_id);
    }
}

/// Remove the peer; drop the workspace from the hub when no client remains.
async fn deregister(workspaces: &Hub, name: &str, entry: &Arc<WorkspaceEntry>, peer_id: Uuid) {
    {
        let mut peers = entry.peers.lock().await;
        peers.remove(&peer_id);
        crate::metrics::set_connected_clients(peers.len());
    }
    // Emptiness is re-checked under the hub write lock: a joiner that
    // already resolved this entry inserts its peer before verifying the
    // entry is still hubbed, so one side always observes the other.
    let mut hub = workspaces.write().await;
    let empty = match hub.get(name) {
        Some(current) if Arc::ptr_eq(current, entry) => current.peers.lock().await.is_empty(),
        _ => return,
    };
    if empty {
        hub.remove(name);
        crate::metrics::set_workspaces(hub.len());
        info!(workspace = %name, "workspace dropped (no clients)");
    }
}

async fn get_or_create(
    workspaces: &Hub,
    name: &str,
    mappers: &Arc<MapperRegistry>,
) -> Result<Arc<WorkspaceEntry>> {
    if let Some(entry) = workspaces.read().await.get(name) {
        return Ok(entry.clone());
    }
    let mut hub = workspaces.write().await;
    // Lost the race: someone else created it between the locks.
    if let Some(entry) = hub.get(name) {
        return Ok(entry.clone());
    }
    let workspace = Arc::new(Workspace::new(mappers.clone()).await?);
    let entry = Arc::new(WorkspaceEntry {
        workspace,
        peers: Mutex::new(HashMap::new()),
        commit: Mutex::new(()),
    });
    hub.insert(name.to_string(), entry.clone());
    crate::metrics::set_workspaces(hub.len());
    info!(workspace = %name, "workspace created");
    Ok(entry)
}

async fn dispatch(entry: &Arc<WorkspaceEntry>, origin: Uuid, request: RpcRequest) -> RpcResponse {
    match request.method.as_str() {
        METHOD_TX => {
            let tx: Tx = match serde_json::from_value(request.params) {
                Ok(tx) => tx,
                Err(e) => {
                    return RpcResponse::error(
                        request.id,
                        &EngineError::Protocol(format!("tx params: {e}")),
                    )
                }
            };
            // Commit and fan out under one lock so interleaved commits
            // cannot reorder pushes between peers.
            let _ordered = entry.commit.lock().await;
            match entry.workspace.tx(tx).await {
                Ok(produced) => {
                    broadcast(entry, origin, &produced).await;
                    match serde_json::to_value(&produced) {
                        Ok(result) => RpcResponse::result(request.id, result),
                        Err(e) => RpcResponse::error(
                            request.id,
                            &EngineError::Protocol(format!("tx result: {e}")),
                        ),
                    }
                }
                Err(err) => RpcResponse::error(request.id, &err),
            }
        }
        METHOD_FIND_ALL => {
            let params: FindParams = match serde_json::from_value(request.params) {
                Ok(params) => params,
                Err(e) => {
                    return RpcResponse::error(
                        request.id,
                        &EngineError::Protocol(format!("findAll params: {e}")),
                    )
                }
            };
            match entry
                .workspace
                .find_all(&params.class, &params.query, params.options())
                .await
            {
                Ok(docs) => match serde_json::to_value(&docs) {
                    Ok(result) => RpcResponse::result(request.id, result),
                    Err(e) => RpcResponse::error(
                        request.id,
                        &EngineError::Protocol(format!("findAll result: {e}")),
                    ),
                },
                Err(err) => RpcResponse::error(request.id, &err),
            }
        }
        METHOD_LOAD_MODEL => {
            let model = entry.workspace.model_txes();
            match serde_json::to_value(&model) {
                Ok(result) => RpcResponse::result(request.id, result),
                Err(e) => RpcResponse::error(
                    request.id,
                    &EngineError::Protocol(format!("loadModel result: {e}")),
                ),
            }
        }
        other => RpcResponse::error(
            request.id,
            &EngineError::Protocol(format!("unknown method {other}")),
        ),
    }
}

/// Queue every produced transaction, in order, to every peer but the origin.
async fn broadcast(entry: &Arc<WorkspaceEntry>, origin: Uuid, produced: &[Tx]) {
    let peers = entry.peers.lock().await;
    let mut delivered = 0;
    for (peer_id, sender) in peers.iter() {
        if *peer_id == origin {
            continue;
        }
        for tx in produced {
            let push = RpcResponse::push(tx);
            let Ok(text) = serde_json::to_string(&push) else {
                continue;
            };
            // A closed receiver is deregistered by its own connection task.
            if sender.send(Message::Text(text.into())).is_err() {
                debug!(%peer_id, "peer queue closed, skipping");
                break;
            }
            delivered += 1;
        }
    }
    crate::metrics::record_broadcast(delivered);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let config = EngineConfig {
            listen_addr: "127.0.0.1:0".into(),
            ..EngineConfig::default()
        };
        let server = SyncServer::bind(&config, Arc::new(MapperRegistry::new()))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_hub_creates_workspace_once() {
        let hub: Hub = Arc::new(RwLock::new(HashMap::new()));
        let mappers = Arc::new(MapperRegistry::new());
        let a = get_or_create(&hub, "acme", &mappers).await.unwrap();
        let b = get_or_create(&hub, "acme", &mappers).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(hub.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_register_rebinds_when_entry_was_dropped() {
        let hub: Hub = Arc::new(RwLock::new(HashMap::new()));
        let mappers = Arc::new(MapperRegistry::new());
        // A workspace that lost its last client while we were joining.
        let stale = get_or_create(&hub, "acme", &mappers).await.unwrap();
        hub.write().await.remove("acme");

        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let peer_id = Uuid::new_v4();
        let entry = register(&hub, "acme", &mappers, peer_id, &out_tx).await.unwrap();

        assert!(!Arc::ptr_eq(&entry, &stale));
        assert!(entry.peers.lock().await.contains_key(&peer_id));
        // The peer ended up attached to the entry the hub actually serves.
        let hubbed = hub.read().await.get("acme").cloned().unwrap();
        assert!(Arc::ptr_eq(&hubbed, &entry));
    }

    #[tokio::test]
    async fn test_deregister_keeps_workspace_with_remaining_peer() {
        let hub: Hub = Arc::new(RwLock::new(HashMap::new()));
        let mappers = Arc::new(MapperRegistry::new());
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let entry = register(&hub, "acme", &mappers, first, &out_tx).await.unwrap();
        register(&hub, "acme", &mappers, second, &out_tx).await.unwrap();

        deregister(&hub, "acme", &entry, first).await;
        assert!(hub.read().await.contains_key("acme"));

        deregister(&hub, "acme", &entry, second).await;
        assert!(!hub.read().await.contains_key("acme"));
    }
}
