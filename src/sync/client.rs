// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! WebSocket sync client.
//!
//! On connect the client names its workspace, then bootstraps: every push
//! that arrives while `loadModel` is in flight is buffered; the fetched
//! model transactions are replayed into a local hierarchy + model
//! projection; buffered pushes are then replayed in arrival order, skipping
//! transaction ids already seen. After bootstrap, model-domain reads are
//! answered locally and everything else goes over the connection.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::document::Doc;
use crate::error::{EngineError, Result};
use crate::hierarchy::{Hierarchy, CLASS_CLASS, DOMAIN_MODEL};
use crate::query::QueryMap;
use crate::storage::memory::MemDb;
use crate::storage::traits::{FindOptions, Storage};
use crate::sync::protocol::{
    FindParams, Hello, RpcRequest, RpcResponse, METHOD_FIND_ALL, METHOD_LOAD_MODEL, METHOD_TX,
};
use crate::tx::Tx;

type Pending = DashMap<u64, oneshot::Sender<Result<Value>>>;

/// Bootstrap buffer: pushes held back until the model replay finishes.
struct BootState {
    buffering: bool,
    buffer: Vec<Tx>,
    seen: HashSet<String>,
}

struct ClientInner {
    out: mpsc::UnboundedSender<Message>,
    pending: Pending,
    next_id: AtomicU64,
    hierarchy: Arc<Hierarchy>,
    model: Arc<MemDb>,
    state: parking_lot::Mutex<BootState>,
    pushes: broadcast::Sender<Tx>,
    rpc_timeout: Duration,
}

/// Connected replica of one workspace.
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

impl SyncClient {
    /// Connect to `url` (e.g. `ws://127.0.0.1:3653`) and bootstrap against
    /// the named workspace.
    pub async fn connect(url: &str, workspace: &str, config: &EngineConfig) -> Result<Self> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| EngineError::Protocol(format!("connect {url}: {e}")))?;
        let (mut sink, mut stream) = ws_stream.split();

        let hello = serde_json::to_string(&Hello {
            workspace: workspace.to_string(),
        })
        .map_err(|e| EngineError::Protocol(e.to_string()))?;
        sink.send(Message::Text(hello.into()))
            .await
            .map_err(|e| EngineError::Protocol(format!("hello: {e}")))?;

        let (out, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let inner = Arc::new(ClientInner::new(out, config));

        // Writer: drains the outbound queue into the socket.
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        // Reader: routes responses to their callers and pushes to the
        // local projection.
        let reader = inner.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => reader.route(&text).await,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "connection error");
                        break;
                    }
                }
            }
            reader.fail_pending();
        });

        let client = Self { inner };
        client.bootstrap().await?;
        Ok(client)
    }

    /// Fetch and replay the model, then drain the bootstrap buffer.
    async fn bootstrap(&self) -> Result<()> {
        let result = self.call(METHOD_LOAD_MODEL, Value::Null).await?;
        let model_txes: Vec<Tx> =
            serde_json::from_value(result).map_err(|e| EngineError::Protocol(e.to_string()))?;
        let fetched = model_txes.len();
        for tx in model_txes {
            self.inner.apply(&tx).await;
        }
        let replayed = self.inner.finish_bootstrap().await;
        info!(fetched, replayed, "bootstrap complete");
        Ok(())
    }

    /// Commit a transaction through the server.
    ///
    /// Returns the committed transaction plus everything it derived, as
    /// applied by the server in order. The local model projection picks up
    /// any model-domain transactions in the result.
    pub async fn tx(&self, tx: Tx) -> Result<Vec<Tx>> {
        let params =
            serde_json::to_value(&tx).map_err(|e| EngineError::Protocol(e.to_string()))?;
        let result = self.call(METHOD_TX, params).await?;
        let produced: Vec<Tx> =
            serde_json::from_value(result).map_err(|e| EngineError::Protocol(e.to_string()))?;
        // The server does not echo our own commits back.
        for tx in &produced {
            self.inner.apply(tx).await;
        }
        Ok(produced)
    }

    /// Query documents. Model-domain classes are answered from the local
    /// projection, everything else by the server.
    pub async fn find_all(
        &self,
        class: &str,
        query: &QueryMap,
        options: Option<FindOptions>,
    ) -> Result<Vec<Doc>> {
        if self.is_model_class(class) {
            return self.inner.model.find_all(class, query, options).await;
        }
        let params = FindParams::from_options(class, query.clone(), options);
        let params =
            serde_json::to_value(&params).map_err(|e| EngineError::Protocol(e.to_string()))?;
        let result = self.call(METHOD_FIND_ALL, params).await?;
        serde_json::from_value(result).map_err(|e| EngineError::Protocol(e.to_string()))
    }

    /// Transactions pushed by other clients of the workspace.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Tx> {
        self.inner.pushes.subscribe()
    }

    /// The local hierarchy, built from synced class documents.
    #[must_use]
    pub fn hierarchy(&self) -> &Arc<Hierarchy> {
        &self.inner.hierarchy
    }

    /// The local model-domain projection.
    #[must_use]
    pub fn model(&self) -> &Arc<MemDb> {
        &self.inner.model
    }

    /// Close the connection. In-flight requests resolve with an error.
    pub fn close(&self) {
        let _ = self.inner.out.send(Message::Close(None));
        self.inner.fail_pending();
    }

    fn is_model_class(&self, class: &str) -> bool {
        matches!(self.inner.hierarchy.domain(class).as_deref(), Ok(DOMAIN_MODEL))
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let request = RpcRequest {
            id,
            method: method.to_string(),
            params,
        };
        let text =
            serde_json::to_string(&request).map_err(|e| EngineError::Protocol(e.to_string()))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.pending.insert(id, reply_tx);
        if self.inner.out.send(Message::Text(text.into())).is_err() {
            self.inner.pending.remove(&id);
            return Err(EngineError::ConnectionClosed);
        }
        match tokio::time::timeout(self.inner.rpc_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::ConnectionClosed),
            Err(_) => {
                self.inner.pending.remove(&id);
                Err(EngineError::Protocol(format!("{method}: request timed out")))
            }
        }
    }
}

impl ClientInner {
    fn new(out: mpsc::UnboundedSender<Message>, config: &EngineConfig) -> Self {
        let hierarchy = Arc::new(Hierarchy::with_core_classes());
        Self {
            out,
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            hierarchy: hierarchy.clone(),
            model: Arc::new(MemDb::new(hierarchy)),
            state: parking_lot::Mutex::new(BootState {
                buffering: true,
                buffer: Vec::new(),
                seen: HashSet::new(),
            }),
            pushes: broadcast::channel(config.broadcast_queue.max(1)).0,
            rpc_timeout: Duration::from_millis(config.rpc_timeout_ms),
        }
    }

    /// Drain the bootstrap buffer and go live.
    ///
    /// Buffering stays on until the buffer is observed empty under the
    /// lock: a push racing with the drain either lands in the buffer (and
    /// the next round picks it up in order) or arrives after the flip and
    /// applies directly. Flipping first would let a live push overtake
    /// still-buffered transactions it depends on.
    async fn finish_bootstrap(&self) -> usize {
        let mut replayed = 0;
        loop {
            let batch = {
                let mut state = self.state.lock();
                if state.buffer.is_empty() {
                    state.buffering = false;
                    // The dedupe set only disambiguates replay against
                    // concurrent pushes; it has no steady-state job.
                    state.seen.clear();
                    break;
                }
                std::mem::take(&mut state.buffer)
            };
            replayed += batch.len();
            for tx in batch {
                self.apply_and_publish(tx).await;
            }
        }
        replayed
    }

    async fn route(&self, text: &str) {
        let response: RpcResponse = match serde_json::from_str(text) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "unparseable frame");
                return;
            }
        };
        match response.id {
            Some(id) => {
                let Some((_, reply)) = self.pending.remove(&id) else {
                    debug!(id, "response for unknown request");
                    return;
                };
                let outcome = match response.error {
                    Some(err) => Err(err.into_engine()),
                    None => Ok(response.result.unwrap_or(Value::Null)),
                };
                let _ = reply.send(outcome);
            }
            None => {
                let Some(result) = response.result else { return };
                let tx: Tx = match serde_json::from_value(result) {
                    Ok(tx) => tx,
                    Err(e) => {
                        warn!(error = %e, "unparseable push");
                        return;
                    }
                };
                let buffered = {
                    let mut state = self.state.lock();
                    if state.buffering {
                        state.buffer.push(tx.clone());
                        true
                    } else {
                        false
                    }
                };
                if !buffered {
                    self.apply_and_publish(tx).await;
                }
            }
        }
    }

    /// Fold a transaction into the local projection; during bootstrap,
    /// at most once per transaction id.
    async fn apply(&self, tx: &Tx) {
        {
            let mut state = self.state.lock();
            if state.buffering && !state.seen.insert(tx.id().to_string()) {
                return;
            }
        }
        let is_class_doc = self.hierarchy.is_derived(tx.object_class(), CLASS_CLASS);
        if is_class_doc {
            if let Tx::CreateDoc(create) = tx {
                self.hierarchy.record_class_doc(&create.to_doc());
            }
        }
        let model_domain = matches!(
            self.hierarchy.domain(tx.object_class()).as_deref(),
            Ok(DOMAIN_MODEL)
        );
        if model_domain {
            if let Err(err) = self.model.tx(tx).await {
                warn!(error = %err, object = %tx.object_id(), "local model apply failed");
            }
            // A class update carries only a delta; re-read the settled doc.
            if is_class_doc && matches!(tx, Tx::UpdateDoc(_)) {
                if let Some(doc) = self.model.get(tx.object_id()) {
                    self.hierarchy.record_class_doc(&doc);
                }
            }
        }
    }

    async fn apply_and_publish(&self, tx: Tx) {
        self.apply(&tx).await;
        let _ = self.pushes.send(tx);
    }

    /// Resolve every in-flight request with an explicit error status
    /// instead of leaving its caller hanging.
    fn fail_pending(&self) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, reply)) = self.pending.remove(&id) {
                let _ = reply.send(Err(EngineError::Unknown("connection closed".into())));
            }
        }
    }
}
