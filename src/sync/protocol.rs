// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire envelope for the sync protocol.
//!
//! JSON over WebSocket. Clients send requests `{id, method, params}`; the
//! server answers `{id, result}` or `{id, error}`. Transactions committed
//! by other clients arrive as pushes: the same response envelope with no
//! `id` and the transaction as `result`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::EngineError;
use crate::query::{SortOrder, SortSpec};
use crate::storage::traits::FindOptions;
use crate::tx::Tx;

pub const METHOD_TX: &str = "tx";
pub const METHOD_FIND_ALL: &str = "findAll";
pub const METHOD_LOAD_MODEL: &str = "loadModel";

/// First client frame: which workspace this connection belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hello {
    pub workspace: String,
}

/// One client request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Server response or push.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    /// Absent on server pushes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// Structured error status carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub severity: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl RpcResponse {
    #[must_use]
    pub fn result(id: u64, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    #[must_use]
    pub fn error(id: u64, err: &EngineError) -> Self {
        Self {
            id: Some(id),
            result: None,
            error: Some(RpcError::from_engine(err)),
        }
    }

    /// Push envelope for one committed transaction.
    #[must_use]
    pub fn push(tx: &Tx) -> Self {
        Self {
            id: None,
            result: serde_json::to_value(tx).ok(),
            error: None,
        }
    }

    #[must_use]
    pub fn is_push(&self) -> bool {
        self.id.is_none()
    }
}

impl RpcError {
    #[must_use]
    pub fn from_engine(err: &EngineError) -> Self {
        Self {
            severity: "error".into(),
            code: err.code().into(),
            params: json!({ "message": err.to_string() }),
        }
    }

    /// Status for requests stranded by a closed connection.
    #[must_use]
    pub fn connection_closed() -> Self {
        Self::from_engine(&EngineError::ConnectionClosed)
    }

    #[must_use]
    pub fn into_engine(self) -> EngineError {
        let message = self
            .params
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or(&self.code)
            .to_string();
        EngineError::Protocol(format!("{}: {message}", self.code))
    }
}

/// Parameters of the `findAll` method.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FindParams {
    pub class: String,
    #[serde(default)]
    pub query: crate::query::QueryMap,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl FindParams {
    /// Decode the wire sort/limit into storage options.
    #[must_use]
    pub fn options(&self) -> Option<FindOptions> {
        if self.sort.is_empty() && self.limit.is_none() {
            return None;
        }
        let sort: SortSpec = self
            .sort
            .iter()
            .map(|(field, dir)| {
                let order = if dir.eq_ignore_ascii_case("desc") {
                    SortOrder::Desc
                } else {
                    SortOrder::Asc
                };
                (field.clone(), order)
            })
            .collect();
        Some(FindOptions {
            sort,
            limit: self.limit,
        })
    }

    #[must_use]
    pub fn from_options(class: &str, query: crate::query::QueryMap, options: Option<FindOptions>) -> Self {
        let (sort, limit) = match options {
            Some(options) => (
                options
                    .sort
                    .into_iter()
                    .map(|(field, order)| {
                        let dir = match order {
                            SortOrder::Asc => "asc",
                            SortOrder::Desc => "desc",
                        };
                        (field, dir.to_string())
                    })
                    .collect(),
                options.limit,
            ),
            None => (Vec::new(), None),
        };
        Self {
            class: class.to_string(),
            query,
            sort,
            limit,
        }
    }
}
