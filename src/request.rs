//! Requests, responses and the request-table entry.
//!
//! Every outgoing request gets a locally assigned id that is unique for the
//! client's lifetime; the server echoes it on the response. The table entry
//! holds a `FnOnce` continuation, so each request observes exactly one
//! outcome: response, timeout, or disconnect.

use std::time::Instant;

use serde_json::{Map, Value};

use crate::client::ClientState;
use crate::engine_result::EngineResult;
use crate::task_loop::LoopHandle;
use crate::wire;

pub type RequestId = u64;

/// An outgoing request under construction.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub command: String,
    payload: Map<String, Value>,
}

impl Request {
    pub(crate) fn new(id: RequestId, command: &str) -> Self {
        Request {
            id,
            command: command.to_owned(),
            payload: Map::new(),
        }
    }

    /// Sets one payload field, replacing any previous value.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.payload.insert(key.to_owned(), value.into());
        self
    }

    pub fn merge(&mut self, fields: Map<String, Value>) -> &mut Self {
        self.payload.extend(fields);
        self
    }

    /// The full wire object; `id` and `command` lead, payload order is
    /// preserved.
    pub fn to_wire(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("id".to_owned(), Value::from(self.id));
        obj.insert("command".to_owned(), Value::from(self.command.clone()));
        obj.extend(self.payload.clone());
        Value::Object(obj)
    }
}

/// RPC-level error codes the client branches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    NoNetwork,
    EntryNotFound,
    NoCurrent,
    NoClosed,
    TooBusy,
    SlowDown,
    Unknown(String),
}

impl RpcError {
    pub fn from_code(code: &str) -> RpcError {
        match code {
            "noNetwork" => RpcError::NoNetwork,
            "entryNotFound" => RpcError::EntryNotFound,
            "noCurrent" => RpcError::NoCurrent,
            "noClosed" => RpcError::NoClosed,
            "tooBusy" => RpcError::TooBusy,
            "slowDown" => RpcError::SlowDown,
            other => RpcError::Unknown(other.to_owned()),
        }
    }
}

/// A parsed response message.
#[derive(Debug, Clone)]
pub struct Response {
    pub id: RequestId,
    /// `status == "success"`.
    pub succeeded: bool,
    /// The `result` object (empty for error responses that omit it).
    pub result: Value,
    pub error: Option<RpcError>,
    pub error_message: Option<String>,
    pub raw: Value,
}

impl Response {
    pub(crate) fn from_wire(msg: &Value) -> Option<Response> {
        let id = wire::get_u64(msg, "id")?;
        let succeeded = msg.get("status").and_then(Value::as_str) == Some("success");
        Some(Response {
            id,
            succeeded,
            result: msg.get("result").cloned().unwrap_or(Value::Null),
            error: msg
                .get("error")
                .and_then(Value::as_str)
                .map(RpcError::from_code),
            error_message: msg
                .get("error_message")
                .and_then(Value::as_str)
                .map(str::to_owned),
            raw: msg.clone(),
        })
    }

    /// The provisional engine result of a `submit` response.
    pub fn engine_result(&self) -> Option<EngineResult> {
        self.result
            .get("engine_result")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }

    /// The sequence the submitted transaction carried, echoed in `tx_json`.
    pub fn submit_sequence(&self) -> Option<u32> {
        self.result.get("tx_json").and_then(|t| wire::get_u32(t, "Sequence"))
    }
}

/// How a request concluded, exactly one per table entry.
#[derive(Debug)]
pub enum RequestOutcome {
    Response(Response),
    Timeout,
    /// The connection carrying the request dropped; only delivered to
    /// entries that opted in (managed requests).
    Disconnected,
}

pub(crate) type RequestCallback =
    Box<dyn FnOnce(&mut ClientState, &LoopHandle<ClientState>, RequestOutcome) + Send>;

/// A live request-table entry.
pub(crate) struct PendingRequest {
    pub command: String,
    pub wire: Value,
    /// None until actually written to the transport; unsent entries are
    /// exempt from the timeout sweep.
    pub sent_at: Option<Instant>,
    /// Connection generation the request is bound to.
    pub affinity: Option<u64>,
    /// Deliver `RequestOutcome::Disconnected` when the connection drops.
    pub retry_on_disconnect: bool,
    pub callback: RequestCallback,
}
