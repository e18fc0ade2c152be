use serde::{Deserialize, Serialize};

use crate::constants::JSONRPC_VERSION;
use crate::identity::{PeerId, SessionId, Topic};

/// Opaque negotiation blob produced and consumed by the transport.
///
/// The swarm only ever looks at the optional `"type"` field, to tell offers
/// apart from answers and candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalPayload(pub serde_json::Value);

impl SignalPayload {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Payload with only a negotiation kind, e.g. `{"type": "offer"}`.
    pub fn of_kind(kind: &str) -> Self {
        Self(serde_json::json!({ "type": kind }))
    }

    pub fn empty() -> Self {
        Self(serde_json::Value::Object(Default::default()))
    }

    pub fn kind(&self) -> Option<&str> {
        self.0.get("type").and_then(|v| v.as_str())
    }

    pub fn is_offer(&self) -> bool {
        self.kind() == Some("offer")
    }

    pub fn value(&self) -> &serde_json::Value {
        &self.0
    }
}

impl Default for SignalPayload {
    fn default() -> Self {
        Self::empty()
    }
}

/// Message relayed by the rendezvous server between two peers of a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    pub sender_id: PeerId,
    pub recipient_id: PeerId,
    pub topic: Topic,
    pub session_id: SessionId,
    #[serde(default)]
    pub payload: SignalPayload,
}

/// Reply to an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub accept: bool,
}

impl Answer {
    pub const ACCEPT: Answer = Answer { accept: true };
    pub const REJECT: Answer = Answer { accept: false };
}

/// Methods of the rendezvous RPC surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalMethod {
    Join,
    Leave,
    Lookup,
    Offer,
    Signal,
}

impl SignalMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalMethod::Join => "join",
            SignalMethod::Leave => "leave",
            SignalMethod::Lookup => "lookup",
            SignalMethod::Offer => "offer",
            SignalMethod::Signal => "signal",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "join" => Some(SignalMethod::Join),
            "leave" => Some(SignalMethod::Leave),
            "lookup" => Some(SignalMethod::Lookup),
            "offer" => Some(SignalMethod::Offer),
            "signal" => Some(SignalMethod::Signal),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── RPC params ──

/// Params of `join` and `leave`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipParams {
    pub peer_id: PeerId,
    pub topic: Topic,
}

/// Params of `lookup`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupParams {
    pub topic: Topic,
}

// ── JSON-RPC envelope ──

/// JSON-RPC 2.0 request or notification (no `id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl RpcRequest {
    pub fn new(method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            id: Some(uuid::Uuid::new_v4().to_string()),
            params,
        }
    }

    pub fn notification(method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            id: None,
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: Option<String>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message,
                data: None,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// A line on the wire is either a request/notification or a response.
///
/// Responses carry `result` or `error`; requests carry `method`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcFrame {
    Request(RpcRequest),
    Response(RpcResponse),
}
