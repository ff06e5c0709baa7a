//! Wire types for the JSON-RPC style control channel.
//!
//! Requests are `{id, method, params}`. Every request gets exactly one
//! response, `{id, result}` or `{id, error}`. The server also pushes
//! `{method, params}` notifications that carry no id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorBody;
use crate::hub::{OpenMode, SubscriptionId};

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl RpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, error: ErrorBody) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Anything the server sends on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Response(RpcResponse),
    Notification(Notification),
}

pub mod methods {
    pub const DATA: &str = "monitor/data";
    pub const STATUS: &str = "monitor/status";
    pub const STARTED: &str = "monitor/started";
    pub const STOPPED: &str = "monitor/stopped";
    pub const PAUSED: &str = "monitor/paused";
    pub const RESUMED: &str = "monitor/resumed";
    pub const BAUDRATE_CHANGED: &str = "monitor/baudrateChanged";
    pub const ATTACHED: &str = "attachment/attached";
    pub const DETACHED: &str = "attachment/detached";
    pub const IDLE: &str = "attachment/idle";
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenParams {
    /// Canonical monitor key, e.g. `serial://COM3@9600#h1`.
    pub port: String,
    #[serde(default)]
    pub mode: OpenMode,
    #[serde(default)]
    pub fqbn: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeParams {
    pub subscription_id: SubscriptionId,
    #[serde(default)]
    pub tail_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionParams {
    pub subscription_id: SubscriptionId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteParams {
    pub subscription_id: SubscriptionId,
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortParams {
    pub port: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaudrateParams {
    pub subscription_id: SubscriptionId,
    pub baudrate: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachParams {
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenParams {
    pub token: String,
}

#[derive(Debug, Clone)]
pub enum ControlRequest {
    Open(OpenParams),
    Subscribe(SubscribeParams),
    Unsubscribe(SubscriptionParams),
    Write(WriteParams),
    Close(SubscriptionParams),
    Pause(PortParams),
    Resume(PortParams),
    UpdateBaudrate(BaudrateParams),
    Attach(AttachParams),
    Heartbeat(TokenParams),
    Detach(TokenParams),
    ListSessions,
}

/// Malformed envelope, unknown method or bad params.
pub fn invalid_request(message: impl Into<String>) -> ErrorBody {
    ErrorBody {
        code: "invalid-request".into(),
        status: 400,
        message: message.into(),
        details: None,
    }
}

impl ControlRequest {
    pub fn parse(method: &str, params: Value) -> Result<Self, ErrorBody> {
        // Absent params read as an empty object
        let params = match params {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };

        fn decode<T: serde::de::DeserializeOwned>(method: &str, params: Value) -> Result<T, ErrorBody> {
            serde_json::from_value(params)
                .map_err(|e| invalid_request(format!("bad params for {method}: {e}")))
        }

        Ok(match method {
            "open" => Self::Open(decode(method, params)?),
            "subscribe" => Self::Subscribe(decode(method, params)?),
            "unsubscribe" => Self::Unsubscribe(decode(method, params)?),
            "write" => Self::Write(decode(method, params)?),
            "close" => Self::Close(decode(method, params)?),
            "pause" => Self::Pause(decode(method, params)?),
            "resume" => Self::Resume(decode(method, params)?),
            "updateBaudrate" => Self::UpdateBaudrate(decode(method, params)?),
            "attach" => Self::Attach(decode(method, params)?),
            "heartbeat" => Self::Heartbeat(decode(method, params)?),
            "detach" => Self::Detach(decode(method, params)?),
            "listSessions" => Self::ListSessions,
            other => return Err(invalid_request(format!("unknown method: {other}"))),
        })
    }
}
