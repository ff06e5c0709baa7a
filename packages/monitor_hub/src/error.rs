//! Error taxonomy for the bridge, with wire codes and HTTP-like statuses.

use serde::{Deserialize, Serialize};

use crate::port::MonitorKey;

/// Every failure the hub surfaces to a caller. All of them are local and
/// recoverable: none is fatal to the bridge process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    #[error("invalid port key: {0}")]
    InvalidPortKey(String),

    #[error("port not detected: {0}")]
    PortNotDetected(String),

    #[error("port busy: {0}")]
    PortBusy(String),

    #[error("port in use with a different configuration (active: {active}, requested: {requested})")]
    PortInUseDifferentConfig {
        active: MonitorKey,
        requested: MonitorKey,
    },

    #[error("port {0} is held exclusively by another client")]
    PortInUseExclusive(String),

    #[error("failed to open monitor: {0}")]
    MonitorOpenFailed(String),

    #[error("monitor not found: {0}")]
    MonitorNotFound(String),

    #[error("monitor not subscribed: {0}")]
    MonitorNotSubscribed(String),

    #[error("protocol {0} requires a baud rate")]
    BaudrateRequired(String),

    #[error("settings unavailable for protocol {protocol}: {reason}")]
    SettingsUnavailable { protocol: String, reason: String },

    #[error("unknown attachment token: {0}")]
    UnknownToken(String),
}

impl MonitorError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPortKey(_) => "invalid-port-key",
            Self::PortNotDetected(_) => "port-not-detected",
            Self::PortBusy(_) => "port-busy",
            Self::PortInUseDifferentConfig { .. } => "PORT_IN_USE_DIFFERENT_CONFIG",
            Self::PortInUseExclusive(_) => "PORT_IN_USE_EXCLUSIVE",
            Self::MonitorOpenFailed(_) => "monitor-open-failed",
            Self::MonitorNotFound(_) => "monitor-not-found",
            Self::MonitorNotSubscribed(_) => "monitor-not-subscribed",
            Self::BaudrateRequired(_) => "baudrate-required",
            Self::SettingsUnavailable { .. } => "settings-unavailable",
            Self::UnknownToken(_) => "unknown-token",
        }
    }

    /// HTTP-like status used when mapping onto a transport.
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidPortKey(_) | Self::BaudrateRequired(_) => 400,
            Self::PortNotDetected(_) | Self::MonitorNotFound(_) | Self::UnknownToken(_) => 404,
            Self::PortInUseDifferentConfig { .. }
            | Self::PortInUseExclusive(_)
            | Self::MonitorNotSubscribed(_) => 409,
            Self::PortBusy(_) => 423,
            Self::MonitorOpenFailed(_) => 502,
            Self::SettingsUnavailable { .. } => 503,
        }
    }

    /// Structured payload for errors the caller is expected to act on.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::PortInUseDifferentConfig { active, requested } => Some(serde_json::json!({
                "port": active.port.to_string(),
                "active": active.to_string(),
                "requested": requested.to_string(),
            })),
            Self::SettingsUnavailable { protocol, .. } | Self::BaudrateRequired(protocol) => {
                Some(serde_json::json!({ "protocol": protocol }))
            }
            _ => None,
        }
    }
}

/// Serializable error response for the control channel or HTTP.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub code: String,
    pub status: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&MonitorError> for ErrorBody {
    fn from(err: &MonitorError) -> Self {
        Self {
            code: err.code().to_string(),
            status: err.status(),
            message: err.to_string(),
            details: err.details(),
        }
    }
}
