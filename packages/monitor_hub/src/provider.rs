//! Boundary to the upstream monitor provider.
//!
//! The provider owns the real device connection. The hub only ever sees an
//! [`UpstreamStream`]: a control half shared behind an `Arc`, an in-order
//! message channel that ends on teardown, and a one-shot readiness signal.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::port::PortIdentifier;

/// Failures reported by the provider. The acquisition layer maps these onto
/// the public [`MonitorError`](crate::MonitorError) taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Hardware is exclusively claimed outside the bridge.
    #[error("port busy: {0}")]
    Busy(String),
    /// The provider cannot find the port.
    #[error("port not found: {0}")]
    NotFound(String),
    /// The stream was torn down underneath us.
    #[error("stream aborted: {0}")]
    Aborted(String),
    #[error("{0}")]
    Other(String),
}

/// Settings forwarded to the provider on acquisition.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub baudrate: Option<u32>,
    pub fqbn: Option<String>,
}

/// What a protocol needs before a monitor can be opened on it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolSettings {
    pub protocol: String,
    pub requires_baudrate: bool,
    #[serde(default)]
    pub default_baudrate: Option<u32>,
    #[serde(default)]
    pub supported_baudrates: Vec<u32>,
}

/// Chunks read from the device, in order. `Err` items are transport aborts;
/// the channel closes when the handle is disposed.
pub type MessageStream = mpsc::Receiver<Result<Vec<u8>, ProviderError>>;

/// A freshly acquired upstream stream.
pub struct UpstreamStream {
    pub control: Arc<dyn UpstreamControl>,
    pub messages: MessageStream,
    /// Resolves once the provider reports the stream usable. A dropped sender
    /// means the provider has no readiness signal to give.
    pub ready: oneshot::Receiver<Result<(), ProviderError>>,
}

/// Control half of an upstream monitor handle.
#[async_trait]
pub trait UpstreamControl: Send + Sync {
    async fn send_message(&self, data: &[u8]) -> Result<usize, ProviderError>;

    async fn update_baudrate(&self, baudrate: u32) -> Result<(), ProviderError>;

    /// Release the hardware while keeping the message channel open.
    async fn pause(&self) -> Result<(), ProviderError>;

    /// Reacquire the hardware; data continues on the same message channel.
    async fn resume(&self) -> Result<(), ProviderError>;

    /// Full teardown. Must be safe to call more than once.
    async fn dispose(&self);

    fn is_paused(&self) -> bool;
}

#[async_trait]
pub trait MonitorProvider: Send + Sync + 'static {
    async fn acquire(
        &self,
        port: &PortIdentifier,
        config: &UpstreamConfig,
    ) -> Result<UpstreamStream, ProviderError>;

    async fn describe_settings(&self, protocol: &str) -> Result<ProtocolSettings, ProviderError>;
}
