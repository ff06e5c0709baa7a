//! Monitor Hub - session multiplexer for device monitors
//!
//! One upstream provider can keep only one stream open per physical port.
//! This crate sits in front of it and shares that stream between any number
//! of clients: it enforces one active configuration per port, replays recent
//! output to late joiners, parks sessions while another task borrows the
//! hardware, and tracks client liveness so the host process knows when it
//! has gone idle. It has no HTTP dependencies; transports live elsewhere.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use monitor_hub::{
//!     ChannelSink, ClientId, DiscoveryWatcher, HubConfig, MonitorAcquirer, MonitorError,
//!     MonitorHub, MonitorKey, MonitorProvider, OpenRequest, SinkMessage,
//! };
//!
//! async fn tail(provider: Arc<dyn MonitorProvider>) -> Result<(), MonitorError> {
//!     let acquirer = MonitorAcquirer::new(
//!         provider,
//!         Arc::new(DiscoveryWatcher::default()),
//!         Duration::from_millis(500),
//!     );
//!     let hub = MonitorHub::new(acquirer, HubConfig::default());
//!
//!     let key = MonitorKey::parse("serial:///dev/ttyACM0@115200")?;
//!     let id = hub.open(OpenRequest::new(key, ClientId::new("cli"))).await?;
//!
//!     // Replay up to 4 KiB of history, then follow live output
//!     let (sink, mut rx) = ChannelSink::new(256);
//!     hub.subscribe(id, 4096, sink).await?;
//!     while let Some(SinkMessage::Data(bytes)) = rx.recv().await {
//!         print!("{}", String::from_utf8_lossy(&bytes));
//!     }
//!
//!     hub.close(id).await
//! }
//! ```

pub mod acquisition;
pub mod attachment;
pub mod control;
pub mod discovery;
mod error;
mod hub;
pub mod port;
pub mod protocol;
pub mod provider;
pub mod ring_buffer;
pub mod sink;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use acquisition::{DEFAULT_PRIMING_TIMEOUT, MonitorAcquirer, MonitorLink};
pub use attachment::{AttachmentEvent, AttachmentInfo, AttachmentRegistry, IdleCallback, RegistryConfig};
pub use control::{ControlHandler, ControlPeer, ControlSession};
pub use discovery::{DetectedPort, DiscoveryWatcher, PortDiscovery, PortMetadata};
pub use error::{ErrorBody, MonitorError};
pub use hub::{
    ClientId, HubConfig, HubEvent, MonitorHub, OpenMode, OpenRequest, ReaderId,
    SessionSnapshot, SessionState, SubscriptionId,
};
pub use port::{MonitorKey, PortIdentifier};
pub use protocol::{Notification, OutboundMessage, RpcRequest, RpcResponse};
pub use provider::{
    MessageStream, MonitorProvider, ProtocolSettings, ProviderError, UpstreamConfig,
    UpstreamControl, UpstreamStream,
};
pub use ring_buffer::RingBuffer;
pub use sink::{ChannelSink, MonitorSink, SessionStatus, SinkMessage};
