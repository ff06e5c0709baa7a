//! Per-transport delivery of session output.
//!
//! The hub never queues on behalf of a subscriber: it hands each chunk to the
//! subscriber's sink and moves on. A sink that cannot keep up drops data
//! rather than stall the other subscribers of the session.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Session status as seen by a subscriber.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Paused,
    Stopped { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkMessage {
    Data(Arc<[u8]>),
    Status(SessionStatus),
}

/// Receives everything a subscription should see. Must not block.
pub trait MonitorSink: Send + Sync {
    fn deliver(&self, message: SinkMessage);
}

/// Sink backed by a bounded channel, drained by the owning transport task.
pub struct ChannelSink {
    tx: mpsc::Sender<SinkMessage>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<SinkMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Arc::new(Self {
                tx,
                dropped: AtomicU64::new(0),
            }),
            rx,
        )
    }

    /// Messages discarded because the receiver fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl MonitorSink for ChannelSink {
    fn deliver(&self, message: SinkMessage) {
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                // Log on powers of two so a stuck reader doesn't flood the log
                if dropped.is_power_of_two() {
                    warn!("Subscriber lagging, {} message(s) dropped so far", dropped);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Subscriber channel closed, dropping message");
            }
        }
    }
}
