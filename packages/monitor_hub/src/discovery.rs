//! Watched set of currently detected ports.
//!
//! Discovery itself happens outside the bridge; whoever runs it pushes the
//! current snapshot here. The acquisition layer only asks whether a port is
//! present before it bothers the provider.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::watch;
use tracing::debug;

use crate::port::PortIdentifier;

/// Detection metadata reported for a port.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMetadata {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub board_name: Option<String>,
    #[serde(default)]
    pub fqbn: Option<String>,
}

/// A detected port as reported by the discovery source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedPort {
    pub port: PortIdentifier,
    #[serde(flatten)]
    pub metadata: PortMetadata,
}

pub trait PortDiscovery: Send + Sync {
    fn is_detected(&self, port: &PortIdentifier) -> bool;
}

pub type PortSnapshot = HashMap<String, PortMetadata>;

pub struct DiscoveryWatcher {
    ports: watch::Sender<PortSnapshot>,
    enforce: bool,
}

impl DiscoveryWatcher {
    /// With `enforce = false` every port counts as detected.
    pub fn new(enforce: bool) -> Self {
        let (ports, _) = watch::channel(HashMap::new());
        Self { ports, enforce }
    }

    /// Replace the whole snapshot.
    pub fn replace(&self, detected: Vec<DetectedPort>) {
        let snapshot: PortSnapshot = detected
            .into_iter()
            .map(|d| (d.port.key(), d.metadata))
            .collect();
        debug!("Discovery snapshot replaced: {} port(s)", snapshot.len());
        self.ports.send_replace(snapshot);
    }

    pub fn insert(&self, port: &PortIdentifier, metadata: PortMetadata) {
        self.ports.send_modify(|ports| {
            ports.insert(port.key(), metadata);
        });
    }

    pub fn remove(&self, port: &PortIdentifier) {
        self.ports.send_modify(|ports| {
            ports.remove(&port.key());
        });
    }

    pub fn snapshot(&self) -> PortSnapshot {
        self.ports.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PortSnapshot> {
        self.ports.subscribe()
    }
}

impl Default for DiscoveryWatcher {
    fn default() -> Self {
        Self::new(false)
    }
}

impl PortDiscovery for DiscoveryWatcher {
    fn is_detected(&self, port: &PortIdentifier) -> bool {
        !self.enforce || self.ports.borrow().contains_key(&port.key())
    }
}
