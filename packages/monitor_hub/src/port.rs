//! Port identity and monitor configuration keys.
//!
//! A [`PortIdentifier`] names physical hardware (`protocol` + `address`) and
//! stays stable across configuration changes. A [`MonitorKey`] names one
//! configuration of that port: the port plus an optional baud rate and a hash
//! of the remaining monitor options.
//!
//! The canonical string form is only used at transport boundaries:
//!
//! ```text
//! serial://COM3@9600#h1
//! ^^^^^^   ^^^^ ^^^^ ^^
//! protocol addr baud options hash
//! ```
//!
//! The protocol prefix defaults to `serial`, the baud rate is optional, and a
//! missing hash means "no extra options".

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::MonitorError;

/// Protocol assumed when a key carries no `protocol://` prefix.
pub const DEFAULT_PROTOCOL: &str = "serial";

/// Number of hex characters kept from the options digest.
const OPTIONS_HASH_LEN: usize = 8;

/// Physical port: stable across configuration changes.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PortIdentifier {
    pub protocol: String,
    pub address: String,
}

impl PortIdentifier {
    pub fn new(protocol: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            address: address.into(),
        }
    }

    /// Parse `protocol://address` (or a bare address). Any `@baud#hash`
    /// suffix is accepted and ignored, so a full monitor key also names its port.
    pub fn parse(raw: &str) -> Result<Self, MonitorError> {
        MonitorKey::parse(raw).map(|key| key.port)
    }

    /// Key used by the discovery watcher.
    pub fn key(&self) -> String {
        format!("{}://{}", self.protocol, self.address)
    }
}

impl fmt::Display for PortIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.address)
    }
}

/// Hash a monitor option set into the short form carried by [`MonitorKey`].
///
/// Options are hashed in key order, so two maps with equal contents always
/// produce the same hash.
pub fn options_hash(options: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (name, value) in options {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    hasher
        .finalize()
        .iter()
        .take(OPTIONS_HASH_LEN / 2)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// One configuration of a port.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct MonitorKey {
    pub port: PortIdentifier,
    pub baudrate: Option<u32>,
    pub options_hash: String,
}

impl MonitorKey {
    pub fn new(port: PortIdentifier, baudrate: Option<u32>, options_hash: impl Into<String>) -> Self {
        Self {
            port,
            baudrate,
            options_hash: options_hash.into(),
        }
    }

    /// Build a key whose hash is derived from a full option set.
    pub fn with_options(
        port: PortIdentifier,
        baudrate: Option<u32>,
        options: &BTreeMap<String, String>,
    ) -> Self {
        Self::new(port, baudrate, options_hash(options))
    }

    /// Parse the canonical `protocol://address@baud#hash` form.
    pub fn parse(raw: &str) -> Result<Self, MonitorError> {
        let invalid = |reason: &str| MonitorError::InvalidPortKey(format!("{raw:?}: {reason}"));

        let raw_trimmed = raw.trim();
        if raw_trimmed.is_empty() {
            return Err(invalid("empty key"));
        }

        let (protocol, rest) = match raw_trimmed.split_once("://") {
            Some((protocol, rest)) => (protocol, rest),
            None => (DEFAULT_PROTOCOL, raw_trimmed),
        };
        if protocol.is_empty()
            || !protocol
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid("bad protocol"));
        }

        let (rest, hash) = match rest.rsplit_once('#') {
            Some((_, "")) => return Err(invalid("empty options hash")),
            Some((rest, hash)) => (rest, hash.to_string()),
            None => (rest, options_hash(&BTreeMap::new())),
        };

        // Network addresses may carry '@'; only a numeric suffix is a baud rate
        let (address, baudrate) = match rest.rsplit_once('@') {
            Some((address, baud)) if !baud.is_empty() && baud.bytes().all(|b| b.is_ascii_digit()) => {
                let baud: u32 = baud.parse().map_err(|_| invalid("bad baud rate"))?;
                if baud == 0 {
                    return Err(invalid("baud rate must be positive"));
                }
                (address, Some(baud))
            }
            _ => (rest, None),
        };

        if address.trim().is_empty() {
            return Err(invalid("empty address"));
        }

        Ok(Self {
            port: PortIdentifier::new(protocol, address),
            baudrate,
            options_hash: hash,
        })
    }

    /// Same port, different baud rate, same options.
    pub fn with_baudrate(&self, baudrate: u32) -> Self {
        Self {
            port: self.port.clone(),
            baudrate: Some(baudrate),
            options_hash: self.options_hash.clone(),
        }
    }
}

impl fmt::Display for MonitorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.port)?;
        if let Some(baud) = self.baudrate {
            write!(f, "@{}", baud)?;
        }
        write!(f, "#{}", self.options_hash)
    }
}
