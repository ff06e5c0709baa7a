use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use monitor_hub::{HubConfig, RegistryConfig};

use crate::provider::CommandProviderConfig;

// =============================================================================
// File config (figment-deserialized from defaults / bridge.toml / env vars)
// =============================================================================
//
//   bridge.toml:     [attachments]
//                    idle_timeout_ms = 60000
//
//   env var:         BRIDGE_ATTACHMENTS__IDLE_TIMEOUT_MS=60000   (double underscore = nesting)

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub hub: HubFileConfig,
    #[serde(default)]
    pub attachments: AttachmentFileConfig,
    #[serde(default)]
    pub provider: ProviderFileConfig,
    #[serde(default)]
    pub discovery: DiscoveryFileConfig,
}

/// Listener settings (`[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// 0 picks a free port.
    #[serde(default)]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
        }
    }
}

/// Session tuning (`[hub]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HubFileConfig {
    #[serde(default = "default_ring_buffer_bytes")]
    pub ring_buffer_bytes: usize,
    #[serde(default = "default_priming_timeout_ms")]
    pub priming_timeout_ms: u64,
    /// 0 keeps paused sessions forever.
    #[serde(default)]
    pub max_pause_secs: u64,
    /// Per-connection backlog before output is dropped.
    #[serde(default = "default_sink_capacity")]
    pub sink_capacity: usize,
}

impl Default for HubFileConfig {
    fn default() -> Self {
        Self {
            ring_buffer_bytes: default_ring_buffer_bytes(),
            priming_timeout_ms: default_priming_timeout_ms(),
            max_pause_secs: 0,
            sink_capacity: default_sink_capacity(),
        }
    }
}

/// Client liveness (`[attachments]`). Zero disables a timer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttachmentFileConfig {
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_heartbeat_sweep_ms")]
    pub heartbeat_sweep_ms: u64,
}

impl Default for AttachmentFileConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            heartbeat_sweep_ms: default_heartbeat_sweep_ms(),
        }
    }
}

/// Upstream monitor command (`[provider]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderFileConfig {
    /// Program and arguments. `{address}`, `{protocol}`, `{baudrate}` and
    /// `{fqbn}` are substituted per acquisition.
    #[serde(default = "default_command")]
    pub command: Vec<String>,
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    /// Protocols that cannot be opened without a baud rate.
    #[serde(default = "default_baudrate_protocols")]
    pub baudrate_protocols: Vec<String>,
}

impl Default for ProviderFileConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            startup_grace_ms: default_startup_grace_ms(),
            baudrate_protocols: default_baudrate_protocols(),
        }
    }
}

/// Port presence checks (`[discovery]`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DiscoveryFileConfig {
    /// When false every port counts as detected.
    #[serde(default)]
    pub enforce: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_ring_buffer_bytes() -> usize {
    64 * 1024
}
fn default_priming_timeout_ms() -> u64 {
    500
}
fn default_sink_capacity() -> usize {
    256
}
fn default_idle_timeout_ms() -> u64 {
    30_000
}
fn default_heartbeat_timeout_ms() -> u64 {
    15_000
}
fn default_heartbeat_sweep_ms() -> u64 {
    5_000
}
fn default_startup_grace_ms() -> u64 {
    250
}
fn default_baudrate_protocols() -> Vec<String> {
    vec!["serial".to_string()]
}
fn default_command() -> Vec<String> {
    [
        "arduino-cli",
        "monitor",
        "--raw",
        "-p",
        "{address}",
        "--protocol",
        "{protocol}",
        "--config",
        "baudrate={baudrate}",
        "--fqbn",
        "{fqbn}",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Build a figment that layers: defaults → bridge.toml → BRIDGE_* env vars.
///
///   `BRIDGE_HUB__MAX_PAUSE_SECS=120`  →  `hub.max_pause_secs = 120`
pub fn load_config(config_file: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_file))
        .merge(Env::prefixed("BRIDGE_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub listen: SocketAddr,
    pub hub: HubConfig,
    pub priming_timeout: Duration,
    pub sink_capacity: usize,
    pub attachments: RegistryConfig,
    pub provider: CommandProviderConfig,
    pub enforce_discovery: bool,
}

impl BridgeConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self> {
        let listen = format!("{}:{}", fc.server.host, fc.server.port)
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid listen address {}:{}", fc.server.host, fc.server.port))?;

        let max_pause = if fc.hub.max_pause_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(fc.hub.max_pause_secs))
        };

        Ok(Self {
            listen,
            hub: HubConfig {
                ring_buffer_bytes: fc.hub.ring_buffer_bytes,
                max_pause,
                ..HubConfig::default()
            },
            priming_timeout: Duration::from_millis(fc.hub.priming_timeout_ms),
            sink_capacity: fc.hub.sink_capacity.max(1),
            attachments: RegistryConfig {
                idle_timeout: Duration::from_millis(fc.attachments.idle_timeout_ms),
                heartbeat_timeout: Duration::from_millis(fc.attachments.heartbeat_timeout_ms),
                heartbeat_sweep: Duration::from_millis(fc.attachments.heartbeat_sweep_ms),
            },
            provider: CommandProviderConfig {
                command: fc.provider.command.clone(),
                startup_grace: Duration::from_millis(fc.provider.startup_grace_ms),
                baudrate_protocols: fc.provider.baudrate_protocols.clone(),
            },
            enforce_discovery: fc.discovery.enforce,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_file_config_defaults() {
        let fc = FileConfig::default();
        assert_eq!(fc.server.host, "127.0.0.1");
        assert_eq!(fc.server.port, 0);
        assert_eq!(fc.hub.ring_buffer_bytes, 64 * 1024);
        assert_eq!(fc.hub.max_pause_secs, 0);
        assert_eq!(fc.attachments.idle_timeout_ms, 30_000);
        assert_eq!(fc.provider.command[0], "arduino-cli");
        assert_eq!(fc.provider.baudrate_protocols, vec!["serial".to_string()]);
        assert!(!fc.discovery.enforce);
    }

    // ── BridgeConfig::from_file ─────────────────────────────────────────

    #[test]
    fn test_from_file_defaults() {
        let config = BridgeConfig::from_file(&FileConfig::default()).unwrap();
        assert_eq!(config.listen, "127.0.0.1:0".parse::<SocketAddr>().unwrap());
        assert!(config.hub.max_pause.is_none());
        assert_eq!(config.priming_timeout, Duration::from_millis(500));
        assert_eq!(config.attachments.heartbeat_sweep, Duration::from_secs(5));
        assert_eq!(config.provider.startup_grace, Duration::from_millis(250));
    }

    #[test]
    fn test_from_file_max_pause() {
        let mut fc = FileConfig::default();
        fc.hub.max_pause_secs = 90;
        fc.hub.sink_capacity = 0;
        let config = BridgeConfig::from_file(&fc).unwrap();
        assert_eq!(config.hub.max_pause, Some(Duration::from_secs(90)));
        assert_eq!(config.sink_capacity, 1);
    }

    #[test]
    fn test_from_file_rejects_bad_host() {
        let mut fc = FileConfig::default();
        fc.server.host = "not a host".into();
        assert!(BridgeConfig::from_file(&fc).is_err());
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(&tmp.path().join("bridge.toml"))
            .extract()
            .unwrap();
        assert_eq!(fc.server.host, "127.0.0.1");
        assert_eq!(fc.hub.priming_timeout_ms, 500);
    }

    #[test]
    fn test_load_config_toml_overrides_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bridge.toml");
        std::fs::write(
            &path,
            "[server]\nport = 4100\n\n[attachments]\nidle_timeout_ms = 0\n\n[provider]\ncommand = [\"cat\"]\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(&path).extract().unwrap();
        assert_eq!(fc.server.port, 4100);
        assert_eq!(fc.attachments.idle_timeout_ms, 0);
        assert_eq!(fc.attachments.heartbeat_timeout_ms, 15_000);
        assert_eq!(fc.provider.command, vec!["cat".to_string()]);

        let config = BridgeConfig::from_file(&fc).unwrap();
        assert_eq!(config.attachments.idle_timeout, Duration::ZERO);
    }
}
