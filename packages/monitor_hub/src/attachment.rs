//! Attachment / heartbeat registry.
//!
//! Client processes attach to the bridge and keep their lease alive with
//! heartbeats. The registry prunes leases that go quiet and, once nobody is
//! attached, arms an idle timer whose expiry asks the bridge to shut down.
//!
//! The idle timer is armed exactly when the registry is empty. Each arming
//! carries a generation number; an attach bumps it, so a timer that was
//! already sleeping finds itself stale and does nothing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::MonitorError;
use crate::hub::ClientId;

pub type IdleCallback = Arc<dyn Fn() + Send + Sync>;

/// Zero durations disable the corresponding timer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryConfig {
    pub idle_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub heartbeat_sweep: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(15),
            heartbeat_sweep: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum AttachmentEvent {
    Attached {
        token: String,
        client_id: Option<ClientId>,
    },
    Detached {
        token: String,
        remaining: usize,
        pruned: bool,
    },
    Idle,
}

/// Public view of one attachment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub token: String,
    pub client_id: Option<ClientId>,
    pub attached_at: DateTime<Utc>,
    pub quiet_for_ms: u64,
}

struct ClientAttachment {
    client_id: Option<ClientId>,
    attached_at: DateTime<Utc>,
    last_seen: Instant,
}

impl ClientAttachment {
    fn touch(&mut self, now: Instant) {
        // Never move backwards
        self.last_seen = self.last_seen.max(now);
    }
}

struct RegistryState {
    attachments: HashMap<String, ClientAttachment>,
    config: RegistryConfig,
    on_idle: Option<IdleCallback>,
    idle_timer: Option<JoinHandle<()>>,
    idle_generation: u64,
    sweep: Option<JoinHandle<()>>,
    sweep_generation: u64,
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    events: broadcast::Sender<AttachmentEvent>,
}

#[derive(Clone)]
pub struct AttachmentRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for AttachmentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AttachmentRegistry {
    /// An unconfigured registry: no timers run until [`configure`](Self::configure).
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState {
                    attachments: HashMap::new(),
                    config: RegistryConfig::default(),
                    on_idle: None,
                    idle_timer: None,
                    idle_generation: 0,
                    sweep: None,
                    sweep_generation: 0,
                }),
                events,
            }),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<AttachmentEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: AttachmentEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Apply new thresholds and re-evaluate both timers. Existing attachments
    /// are kept. `on_idle = None` keeps the previous callback.
    pub async fn configure(&self, config: RegistryConfig, on_idle: Option<IdleCallback>) {
        let mut state = self.inner.state.lock().await;
        debug!("Attachment registry configured: {:?}", config);
        state.config = config;
        if on_idle.is_some() {
            state.on_idle = on_idle;
        }

        if state.attachments.is_empty() {
            self.stop_sweep(&mut state);
            self.arm_idle(&mut state);
        } else {
            self.cancel_idle(&mut state);
            self.restart_sweep(&mut state);
        }
    }

    pub async fn attach(&self, client_id: Option<ClientId>) -> String {
        let token = Uuid::new_v4().to_string();
        let mut state = self.inner.state.lock().await;

        state.attachments.insert(
            token.clone(),
            ClientAttachment {
                client_id: client_id.clone(),
                attached_at: Utc::now(),
                last_seen: Instant::now(),
            },
        );
        self.cancel_idle(&mut state);
        if state.sweep.is_none() {
            self.restart_sweep(&mut state);
        }
        info!(
            "Client attached ({} total){}",
            state.attachments.len(),
            client_id
                .as_ref()
                .map(|c| format!(": {c}"))
                .unwrap_or_default()
        );
        drop(state);

        self.emit(AttachmentEvent::Attached {
            token: token.clone(),
            client_id,
        });
        token
    }

    pub async fn heartbeat(&self, token: &str) -> Result<(), MonitorError> {
        let mut state = self.inner.state.lock().await;
        let attachment = state
            .attachments
            .get_mut(token)
            .ok_or_else(|| MonitorError::UnknownToken(token.to_string()))?;
        attachment.touch(Instant::now());
        Ok(())
    }

    /// Remove an attachment. Returns how many remain.
    pub async fn detach(&self, token: &str) -> Result<usize, MonitorError> {
        let mut state = self.inner.state.lock().await;
        if state.attachments.remove(token).is_none() {
            return Err(MonitorError::UnknownToken(token.to_string()));
        }
        let remaining = state.attachments.len();
        info!("Client detached ({} remaining)", remaining);
        if remaining == 0 {
            self.stop_sweep(&mut state);
            self.arm_idle(&mut state);
        }
        drop(state);

        self.emit(AttachmentEvent::Detached {
            token: token.to_string(),
            remaining,
            pruned: false,
        });
        Ok(remaining)
    }

    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.attachments.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn idle_armed(&self) -> bool {
        self.inner.state.lock().await.idle_timer.is_some()
    }

    pub async fn attachments(&self) -> Vec<AttachmentInfo> {
        let state = self.inner.state.lock().await;
        let now = Instant::now();
        let mut list: Vec<_> = state
            .attachments
            .iter()
            .map(|(token, a)| AttachmentInfo {
                token: token.clone(),
                client_id: a.client_id.clone(),
                attached_at: a.attached_at,
                quiet_for_ms: now.saturating_duration_since(a.last_seen).as_millis() as u64,
            })
            .collect();
        list.sort_by(|a, b| a.attached_at.cmp(&b.attached_at));
        list
    }

    /// Stop both timers.
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        self.cancel_idle(&mut state);
        self.stop_sweep(&mut state);
    }

    fn cancel_idle(&self, state: &mut RegistryState) {
        state.idle_generation += 1;
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
            debug!("Idle timer cancelled");
        }
    }

    fn arm_idle(&self, state: &mut RegistryState) {
        self.cancel_idle(state);
        let timeout = state.config.idle_timeout;
        if timeout.is_zero() {
            return;
        }

        let generation = state.idle_generation;
        let registry = self.clone();
        state.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            registry.idle_expired(generation).await;
        }));
        debug!("Idle timer armed for {:?}", timeout);
    }

    async fn idle_expired(&self, generation: u64) {
        let callback = {
            let mut state = self.inner.state.lock().await;
            if state.idle_generation != generation || !state.attachments.is_empty() {
                return;
            }
            // We are the timer; dropping the handle detaches rather than aborts
            state.idle_timer = None;
            state.on_idle.clone()
        };

        info!("No clients attached, bridge is idle");
        self.emit(AttachmentEvent::Idle);
        if let Some(callback) = callback {
            callback();
        }
    }

    fn stop_sweep(&self, state: &mut RegistryState) {
        state.sweep_generation += 1;
        if let Some(sweep) = state.sweep.take() {
            sweep.abort();
        }
    }

    fn restart_sweep(&self, state: &mut RegistryState) {
        self.stop_sweep(state);
        let timeout = state.config.heartbeat_timeout;
        if timeout.is_zero() {
            return;
        }
        let period = if state.config.heartbeat_sweep.is_zero() {
            timeout
        } else {
            state.config.heartbeat_sweep
        };

        let generation = state.sweep_generation;
        let registry = self.clone();
        state.sweep = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if !registry.sweep_once(generation).await {
                    return;
                }
            }
        }));
    }

    /// One prune pass. Returns false once the sweep should stop.
    async fn sweep_once(&self, generation: u64) -> bool {
        let (pruned, remaining) = {
            let mut state = self.inner.state.lock().await;
            if state.sweep_generation != generation {
                return false;
            }

            let now = Instant::now();
            let timeout = state.config.heartbeat_timeout;
            let stale: Vec<String> = state
                .attachments
                .iter()
                .filter(|(_, a)| now.saturating_duration_since(a.last_seen) > timeout)
                .map(|(token, _)| token.clone())
                .collect();
            for token in &stale {
                state.attachments.remove(token);
            }
            let remaining = state.attachments.len();

            if !stale.is_empty() {
                warn!(
                    "Pruned {} attachment(s) with no heartbeat for over {:?}",
                    stale.len(),
                    timeout
                );
            }
            if remaining == 0 {
                // We are the sweep; stop without aborting ourselves
                state.sweep_generation += 1;
                state.sweep = None;
                self.arm_idle(&mut state);
            }
            (stale, remaining)
        };

        for token in pruned {
            self.emit(AttachmentEvent::Detached {
                token,
                remaining,
                pruned: true,
            });
        }
        remaining > 0
    }
}
