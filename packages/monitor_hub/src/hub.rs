//! Port multiplex hub.
//!
//! Owns every [`MonitorSession`], keyed by physical port so that only one
//! configuration of a port can be live at a time. Subscribers register a
//! [`MonitorSink`]; every chunk read from the upstream stream is appended to
//! the session's ring buffer and then handed to each sink.
//!
//! A session distinguishes two sets:
//! - members: subscriptions opened on it. The session lives while it has any.
//! - receivers: members that have subscribed. The upstream link is held only
//!   while there are receivers, or while the session is paused.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::acquisition::{LinkState, MonitorAcquirer, MonitorLink};
use crate::error::MonitorError;
use crate::port::{MonitorKey, PortIdentifier};
use crate::provider::{MessageStream, ProtocolSettings, UpstreamConfig};
use crate::ring_buffer::{DEFAULT_RING_CAPACITY, RingBuffer};
use crate::sink::{MonitorSink, SessionStatus, SinkMessage};

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Opaque handle binding a client to a session.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

impl FromStr for SubscriptionId {
    type Err = MonitorError;

    /// Accepts both `sub-7` and `7`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix("sub-")
            .unwrap_or(s)
            .parse()
            .map(SubscriptionId)
            .map_err(|_| MonitorError::MonitorNotFound(s.to_string()))
    }
}

/// Identifies one reader attached to a subscription. A later subscribe on
/// the same id replaces the reader; cleanup for the old one is then a no-op.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct ReaderId(u64);

#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenMode {
    #[default]
    Shared,
    Exclusive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No upstream link; waiting for a subscriber.
    Idle,
    Opening,
    Running,
    Paused,
    /// Link is being released after the last receiver left.
    Closing,
}

#[derive(Clone, Debug)]
pub struct OpenRequest {
    pub key: MonitorKey,
    pub client_id: ClientId,
    pub mode: OpenMode,
    /// Forwarded to the provider on acquisition.
    pub fqbn: Option<String>,
}

impl OpenRequest {
    pub fn new(key: MonitorKey, client_id: ClientId) -> Self {
        Self {
            key,
            client_id,
            mode: OpenMode::Shared,
            fqbn: None,
        }
    }

    pub fn exclusive(mut self) -> Self {
        self.mode = OpenMode::Exclusive;
        self
    }
}

/// Session lifecycle changes, for every interested observer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HubEvent {
    Started { key: MonitorKey },
    Stopped { key: MonitorKey, reason: String },
    Paused { key: MonitorKey },
    Resumed { key: MonitorKey },
    BaudrateChanged { previous: MonitorKey, key: MonitorKey },
}

/// Point-in-time view of one session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Canonical `protocol://address@baud#hash` form.
    pub key: String,
    pub port: String,
    pub state: SessionState,
    pub subscriber_count: usize,
    pub member_count: usize,
    pub buffered_bytes: usize,
    pub buffer_capacity: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusive_owner: Option<ClientId>,
}

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub ring_buffer_bytes: usize,
    /// Tear a paused session down if it is not resumed within this window.
    /// `None` keeps it paused indefinitely.
    pub max_pause: Option<Duration>,
    pub event_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ring_buffer_bytes: DEFAULT_RING_CAPACITY,
            max_pause: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

type Opening = Shared<BoxFuture<'static, Result<(), MonitorError>>>;
type Release = Shared<BoxFuture<'static, ()>>;
type Pausing = Shared<BoxFuture<'static, Result<bool, MonitorError>>>;

struct SubscriptionEntry {
    port: PortIdentifier,
    client_id: ClientId,
    subscribed: bool,
}

struct Receiver {
    reader: ReaderId,
    sink: Arc<dyn MonitorSink>,
}

struct MonitorSession {
    id: u64,
    key: MonitorKey,
    upstream: UpstreamConfig,
    state: SessionState,
    exclusive_owner: Option<ClientId>,
    members: HashMap<SubscriptionId, ClientId>,
    receivers: HashMap<SubscriptionId, Receiver>,
    ring: RingBuffer,
    link: Option<Arc<MonitorLink>>,
    /// Bumped whenever a link is installed or taken, so a stale read loop
    /// can tell it no longer owns the session.
    link_epoch: u64,
    reader: Option<JoinHandle<()>>,
    opening: Option<Opening>,
    /// In-flight pause; concurrent callers share it.
    pausing: Option<Pausing>,
    write_queue: Arc<Mutex<()>>,
    pause_epoch: u64,
}

impl MonitorSession {
    fn new(id: u64, key: MonitorKey, fqbn: Option<String>, ring_bytes: usize) -> Self {
        let upstream = UpstreamConfig {
            baudrate: key.baudrate,
            fqbn,
        };
        Self {
            id,
            key,
            upstream,
            state: SessionState::Idle,
            exclusive_owner: None,
            members: HashMap::new(),
            receivers: HashMap::new(),
            ring: RingBuffer::new(ring_bytes),
            link: None,
            link_epoch: 0,
            reader: None,
            opening: None,
            pausing: None,
            write_queue: Arc::new(Mutex::new(())),
            pause_epoch: 0,
        }
    }

    fn broadcast(&self, message: SinkMessage) {
        for receiver in self.receivers.values() {
            receiver.sink.deliver(message.clone());
        }
    }

    fn owns_link(&self, session_id: u64, epoch: u64) -> bool {
        self.id == session_id && self.link_epoch == epoch && self.link.is_some()
    }

    fn take_link(&mut self) -> Option<Arc<MonitorLink>> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        let link = self.link.take()?;
        self.link_epoch += 1;
        Some(link)
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            key: self.key.to_string(),
            port: self.key.port.to_string(),
            state: self.state,
            subscriber_count: self.receivers.len(),
            member_count: self.members.len(),
            buffered_bytes: self.ring.len(),
            buffer_capacity: self.ring.capacity(),
            exclusive_owner: self.exclusive_owner.clone(),
        }
    }
}

#[derive(Default)]
struct HubState {
    sessions: HashMap<PortIdentifier, MonitorSession>,
    subscriptions: HashMap<SubscriptionId, SubscriptionEntry>,
    /// Upstream handles still being torn down, per port, in registration
    /// order. An acquisition waits for those registered before it started.
    releases: HashMap<PortIdentifier, Vec<(u64, Release)>>,
}

struct WriteTarget {
    link: Option<Arc<MonitorLink>>,
    queue: Arc<Mutex<()>>,
    opening: Option<Opening>,
}

struct HubInner {
    state: Mutex<HubState>,
    acquirer: MonitorAcquirer,
    events: broadcast::Sender<HubEvent>,
    config: HubConfig,
    next_subscription: AtomicU64,
    next_internal: AtomicU64,
}

/// Registry of monitor sessions. Cheap to clone.
#[derive(Clone)]
pub struct MonitorHub {
    inner: Arc<HubInner>,
}

impl MonitorHub {
    pub fn new(acquirer: MonitorAcquirer, config: HubConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(HubInner {
                state: Mutex::new(HubState::default()),
                acquirer,
                events,
                config,
                next_subscription: AtomicU64::new(1),
                next_internal: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<HubEvent> {
        self.inner.events.subscribe()
    }

    pub async fn describe_settings(&self, protocol: &str) -> Result<ProtocolSettings, MonitorError> {
        self.inner.acquirer.describe_settings(protocol).await
    }

    fn next_internal_id(&self) -> u64 {
        self.inner.next_internal.fetch_add(1, Ordering::SeqCst)
    }

    fn emit(&self, event: HubEvent) {
        // No receivers is fine
        let _ = self.inner.events.send(event);
    }

    /// Register `client_id` against `key`, creating the session if needed.
    pub async fn open(&self, request: OpenRequest) -> Result<SubscriptionId, MonitorError> {
        let OpenRequest {
            key,
            client_id,
            mode,
            fqbn,
        } = request;

        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        let session = match state.sessions.entry(key.port.clone()) {
            Entry::Occupied(occupied) => {
                let session = occupied.into_mut();
                if session.key != key {
                    return Err(MonitorError::PortInUseDifferentConfig {
                        active: session.key.clone(),
                        requested: key,
                    });
                }
                if let Some(existing) = session
                    .members
                    .iter()
                    .find(|(_, owner)| **owner == client_id)
                    .map(|(id, _)| *id)
                {
                    debug!("{} already holds {} on {}", client_id, existing, key);
                    return Ok(existing);
                }
                if let Some(owner) = &session.exclusive_owner {
                    if *owner != client_id {
                        return Err(MonitorError::PortInUseExclusive(key.port.to_string()));
                    }
                }
                if mode == OpenMode::Exclusive {
                    if session.members.values().any(|owner| *owner != client_id) {
                        return Err(MonitorError::PortInUseExclusive(key.port.to_string()));
                    }
                    session.exclusive_owner = Some(client_id.clone());
                }
                session
            }
            Entry::Vacant(vacant) => {
                let mut session = MonitorSession::new(
                    self.next_internal_id(),
                    key.clone(),
                    fqbn,
                    self.inner.config.ring_buffer_bytes,
                );
                if mode == OpenMode::Exclusive {
                    session.exclusive_owner = Some(client_id.clone());
                }
                info!("Created monitor session for {}", key);
                vacant.insert(session)
            }
        };

        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::SeqCst));
        session.members.insert(id, client_id.clone());
        state.subscriptions.insert(
            id,
            SubscriptionEntry {
                port: key.port.clone(),
                client_id: client_id.clone(),
                subscribed: false,
            },
        );
        debug!("Opened {} for {} on {}", id, client_id, key);
        Ok(id)
    }

    /// Start delivering to `sink`, replacing any reader already attached to
    /// `id`. Up to `tail_bytes` of history go to this sink before any live
    /// chunk. Resolves once the upstream link is live.
    pub async fn subscribe(
        &self,
        id: SubscriptionId,
        tail_bytes: usize,
        sink: Arc<dyn MonitorSink>,
    ) -> Result<ReaderId, MonitorError> {
        let reader = ReaderId(self.next_internal_id());
        let opening = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;

            let entry = state
                .subscriptions
                .get_mut(&id)
                .ok_or_else(|| MonitorError::MonitorNotFound(id.to_string()))?;
            let session = state
                .sessions
                .get_mut(&entry.port)
                .ok_or_else(|| MonitorError::MonitorNotFound(id.to_string()))?;

            if tail_bytes > 0 {
                session.ring.ensure_capacity(tail_bytes);
                let history = session.ring.tail(tail_bytes);
                if !history.is_empty() {
                    sink.deliver(SinkMessage::Data(history.into()));
                }
            }
            if session.state == SessionState::Paused {
                sink.deliver(SinkMessage::Status(SessionStatus::Paused));
            }
            if session.receivers.insert(id, Receiver { reader, sink }).is_some() {
                debug!("{} reader replaced on {}", id, session.key);
            }
            entry.subscribed = true;
            debug!("{} subscribed to {}", id, session.key);

            if session.link.is_some() {
                None
            } else if let Some(opening) = &session.opening {
                Some(opening.clone())
            } else {
                Some(self.start_acquisition(session))
            }
        };

        if let Some(opening) = opening {
            if let Err(err) = opening.await {
                self.detach_receiver(id, Some(reader)).await;
                return Err(err);
            }
        }
        Ok(reader)
    }

    fn start_acquisition(&self, session: &mut MonitorSession) -> Opening {
        session.state = SessionState::Opening;

        let hub = self.clone();
        let port = session.key.port.clone();
        let session_id = session.id;
        let upstream = session.upstream.clone();
        // Releases registered from here on may themselves wait for this opening
        let barrier = self.next_internal_id();
        let task = tokio::spawn(async move {
            hub.wait_for_releases(&port, barrier).await;
            hub.finish_acquisition(port, session_id, upstream).await
        });

        let opening = async move {
            task.await.unwrap_or_else(|e| {
                Err(MonitorError::MonitorOpenFailed(format!(
                    "acquisition task failed: {e}"
                )))
            })
        }
        .boxed()
        .shared();
        session.opening = Some(opening.clone());
        opening
    }

    async fn wait_for_releases(&self, port: &PortIdentifier, barrier: u64) {
        loop {
            let pending = {
                let state = self.inner.state.lock().await;
                state.releases.get(port).and_then(|releases| {
                    releases
                        .iter()
                        .find(|(id, _)| *id < barrier)
                        .map(|(_, release)| release.clone())
                })
            };
            match pending {
                Some(release) => {
                    debug!("Waiting for previous monitor on {} to be released", port);
                    release.await;
                }
                None => return,
            }
        }
    }

    async fn finish_acquisition(
        self,
        port: PortIdentifier,
        session_id: u64,
        upstream: UpstreamConfig,
    ) -> Result<(), MonitorError> {
        let acquired = self.inner.acquirer.acquire(&port, &upstream).await;

        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        let current = state
            .sessions
            .get(&port)
            .is_some_and(|session| session.id == session_id);
        if !current {
            // Dispose before resolving: the release registered when the
            // session went away completes with this opening.
            drop(guard);
            debug!("Session on {} went away while opening", port);
            if let Ok(acquired) = acquired {
                acquired.link.dispose().await;
            }
            return Err(MonitorError::MonitorNotFound(port.to_string()));
        }
        let Some(session) = state.sessions.get_mut(&port) else {
            return Err(MonitorError::MonitorNotFound(port.to_string()));
        };
        session.opening = None;

        let acquired = match acquired {
            Ok(acquired) => acquired,
            Err(err) => {
                warn!("Failed to open monitor {}: {}", session.key, err);
                session.state = SessionState::Idle;
                for (id, _) in session.receivers.drain() {
                    if let Some(entry) = state.subscriptions.get_mut(&id) {
                        entry.subscribed = false;
                    }
                }
                return Err(err);
            }
        };

        if session.receivers.is_empty() {
            debug!("Every subscriber left {} while it was opening", session.key);
            session.state = SessionState::Idle;
            self.schedule_release(state, &port, session_id, acquired.link);
            return Ok(());
        }

        session.link_epoch += 1;
        let epoch = session.link_epoch;
        let link = acquired.link;
        session.link = Some(link.clone());
        session.state = SessionState::Running;

        for chunk in acquired.pending {
            session.ring.push(&chunk);
            session.broadcast(SinkMessage::Data(chunk.into()));
        }

        // The baud rate may have changed while we were opening
        if let Some(baudrate) = session.upstream.baudrate {
            if upstream.baudrate != Some(baudrate) {
                let link = link.clone();
                tokio::spawn(async move {
                    if let Err(e) = link.update_baudrate(baudrate).await {
                        warn!("Failed to apply baud rate {} after opening: {}", baudrate, e);
                    }
                });
            }
        }

        session.reader = Some(tokio::spawn(self.clone().read_loop(
            port,
            session_id,
            epoch,
            link,
            acquired.messages,
        )));

        let key = session.key.clone();
        info!("Monitor {} running", key);
        self.emit(HubEvent::Started { key });
        Ok(())
    }

    async fn read_loop(
        self,
        port: PortIdentifier,
        session_id: u64,
        epoch: u64,
        link: Arc<MonitorLink>,
        mut messages: MessageStream,
    ) {
        let mut state_rx = link.subscribe_state();
        let mut seen_pauses = link.pause_count();

        let reason = loop {
            tokio::select! {
                biased;
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let current = *state_rx.borrow_and_update();
                    if current == LinkState::Disposed {
                        return;
                    }
                    let pauses = link.pause_count();
                    if current == LinkState::Running && pauses != seen_pauses {
                        seen_pauses = pauses;
                        // Anything queued before the resume belongs to the pause
                        while let Ok(item) = messages.try_recv() {
                            match item {
                                Ok(bytes) => self.fan_out(&port, session_id, epoch, bytes).await,
                                Err(e) => debug!("Ignoring abort on {} from pause: {}", port, e),
                            }
                        }
                    }
                }
                item = messages.recv() => match item {
                    Some(Ok(bytes)) => self.fan_out(&port, session_id, epoch, bytes).await,
                    Some(Err(e)) if link.is_paused() || link.pause_count() != seen_pauses => {
                        debug!("Ignoring abort on {} while paused: {}", port, e);
                    }
                    Some(Err(e)) => break e.to_string(),
                    None if link.is_disposed() => return,
                    None => break "upstream stream ended".to_string(),
                },
            }
        };

        self.upstream_ended(&port, session_id, epoch, reason).await;
    }

    async fn fan_out(&self, port: &PortIdentifier, session_id: u64, epoch: u64, bytes: Vec<u8>) {
        let mut state = self.inner.state.lock().await;
        let Some(session) = state.sessions.get_mut(port) else {
            return;
        };
        if !session.owns_link(session_id, epoch) {
            return;
        }
        session.ring.push(&bytes);
        session.broadcast(SinkMessage::Data(bytes.into()));
    }

    async fn upstream_ended(&self, port: &PortIdentifier, session_id: u64, epoch: u64, reason: String) {
        let link = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            let Some(session) = state.sessions.get_mut(port) else {
                return;
            };
            if !session.owns_link(session_id, epoch) {
                return;
            }
            // We are the reader; don't abort ourselves
            session.reader = None;
            warn!("Monitor {} terminated: {}", session.key, reason);
            self.end_session(state, port, &reason)
        };
        if let Some(link) = link {
            link.dispose().await;
        }
    }

    /// Remove a session outright, notifying its receivers. Returns the link
    /// for the caller to dispose outside the lock.
    fn end_session(
        &self,
        state: &mut HubState,
        port: &PortIdentifier,
        reason: &str,
    ) -> Option<Arc<MonitorLink>> {
        let mut session = state.sessions.remove(port)?;
        for id in session.members.keys() {
            state.subscriptions.remove(id);
        }
        session.broadcast(SinkMessage::Status(SessionStatus::Stopped {
            reason: reason.to_string(),
        }));
        let link = session.take_link();
        if link.is_some() {
            self.emit(HubEvent::Stopped {
                key: session.key.clone(),
                reason: reason.to_string(),
            });
        }
        info!("Monitor session {} ended: {}", session.key, reason);
        link
    }

    /// Dispose `link` in the background and record it so the next
    /// acquisition on the same port waits for it.
    fn schedule_release(
        &self,
        state: &mut HubState,
        port: &PortIdentifier,
        session_id: u64,
        link: Arc<MonitorLink>,
    ) {
        let release_id = self.next_internal_id();
        let hub = self.clone();
        let release_port = port.clone();
        let release = async move {
            link.dispose().await;
            hub.release_finished(&release_port, session_id, release_id).await;
        }
        .boxed()
        .shared();
        state
            .releases
            .entry(port.clone())
            .or_default()
            .push((release_id, release.clone()));
        tokio::spawn(release);
    }

    async fn release_finished(&self, port: &PortIdentifier, session_id: u64, release_id: u64) {
        let mut state = self.inner.state.lock().await;
        if let Some(session) = state.sessions.get_mut(port) {
            if session.id == session_id && session.state == SessionState::Closing {
                session.state = SessionState::Idle;
            }
        }
        if let Entry::Occupied(mut pending) = state.releases.entry(port.clone()) {
            pending.get_mut().retain(|(id, _)| *id != release_id);
            if pending.get().is_empty() {
                pending.remove();
            }
        }
        debug!("Monitor on {} released", port);
    }

    /// Release the link if no receiver needs it and the session isn't paused.
    fn release_if_idle(&self, state: &mut HubState, port: &PortIdentifier) {
        let Some(session) = state.sessions.get_mut(port) else {
            return;
        };
        if !session.receivers.is_empty() || session.state == SessionState::Paused {
            return;
        }
        let Some(link) = session.take_link() else {
            return;
        };
        session.state = SessionState::Closing;
        let key = session.key.clone();
        let session_id = session.id;
        info!("No subscribers left on {}, releasing monitor", key);
        self.schedule_release(state, port, session_id, link);
        self.emit(HubEvent::Stopped {
            key,
            reason: "no subscribers".into(),
        });
    }

    /// Drop the session if no member remains and it isn't paused.
    fn destroy_if_unused(&self, state: &mut HubState, port: &PortIdentifier) {
        let unused = state.sessions.get(port).is_some_and(|session| {
            session.members.is_empty() && session.state != SessionState::Paused
        });
        if !unused {
            return;
        }
        let Some(session) = state.sessions.remove(port) else {
            return;
        };
        // An in-flight acquisition will release what it gets; make the next
        // acquisition on this port wait for it.
        let session_id = session.id;
        if let Some(opening) = session.opening {
            let release_id = self.next_internal_id();
            let hub = self.clone();
            let release_port = port.clone();
            let release = async move {
                let _ = opening.await;
                hub.release_finished(&release_port, session_id, release_id).await;
            }
            .boxed()
            .shared();
            state
                .releases
                .entry(port.clone())
                .or_default()
                .push((release_id, release.clone()));
            tokio::spawn(release);
        }
        info!("Monitor session {} destroyed", session.key);
    }

    /// Stop delivering to `id`. Unknown ids are ignored.
    pub async fn unsubscribe(&self, id: SubscriptionId) {
        self.detach_receiver(id, None).await;
    }

    /// Stop delivering to `id` only if `reader` is still the one attached.
    pub async fn unsubscribe_reader(&self, id: SubscriptionId, reader: ReaderId) {
        self.detach_receiver(id, Some(reader)).await;
    }

    async fn detach_receiver(&self, id: SubscriptionId, reader: Option<ReaderId>) {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        if let Some(reader) = reader {
            let attached = state
                .subscriptions
                .get(&id)
                .and_then(|entry| state.sessions.get(&entry.port))
                .and_then(|session| session.receivers.get(&id))
                .map(|receiver| receiver.reader);
            if attached != Some(reader) {
                debug!("Stale reader {:?} on {} left", reader, id);
                return;
            }
        }

        let Some(entry) = state.subscriptions.get_mut(&id) else {
            debug!("Unsubscribe for unknown {}", id);
            return;
        };
        entry.subscribed = false;
        let port = entry.port.clone();
        if let Some(session) = state.sessions.get_mut(&port) {
            if session.receivers.remove(&id).is_some() {
                debug!("{} unsubscribed from {}", id, session.key);
            }
        }
        self.release_if_idle(state, &port);
    }

    /// Unsubscribe and forget the subscription id.
    pub async fn close(&self, id: SubscriptionId) -> Result<(), MonitorError> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        let entry = state
            .subscriptions
            .remove(&id)
            .ok_or_else(|| MonitorError::MonitorNotFound(id.to_string()))?;

        if let Some(session) = state.sessions.get_mut(&entry.port) {
            session.receivers.remove(&id);
            session.members.remove(&id);
            let still_member = session.members.values().any(|c| *c == entry.client_id);
            if !still_member && session.exclusive_owner.as_ref() == Some(&entry.client_id) {
                session.exclusive_owner = None;
            }
            debug!("{} closed on {}", id, session.key);
        }

        self.release_if_idle(state, &entry.port);
        self.destroy_if_unused(state, &entry.port);
        Ok(())
    }

    async fn write_target(&self, id: SubscriptionId) -> Result<WriteTarget, MonitorError> {
        let state = self.inner.state.lock().await;
        let entry = state
            .subscriptions
            .get(&id)
            .ok_or_else(|| MonitorError::MonitorNotFound(id.to_string()))?;
        if !entry.subscribed {
            return Err(MonitorError::MonitorNotSubscribed(id.to_string()));
        }
        let session = state
            .sessions
            .get(&entry.port)
            .ok_or_else(|| MonitorError::MonitorNotFound(id.to_string()))?;
        Ok(WriteTarget {
            link: session.link.clone(),
            queue: session.write_queue.clone(),
            opening: session.opening.clone(),
        })
    }

    /// Forward `data` upstream. Writes on one session are serialized.
    /// While the session is paused nothing is sent and 0 is returned.
    pub async fn write(&self, id: SubscriptionId, data: &[u8]) -> Result<usize, MonitorError> {
        let mut target = self.write_target(id).await?;
        if target.link.is_none() {
            if let Some(opening) = target.opening.take() {
                opening.await?;
                target = self.write_target(id).await?;
            }
        }
        let Some(link) = target.link else {
            return Err(MonitorError::MonitorNotSubscribed(id.to_string()));
        };

        let _turn = target.queue.lock().await;
        if link.is_paused() {
            debug!("Dropping {} byte write from {} while paused", data.len(), id);
            return Ok(0);
        }
        link.send(data).await
    }

    fn current_session<'a>(
        state: &'a mut HubState,
        port: &PortIdentifier,
        session_id: u64,
    ) -> Option<&'a mut MonitorSession> {
        state
            .sessions
            .get_mut(port)
            .filter(|session| session.id == session_id)
    }

    /// Park the session on `port` so another task can use the hardware.
    /// Returns false if there is no live session to pause. Resolves once the
    /// upstream is parked; concurrent calls share one pause.
    pub async fn pause(&self, port: &PortIdentifier) -> Result<bool, MonitorError> {
        let pausing = {
            let mut guard = self.inner.state.lock().await;
            let Some(session) = guard.sessions.get_mut(port) else {
                return Ok(false);
            };
            if session.state == SessionState::Paused {
                return Ok(true);
            }
            match session.pausing.clone() {
                Some(pausing) => pausing,
                None => {
                    let Some(link) = session.link.clone() else {
                        return Ok(false);
                    };
                    let hub = self.clone();
                    let task = tokio::spawn(hub.finish_pause(port.clone(), session.id, link));
                    let pausing = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(MonitorError::MonitorOpenFailed(format!("pause task failed: {e}")))
                        })
                    }
                    .boxed()
                    .shared();
                    session.pausing = Some(pausing.clone());
                    pausing
                }
            }
        };
        pausing.await
    }

    async fn finish_pause(
        self,
        port: PortIdentifier,
        session_id: u64,
        link: Arc<MonitorLink>,
    ) -> Result<bool, MonitorError> {
        let parked = link.pause().await;

        let mut guard = self.inner.state.lock().await;
        let Some(session) = Self::current_session(&mut guard, &port, session_id) else {
            return Ok(false);
        };
        session.pausing = None;
        parked?;
        if !session.link.as_ref().is_some_and(|current| Arc::ptr_eq(current, &link)) {
            // Released while parking; nothing left to pause
            return Ok(false);
        }
        session.state = SessionState::Paused;
        session.pause_epoch += 1;
        let pause_epoch = session.pause_epoch;
        session.broadcast(SinkMessage::Status(SessionStatus::Paused));
        let key = session.key.clone();
        drop(guard);

        info!("Monitor {} paused", key);
        self.emit(HubEvent::Paused { key });
        if let Some(limit) = self.inner.config.max_pause {
            self.schedule_pause_expiry(port, session_id, pause_epoch, limit);
        }
        Ok(true)
    }

    fn schedule_pause_expiry(&self, port: PortIdentifier, session_id: u64, pause_epoch: u64, limit: Duration) {
        let hub = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            let link = {
                let mut guard = hub.inner.state.lock().await;
                let state = &mut *guard;
                let expired = state.sessions.get(&port).is_some_and(|session| {
                    session.id == session_id
                        && session.state == SessionState::Paused
                        && session.pause_epoch == pause_epoch
                });
                if !expired {
                    return;
                }
                warn!("Monitor on {} paused for more than {:?}, tearing down", port, limit);
                hub.end_session(state, &port, "pause expired")
            };
            if let Some(link) = link {
                link.dispose().await;
            }
        });
    }

    /// Reacquire the hardware for a paused session. Receivers are kept and
    /// see a running status; nobody has to resubscribe.
    pub async fn resume(&self, port: &PortIdentifier) -> Result<bool, MonitorError> {
        let (link, session_id) = {
            let state = self.inner.state.lock().await;
            let Some(session) = state.sessions.get(port) else {
                return Ok(false);
            };
            if session.state != SessionState::Paused {
                return Ok(false);
            }
            let Some(link) = session.link.clone() else {
                return Ok(false);
            };
            (link, session.id)
        };

        if let Err(err) = link.resume().await {
            let link = {
                let mut guard = self.inner.state.lock().await;
                let state = &mut *guard;
                if Self::current_session(state, port, session_id).is_some() {
                    self.end_session(state, port, &format!("resume failed: {err}"))
                } else {
                    None
                }
            };
            if let Some(link) = link {
                link.dispose().await;
            }
            return Err(err);
        }

        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let Some(session) = Self::current_session(state, port, session_id) else {
            return Ok(false);
        };
        session.state = SessionState::Running;
        session.broadcast(SinkMessage::Status(SessionStatus::Running));
        let key = session.key.clone();
        info!("Monitor {} resumed", key);
        self.emit(HubEvent::Resumed { key });

        // Whatever was retained across the pause can go now
        self.release_if_idle(state, port);
        self.destroy_if_unused(state, port);
        Ok(true)
    }

    /// Change the baud rate of the session `id` belongs to. This is the one
    /// place the rate changes: the session is re-keyed, the upstream is told,
    /// and observers get a baudrate-changed event.
    pub async fn update_baudrate(&self, id: SubscriptionId, baudrate: u32) -> Result<MonitorKey, MonitorError> {
        if baudrate == 0 {
            return Err(MonitorError::InvalidPortKey(
                "baud rate must be positive".into(),
            ));
        }

        let (link, port, session_id) = {
            let state = self.inner.state.lock().await;
            let entry = state
                .subscriptions
                .get(&id)
                .ok_or_else(|| MonitorError::MonitorNotFound(id.to_string()))?;
            let session = state
                .sessions
                .get(&entry.port)
                .ok_or_else(|| MonitorError::MonitorNotFound(id.to_string()))?;
            if session.key.baudrate == Some(baudrate) {
                return Ok(session.key.clone());
            }
            (session.link.clone(), entry.port.clone(), session.id)
        };

        if let Some(link) = &link {
            link.update_baudrate(baudrate).await?;
        }

        let mut guard = self.inner.state.lock().await;
        let Some(session) = Self::current_session(&mut guard, &port, session_id) else {
            return Err(MonitorError::MonitorNotFound(id.to_string()));
        };
        let previous = session.key.clone();
        session.key = previous.with_baudrate(baudrate);
        session.upstream.baudrate = Some(baudrate);
        let key = session.key.clone();
        drop(guard);

        info!("Monitor {} re-keyed to {}", previous, key);
        self.emit(HubEvent::BaudrateChanged {
            previous,
            key: key.clone(),
        });
        Ok(key)
    }

    /// Close every subscription `client_id` holds. Returns how many.
    pub async fn release_client(&self, client_id: &ClientId) -> usize {
        let ids: Vec<SubscriptionId> = {
            let state = self.inner.state.lock().await;
            state
                .subscriptions
                .iter()
                .filter(|(_, entry)| entry.client_id == *client_id)
                .map(|(id, _)| *id)
                .collect()
        };

        let mut released = 0;
        for id in ids {
            // A racing close may have beaten us to it
            if self.close(id).await.is_ok() {
                released += 1;
            }
        }
        if released > 0 {
            info!("Released {} subscription(s) held by {}", released, client_id);
        }
        released
    }

    pub async fn sessions(&self) -> Vec<SessionSnapshot> {
        let state = self.inner.state.lock().await;
        let mut sessions: Vec<_> = state.sessions.values().map(MonitorSession::snapshot).collect();
        sessions.sort_by(|a, b| a.key.cmp(&b.key));
        sessions
    }

    pub async fn session(&self, port: &PortIdentifier) -> Option<SessionSnapshot> {
        let state = self.inner.state.lock().await;
        state.sessions.get(port).map(MonitorSession::snapshot)
    }

    /// The current key of the session `id` belongs to.
    pub async fn subscription_key(&self, id: SubscriptionId) -> Option<MonitorKey> {
        let state = self.inner.state.lock().await;
        let entry = state.subscriptions.get(&id)?;
        state.sessions.get(&entry.port).map(|s| s.key.clone())
    }

    /// Tear down every session and wait for their upstream links to go.
    pub async fn shutdown(&self) {
        let (links, releases) = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            let ports: Vec<PortIdentifier> = state.sessions.keys().cloned().collect();
            let links: Vec<_> = ports
                .iter()
                .filter_map(|port| self.end_session(state, port, "bridge shutting down"))
                .collect();
            let releases: Vec<Release> = state
                .releases
                .values()
                .flatten()
                .map(|(_, release)| release.clone())
                .collect();
            (links, releases)
        };

        let count = links.len();
        for link in links {
            link.dispose().await;
        }
        futures::future::join_all(releases).await;
        info!("Monitor hub shut down ({} live monitor(s) disposed)", count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DiscoveryWatcher;
    use crate::provider::ProviderError;
    use crate::sink::ChannelSink;
    use crate::test_helpers::MockProvider;
    use tokio::sync::mpsc;

    fn hub_with(provider: Arc<MockProvider>, config: HubConfig) -> MonitorHub {
        let acquirer = MonitorAcquirer::new(
            provider,
            Arc::new(DiscoveryWatcher::default()),
            Duration::from_millis(50),
        );
        MonitorHub::new(acquirer, config)
    }

    fn hub(provider: &Arc<MockProvider>) -> MonitorHub {
        hub_with(provider.clone(), HubConfig::default())
    }

    fn key(raw: &str) -> MonitorKey {
        MonitorKey::parse(raw).unwrap()
    }

    fn com3() -> PortIdentifier {
        PortIdentifier::new("serial", "COM3")
    }

    fn request(raw: &str, client: &str) -> OpenRequest {
        OpenRequest::new(key(raw), ClientId::new(client))
    }

    async fn next(rx: &mut mpsc::Receiver<SinkMessage>) -> SinkMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for sink message")
            .expect("sink closed")
    }

    async fn next_data(rx: &mut mpsc::Receiver<SinkMessage>) -> Vec<u8> {
        match next(rx).await {
            SinkMessage::Data(bytes) => bytes.to_vec(),
            other => panic!("expected data, got {other:?}"),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    async fn open_and_subscribe(
        hub: &MonitorHub,
        raw: &str,
        client: &str,
    ) -> (SubscriptionId, mpsc::Receiver<SinkMessage>) {
        let id = hub.open(request(raw, client)).await.unwrap();
        let (sink, rx) = ChannelSink::new(64);
        hub.subscribe(id, 0, sink).await.unwrap();
        (id, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_subscribes_acquire_once() {
        let provider = Arc::new(MockProvider::new().with_delay(Duration::from_millis(50)));
        let hub = hub(&provider);

        let a = hub.open(request("COM3@9600#h1", "c1")).await.unwrap();
        let b = hub.open(request("COM3@9600#h1", "c2")).await.unwrap();
        let (sink_a, mut rx_a) = ChannelSink::new(16);
        let (sink_b, mut rx_b) = ChannelSink::new(16);

        let (ra, rb) = tokio::join!(hub.subscribe(a, 0, sink_a), hub.subscribe(b, 0, sink_b));
        ra.unwrap();
        rb.unwrap();
        assert_eq!(provider.acquire_calls(), 1);

        provider.handle(0).emit(b"hi").await;
        assert_eq!(next_data(&mut rx_a).await, b"hi");
        assert_eq!(next_data(&mut rx_b).await, b"hi");

        hub.unsubscribe(a).await;
        settle().await;
        let snapshot = hub.session(&com3()).await.unwrap();
        assert_eq!(snapshot.state, SessionState::Running);
        assert_eq!(snapshot.subscriber_count, 1);
        assert!(!provider.handle(0).is_disposed());
    }

    #[tokio::test]
    async fn reopening_same_key_is_idempotent() {
        let provider = Arc::new(MockProvider::new());
        let hub = hub(&provider);

        let (first, _rx) = open_and_subscribe(&hub, "COM3@9600#h1", "c1").await;
        let second = hub.open(request("COM3@9600#h1", "c1")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.acquire_calls(), 1);
        assert_eq!(hub.session(&com3()).await.unwrap().member_count, 1);
    }

    #[tokio::test]
    async fn different_config_is_rejected_without_disturbing_active_session() {
        let provider = Arc::new(MockProvider::new());
        let hub = hub(&provider);
        let (_id, _rx) = open_and_subscribe(&hub, "COM3@9600#h1", "c1").await;

        let err = hub.open(request("COM3@115200#h2", "c2")).await.unwrap_err();
        assert_eq!(
            err,
            MonitorError::PortInUseDifferentConfig {
                active: key("COM3@9600#h1"),
                requested: key("COM3@115200#h2"),
            }
        );

        let snapshot = hub.session(&com3()).await.unwrap();
        assert_eq!(snapshot.key, "serial://COM3@9600#h1");
        assert_eq!(snapshot.subscriber_count, 1);
        assert_eq!(provider.acquire_calls(), 1);
        assert!(!provider.handle(0).is_disposed());
    }

    #[tokio::test]
    async fn exclusive_open_conflicts_with_other_clients() {
        let provider = Arc::new(MockProvider::new());
        let hub = hub(&provider);

        let owned = hub
            .open(request("COM3@9600#h1", "c1").exclusive())
            .await
            .unwrap();
        let err = hub.open(request("COM3@9600#h1", "c2")).await.unwrap_err();
        assert_eq!(err.code(), "PORT_IN_USE_EXCLUSIVE");

        // The owner may reopen
        let again = hub
            .open(request("COM3@9600#h1", "c1").exclusive())
            .await
            .unwrap();
        assert_eq!(owned, again);

        hub.close(owned).await.unwrap();
        let shared = hub.open(request("COM3@9600#h1", "c2")).await.unwrap();
        let err = hub
            .open(request("COM3@9600#h1", "c3").exclusive())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PORT_IN_USE_EXCLUSIVE");
        hub.close(shared).await.unwrap();
    }

    #[tokio::test]
    async fn replay_precedes_live_bytes() {
        let provider = Arc::new(MockProvider::new());
        let hub = hub(&provider);
        let (_a, mut rx_a) = open_and_subscribe(&hub, "COM3@9600#h1", "c1").await;

        provider.handle(0).emit(b"hello world").await;
        assert_eq!(next_data(&mut rx_a).await, b"hello world");

        let b = hub.open(request("COM3@9600#h1", "c2")).await.unwrap();
        let (sink_b, mut rx_b) = ChannelSink::new(16);
        hub.subscribe(b, 5, sink_b).await.unwrap();
        provider.handle(0).emit(b"!").await;

        assert_eq!(next_data(&mut rx_b).await, b"world");
        assert_eq!(next_data(&mut rx_b).await, b"!");
        assert_eq!(next_data(&mut rx_a).await, b"!");
    }

    #[tokio::test]
    async fn large_replay_grows_the_buffer() {
        let provider = Arc::new(MockProvider::new());
        let hub = hub_with(
            provider.clone(),
            HubConfig {
                ring_buffer_bytes: 16,
                ..HubConfig::default()
            },
        );
        let (a, _rx) = open_and_subscribe(&hub, "COM3@9600#h1", "c1").await;
        let (sink, _rx2) = ChannelSink::new(4);
        hub.subscribe(a, 1024, sink).await.unwrap();
        assert_eq!(hub.session(&com3()).await.unwrap().buffer_capacity, 1024);
    }

    #[tokio::test]
    async fn write_requires_subscription() {
        let provider = Arc::new(MockProvider::new());
        let hub = hub(&provider);

        let id = hub.open(request("COM3@9600#h1", "c1")).await.unwrap();
        let err = hub.write(id, b"x").await.unwrap_err();
        assert_eq!(err.code(), "monitor-not-subscribed");

        let err = hub.write(SubscriptionId(999), b"x").await.unwrap_err();
        assert_eq!(err.code(), "monitor-not-found");

        let (sink, _rx) = ChannelSink::new(4);
        hub.subscribe(id, 0, sink).await.unwrap();
        let (a, b) = tokio::join!(hub.write(id, b"abc"), hub.write(id, b"def"));
        assert_eq!(a.unwrap(), 3);
        assert_eq!(b.unwrap(), 3);

        let written = provider.handle(0).written();
        assert!(written == b"abcdef" || written == b"defabc", "{written:?}");
    }

    #[tokio::test]
    async fn pause_and_resume_keep_every_subscriber() {
        let provider = Arc::new(MockProvider::new());
        let hub = hub(&provider);
        let mut events = hub.subscribe_events();
        let (a, mut rx_a) = open_and_subscribe(&hub, "COM3@9600#h1", "c1").await;
        let (_b, mut rx_b) = open_and_subscribe(&hub, "COM3@9600#h1", "c2").await;

        assert!(hub.pause(&com3()).await.unwrap());
        assert!(hub.pause(&com3()).await.unwrap());
        assert_eq!(next(&mut rx_a).await, SinkMessage::Status(SessionStatus::Paused));
        assert_eq!(next(&mut rx_b).await, SinkMessage::Status(SessionStatus::Paused));
        assert_eq!(hub.write(a, b"ignored").await.unwrap(), 0);

        assert!(hub.resume(&com3()).await.unwrap());
        assert_eq!(next(&mut rx_a).await, SinkMessage::Status(SessionStatus::Running));
        assert_eq!(next(&mut rx_b).await, SinkMessage::Status(SessionStatus::Running));

        provider.handle(0).emit(b"after").await;
        assert_eq!(next_data(&mut rx_a).await, b"after");
        assert_eq!(next_data(&mut rx_b).await, b"after");

        let snapshot = hub.session(&com3()).await.unwrap();
        assert_eq!(snapshot.state, SessionState::Running);
        assert_eq!(snapshot.subscriber_count, 2);
        assert_eq!(provider.acquire_calls(), 1);
        assert_eq!(provider.handle(0).pause_calls(), 1);
        assert_eq!(provider.handle(0).resume_calls(), 1);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                HubEvent::Started { key: key("COM3@9600#h1") },
                HubEvent::Paused { key: key("COM3@9600#h1") },
                HubEvent::Resumed { key: key("COM3@9600#h1") },
            ]
        );
    }

    #[tokio::test]
    async fn pause_without_session_returns_false() {
        let provider = Arc::new(MockProvider::new());
        let hub = hub(&provider);
        assert!(!hub.pause(&com3()).await.unwrap());
        assert!(!hub.resume(&com3()).await.unwrap());
    }

    #[tokio::test]
    async fn paused_session_is_retained_until_resume() {
        let provider = Arc::new(MockProvider::new());
        let hub = hub(&provider);
        let (id, _rx) = open_and_subscribe(&hub, "COM3@9600#h1", "c1").await;

        hub.pause(&com3()).await.unwrap();
        hub.close(id).await.unwrap();
        settle().await;
        assert!(!provider.handle(0).is_disposed());
        assert_eq!(hub.session(&com3()).await.unwrap().state, SessionState::Paused);

        hub.resume(&com3()).await.unwrap();
        settle().await;
        assert!(provider.handle(0).is_disposed());
        assert!(hub.session(&com3()).await.is_none());
    }

    #[tokio::test]
    async fn last_unsubscribe_releases_and_resubscribe_reacquires() {
        let provider = Arc::new(MockProvider::new());
        let hub = hub(&provider);
        let (id, _rx) = open_and_subscribe(&hub, "COM3@9600#h1", "c1").await;

        hub.unsubscribe(id).await;
        hub.unsubscribe(id).await;
        settle().await;
        assert!(provider.handle(0).is_disposed());
        assert_eq!(hub.session(&com3()).await.unwrap().state, SessionState::Idle);

        let (sink, mut rx) = ChannelSink::new(8);
        hub.subscribe(id, 0, sink).await.unwrap();
        assert_eq!(provider.acquire_calls(), 2);
        provider.handle(1).emit(b"again").await;
        assert_eq!(next_data(&mut rx).await, b"again");
    }

    #[tokio::test]
    async fn close_destroys_the_session() {
        let provider = Arc::new(MockProvider::new());
        let hub = hub(&provider);
        let (id, _rx) = open_and_subscribe(&hub, "COM3@9600#h1", "c1").await;

        hub.close(id).await.unwrap();
        assert!(hub.sessions().await.is_empty());
        assert_eq!(hub.close(id).await.unwrap_err().code(), "monitor-not-found");

        // The port is free for another configuration now
        let (_id, _rx) = open_and_subscribe(&hub, "COM3@115200#h2", "c2").await;
        assert_eq!(provider.acquire_calls(), 2);
    }

    #[tokio::test]
    async fn upstream_failure_ends_the_session() {
        let provider = Arc::new(MockProvider::new());
        let hub = hub(&provider);
        let mut events = hub.subscribe_events();
        let (id, mut rx) = open_and_subscribe(&hub, "COM3@9600#h1", "c1").await;

        provider.handle(0).abort("cable pulled").await;
        match next(&mut rx).await {
            SinkMessage::Status(SessionStatus::Stopped { reason }) => {
                assert!(reason.contains("cable pulled"), "{reason}")
            }
            other => panic!("expected stopped, got {other:?}"),
        }
        settle().await;

        assert!(hub.sessions().await.is_empty());
        assert_eq!(hub.write(id, b"x").await.unwrap_err().code(), "monitor-not-found");
        assert!(provider.handle(0).is_disposed());

        assert!(matches!(events.recv().await.unwrap(), HubEvent::Started { .. }));
        assert!(matches!(events.recv().await.unwrap(), HubEvent::Stopped { .. }));
    }

    #[tokio::test]
    async fn acquisition_failure_reaches_the_subscriber() {
        let provider = Arc::new(MockProvider::new());
        provider.fail_next(ProviderError::Busy("upload in progress".into()));
        let hub = hub(&provider);

        let id = hub.open(request("COM3@9600#h1", "c1")).await.unwrap();
        let (sink, _rx) = ChannelSink::new(8);
        let err = hub.subscribe(id, 0, sink.clone()).await.unwrap_err();
        assert_eq!(err.code(), "port-busy");
        assert_eq!(hub.session(&com3()).await.unwrap().subscriber_count, 0);
        assert_eq!(hub.write(id, b"x").await.unwrap_err().code(), "monitor-not-subscribed");

        hub.subscribe(id, 0, sink).await.unwrap();
        assert_eq!(provider.acquire_calls(), 2);
    }

    #[tokio::test]
    async fn release_client_closes_everything_it_holds() {
        let provider = Arc::new(MockProvider::new());
        let hub = hub(&provider);
        let (_a, _rx_a) = open_and_subscribe(&hub, "COM3@9600#h1", "c1").await;
        let (_b, _rx_b) = open_and_subscribe(&hub, "COM4@9600#h1", "c1").await;
        let (_c, _rx_c) = open_and_subscribe(&hub, "COM4@9600#h1", "c2").await;

        assert_eq!(hub.release_client(&ClientId::new("c1")).await, 2);
        assert_eq!(hub.release_client(&ClientId::new("c1")).await, 0);
        settle().await;

        let sessions = hub.sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].port, "serial://COM4");
        assert_eq!(sessions[0].subscriber_count, 1);
        assert_eq!(provider.live_handles(), 1);
    }

    #[tokio::test]
    async fn baudrate_update_rekeys_the_session() {
        let provider = Arc::new(MockProvider::new());
        let hub = hub(&provider);
        let mut events = hub.subscribe_events();
        let (id, _rx) = open_and_subscribe(&hub, "COM3@9600#h1", "c1").await;
        let _ = events.recv().await;

        let new_key = hub.update_baudrate(id, 115200).await.unwrap();
        assert_eq!(new_key, key("COM3@115200#h1"));
        assert_eq!(provider.handle(0).baudrates(), vec![115200]);
        assert_eq!(hub.subscription_key(id).await, Some(new_key.clone()));
        assert_eq!(
            events.recv().await.unwrap(),
            HubEvent::BaudrateChanged {
                previous: key("COM3@9600#h1"),
                key: new_key,
            }
        );

        let err = hub.open(request("COM3@9600#h1", "c2")).await.unwrap_err();
        assert_eq!(err.code(), "PORT_IN_USE_DIFFERENT_CONFIG");
        assert_eq!(provider.acquire_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_pause_expires() {
        let provider = Arc::new(MockProvider::new());
        let hub = hub_with(
            provider.clone(),
            HubConfig {
                max_pause: Some(Duration::from_secs(1)),
                ..HubConfig::default()
            },
        );
        let (_id, mut rx) = open_and_subscribe(&hub, "COM3@9600#h1", "c1").await;

        hub.pause(&com3()).await.unwrap();
        assert_eq!(next(&mut rx).await, SinkMessage::Status(SessionStatus::Paused));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            next(&mut rx).await,
            SinkMessage::Status(SessionStatus::Stopped {
                reason: "pause expired".into()
            })
        );
        assert!(hub.sessions().await.is_empty());
        settle().await;
        assert!(provider.handle(0).is_disposed());
    }

    #[tokio::test]
    async fn shutdown_disposes_every_link() {
        let provider = Arc::new(MockProvider::new());
        let hub = hub(&provider);
        let (_a, mut rx) = open_and_subscribe(&hub, "COM3@9600#h1", "c1").await;
        let (_b, _rx_b) = open_and_subscribe(&hub, "COM4", "c1").await;

        hub.shutdown().await;
        assert!(hub.sessions().await.is_empty());
        assert_eq!(provider.live_handles(), 0);
        assert!(matches!(
            next(&mut rx).await,
            SinkMessage::Status(SessionStatus::Stopped { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn close_during_pending_release_leaves_the_port_usable() {
        let provider = Arc::new(MockProvider::new().with_dispose_delay(Duration::from_millis(100)));
        let hub = hub(&provider);
        let (id, _rx) = open_and_subscribe(&hub, "COM3@9600#h1", "c1").await;

        // The first link is still being torn down when the reacquisition starts
        hub.unsubscribe(id).await;
        let (sink, _rx_again) = ChannelSink::new(16);
        let resubscribe = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.subscribe(id, 0, sink).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        hub.close(id).await.unwrap();

        let resubscribed = tokio::time::timeout(Duration::from_secs(30), resubscribe)
            .await
            .expect("reacquisition never finished")
            .unwrap();
        assert!(resubscribed.is_err());

        let (_other, mut rx) = tokio::time::timeout(
            Duration::from_secs(30),
            open_and_subscribe(&hub, "COM3@9600#h1", "c2"),
        )
        .await
        .expect("port stayed wedged");
        assert_eq!(provider.acquire_calls(), 3);
        assert_eq!(provider.live_handles(), 1);

        provider.handle(2).emit(b"ok").await;
        assert_eq!(next_data(&mut rx).await, b"ok");

        tokio::time::timeout(Duration::from_secs(30), hub.shutdown())
            .await
            .expect("shutdown hung");
        assert_eq!(provider.live_handles(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_pauses_share_one_park() {
        let provider = Arc::new(MockProvider::new().with_pause_delay(Duration::from_millis(200)));
        let hub = hub(&provider);
        let (_id, mut rx) = open_and_subscribe(&hub, "COM3@9600#h1", "c1").await;
        let mut events = hub.subscribe_events();

        let first = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.pause(&com3()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(hub.pause(&com3()).await.unwrap());
        // The second caller only returns once the hardware is parked
        assert_eq!(provider.handle(0).pauses_completed(), 1);
        assert!(first.await.unwrap().unwrap());
        assert_eq!(provider.handle(0).pause_calls(), 1);

        assert!(matches!(
            next(&mut rx).await,
            SinkMessage::Status(SessionStatus::Paused)
        ));
        settle().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(
            events.try_recv().unwrap(),
            HubEvent::Paused {
                key: key("COM3@9600#h1")
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_reader_cleanup_keeps_the_replacement() {
        let provider = Arc::new(MockProvider::new());
        let hub = hub(&provider);
        let id = hub.open(request("COM3@9600#h1", "c1")).await.unwrap();

        let (sink_a, mut rx_a) = ChannelSink::new(16);
        let first = hub.subscribe(id, 0, sink_a).await.unwrap();
        let (sink_b, mut rx_b) = ChannelSink::new(16);
        let second = hub.subscribe(id, 0, sink_b).await.unwrap();
        assert_ne!(first, second);

        // The replaced reader's channel is closed
        let replaced = tokio::time::timeout(Duration::from_secs(2), rx_a.recv())
            .await
            .unwrap();
        assert!(replaced.is_none());

        // Late cleanup from the old reader must not detach the new one
        hub.unsubscribe_reader(id, first).await;
        provider.handle(0).emit(b"still here").await;
        assert_eq!(next_data(&mut rx_b).await, b"still here");
        assert_eq!(hub.session(&com3()).await.unwrap().subscriber_count, 1);

        hub.unsubscribe_reader(id, second).await;
        settle().await;
        assert_eq!(hub.session(&com3()).await.unwrap().subscriber_count, 0);
        assert!(provider.handle(0).is_disposed());
    }

    #[test]
    fn subscription_id_parsing() {
        assert_eq!("sub-7".parse::<SubscriptionId>().unwrap(), SubscriptionId(7));
        assert_eq!("7".parse::<SubscriptionId>().unwrap(), SubscriptionId(7));
        assert!("sub-x".parse::<SubscriptionId>().is_err());
        assert_eq!(SubscriptionId(3).to_string(), "sub-3");
    }
}
