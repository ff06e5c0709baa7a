//! Control protocol handler.
//!
//! Maps control-channel requests onto the hub and the attachment registry,
//! checks protocol capabilities before the first acquisition, and fans hub
//! and registry events out to every connected control peer.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::attachment::{AttachmentEvent, AttachmentRegistry};
use crate::error::{ErrorBody, MonitorError};
use crate::hub::{ClientId, HubEvent, MonitorHub, OpenMode, OpenRequest, SubscriptionId};
use crate::port::{MonitorKey, PortIdentifier};
use crate::protocol::{
    ControlRequest, Notification, OutboundMessage, RpcRequest, RpcResponse, invalid_request,
    methods,
};
use crate::provider::ProtocolSettings;
use crate::sink::{MonitorSink, SessionStatus, SinkMessage};

const NOTIFICATION_CAPACITY: usize = 256;

pub struct ControlHandler {
    hub: MonitorHub,
    registry: AttachmentRegistry,
    capabilities: Mutex<HashMap<String, ProtocolSettings>>,
    notifications: broadcast::Sender<Notification>,
    forwarders: Vec<JoinHandle<()>>,
    next_peer: AtomicU64,
}

impl Drop for ControlHandler {
    fn drop(&mut self) {
        for forwarder in &self.forwarders {
            forwarder.abort();
        }
    }
}

fn hub_notification(event: HubEvent) -> Notification {
    match event {
        HubEvent::Started { key } => {
            Notification::new(methods::STARTED, json!({ "key": key.to_string() }))
        }
        HubEvent::Stopped { key, reason } => Notification::new(
            methods::STOPPED,
            json!({ "key": key.to_string(), "reason": reason }),
        ),
        HubEvent::Paused { key } => {
            Notification::new(methods::PAUSED, json!({ "key": key.to_string() }))
        }
        HubEvent::Resumed { key } => {
            Notification::new(methods::RESUMED, json!({ "key": key.to_string() }))
        }
        HubEvent::BaudrateChanged { previous, key } => Notification::new(
            methods::BAUDRATE_CHANGED,
            json!({
                "previous": previous.to_string(),
                "key": key.to_string(),
                "baudrate": key.baudrate,
            }),
        ),
    }
}

fn attachment_notification(event: AttachmentEvent) -> Notification {
    let method = match &event {
        AttachmentEvent::Attached { .. } => methods::ATTACHED,
        AttachmentEvent::Detached { .. } => methods::DETACHED,
        AttachmentEvent::Idle => methods::IDLE,
    };
    let params = serde_json::to_value(&event).unwrap_or(Value::Null);
    Notification::new(method, params)
}

/// Forward a broadcast source into the notification channel until it closes.
fn forward<E, F>(mut rx: broadcast::Receiver<E>, tx: broadcast::Sender<Notification>, map: F) -> JoinHandle<()>
where
    E: Clone + Send + 'static,
    F: Fn(E) -> Notification + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let _ = tx.send(map(event));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Notification forwarder lagged by {} event(s)", n);
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

impl ControlHandler {
    pub fn new(hub: MonitorHub, registry: AttachmentRegistry) -> Arc<Self> {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let forwarders = vec![
            forward(hub.subscribe_events(), notifications.clone(), hub_notification),
            forward(
                registry.subscribe_events(),
                notifications.clone(),
                attachment_notification,
            ),
        ];
        Arc::new(Self {
            hub,
            registry,
            capabilities: Mutex::new(HashMap::new()),
            notifications,
            forwarders,
            next_peer: AtomicU64::new(1),
        })
    }

    pub fn hub(&self) -> &MonitorHub {
        &self.hub
    }

    pub fn registry(&self) -> &AttachmentRegistry {
        &self.registry
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Reject an open that the protocol cannot serve. Settings are looked up
    /// once per protocol and cached.
    pub async fn check_capabilities(&self, key: &MonitorKey) -> Result<(), MonitorError> {
        let protocol = key.port.protocol.as_str();
        let cached = self.capabilities.lock().await.get(protocol).cloned();
        let settings = match cached {
            Some(settings) => settings,
            None => {
                let settings = self.hub.describe_settings(protocol).await?;
                debug!("Protocol {} settings: {:?}", protocol, settings);
                self.capabilities
                    .lock()
                    .await
                    .insert(protocol.to_string(), settings.clone());
                settings
            }
        };

        if settings.requires_baudrate && key.baudrate.is_none() {
            return Err(MonitorError::BaudrateRequired(protocol.to_string()));
        }
        Ok(())
    }

    /// Open `key` for `client_id` after the capability check.
    pub async fn open(
        &self,
        key: MonitorKey,
        client_id: ClientId,
        mode: OpenMode,
        fqbn: Option<String>,
    ) -> Result<SubscriptionId, MonitorError> {
        self.check_capabilities(&key).await?;
        self.hub
            .open(OpenRequest {
                key,
                client_id,
                mode,
                fqbn,
            })
            .await
    }

    /// Execute one request on behalf of `peer`.
    pub async fn dispatch(&self, peer: &ControlPeer, request: ControlRequest) -> Result<Value, MonitorError> {
        match request {
            ControlRequest::Open(params) => {
                let key = MonitorKey::parse(&params.port)?;
                let id = self
                    .open(key.clone(), peer.client_id.clone(), params.mode, params.fqbn)
                    .await?;
                Ok(json!({ "subscriptionId": id, "key": key.to_string() }))
            }
            ControlRequest::Subscribe(params) => {
                let sink = Arc::new(PeerSink {
                    subscription: params.subscription_id,
                    outbound: peer.outbound.clone(),
                });
                self.hub
                    .subscribe(params.subscription_id, params.tail_bytes, sink)
                    .await?;
                Ok(json!({ "subscribed": true }))
            }
            ControlRequest::Unsubscribe(params) => {
                self.hub.unsubscribe(params.subscription_id).await;
                Ok(json!({ "unsubscribed": true }))
            }
            ControlRequest::Write(params) => {
                let written = self
                    .hub
                    .write(params.subscription_id, params.data.as_bytes())
                    .await?;
                Ok(json!({ "bytesWritten": written }))
            }
            ControlRequest::Close(params) => {
                self.hub.close(params.subscription_id).await?;
                Ok(json!({ "closed": true }))
            }
            ControlRequest::Pause(params) => {
                let port = PortIdentifier::parse(&params.port)?;
                Ok(json!(self.hub.pause(&port).await?))
            }
            ControlRequest::Resume(params) => {
                let port = PortIdentifier::parse(&params.port)?;
                Ok(json!(self.hub.resume(&port).await?))
            }
            ControlRequest::UpdateBaudrate(params) => {
                let key = self
                    .hub
                    .update_baudrate(params.subscription_id, params.baudrate)
                    .await?;
                Ok(json!({ "key": key.to_string() }))
            }
            ControlRequest::Attach(params) => {
                let token = self.registry.attach(params.client_id.map(ClientId)).await;
                peer.tokens.lock().await.push(token.clone());
                Ok(json!({ "token": token }))
            }
            ControlRequest::Heartbeat(params) => {
                self.registry.heartbeat(&params.token).await?;
                Ok(json!({ "ok": true }))
            }
            ControlRequest::Detach(params) => {
                let remaining = self.registry.detach(&params.token).await?;
                peer.tokens.lock().await.retain(|t| *t != params.token);
                Ok(json!({ "remaining": remaining }))
            }
            ControlRequest::ListSessions => Ok(json!(self.hub.sessions().await)),
        }
    }

    /// Parse, dispatch and wrap into a response. Never fails.
    pub async fn handle(&self, peer: &ControlPeer, request: RpcRequest) -> RpcResponse {
        let RpcRequest { id, method, params } = request;
        let parsed = match ControlRequest::parse(&method, params) {
            Ok(parsed) => parsed,
            Err(body) => return RpcResponse::err(id, body),
        };
        debug!("{} -> {}", peer.client_id, method);
        match self.dispatch(peer, parsed).await {
            Ok(result) => RpcResponse::ok(id, result),
            Err(e) => {
                debug!("{} from {} failed: {}", method, peer.client_id, e);
                RpcResponse::err(id, ErrorBody::from(&e))
            }
        }
    }

    /// Release everything a peer held. Safe to call more than once.
    pub async fn disconnect(&self, peer: &ControlPeer) {
        let released = self.hub.release_client(&peer.client_id).await;
        let tokens: Vec<String> = std::mem::take(&mut *peer.tokens.lock().await);
        for token in tokens {
            // Already pruned is fine
            let _ = self.registry.detach(&token).await;
        }
        info!(
            "Control peer {} disconnected ({} subscription(s) released)",
            peer.client_id, released
        );
    }

    /// Start a session for a new control connection.
    pub fn connect(self: &Arc<Self>, capacity: usize) -> (ControlSession, mpsc::Receiver<OutboundMessage>) {
        let n = self.next_peer.fetch_add(1, Ordering::SeqCst);
        let client_id = ClientId(format!("control-{n}"));
        ControlSession::new(self.clone(), client_id, capacity)
    }
}

/// A connected control-channel client.
pub struct ControlPeer {
    pub client_id: ClientId,
    outbound: mpsc::Sender<OutboundMessage>,
    tokens: Mutex<Vec<String>>,
}

/// Delivers a control-channel subscription's output as notifications.
/// Device bytes travel base64-encoded so chunk boundaries and non-text
/// output survive the JSON channel.
struct PeerSink {
    subscription: SubscriptionId,
    outbound: mpsc::Sender<OutboundMessage>,
}

impl MonitorSink for PeerSink {
    fn deliver(&self, message: SinkMessage) {
        let notification = match message {
            SinkMessage::Data(bytes) => Notification::new(
                methods::DATA,
                json!({
                    "subscriptionId": self.subscription,
                    "encoding": "base64",
                    "data": BASE64.encode(&bytes),
                }),
            ),
            SinkMessage::Status(status) => {
                let mut params = serde_json::to_value(&status).unwrap_or(Value::Null);
                if let Value::Object(map) = &mut params {
                    map.insert("subscriptionId".into(), json!(self.subscription));
                }
                if let SessionStatus::Stopped { reason } = &status {
                    debug!("{} stopped: {}", self.subscription, reason);
                }
                Notification::new(methods::STATUS, params)
            }
        };
        if self
            .outbound
            .try_send(OutboundMessage::Notification(notification))
            .is_err()
        {
            warn!("Control peer lagging, dropped output for {}", self.subscription);
        }
    }
}

/// One control connection: runs requests concurrently and tears everything
/// down on close, including requests still in flight.
pub struct ControlSession {
    handler: Arc<ControlHandler>,
    peer: Arc<ControlPeer>,
    in_flight: JoinSet<()>,
    broadcast_forwarder: JoinHandle<()>,
}

impl ControlSession {
    pub fn new(
        handler: Arc<ControlHandler>,
        client_id: ClientId,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let peer = Arc::new(ControlPeer {
            client_id,
            outbound: outbound.clone(),
            tokens: Mutex::new(Vec::new()),
        });

        let mut notifications = handler.subscribe_notifications();
        let broadcast_forwarder = tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(note) => {
                        if outbound.send(OutboundMessage::Notification(note)).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Control peer missed {} notification(s)", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        (
            Self {
                handler,
                peer,
                in_flight: JoinSet::new(),
                broadcast_forwarder,
            },
            rx,
        )
    }

    pub fn client_id(&self) -> &ClientId {
        &self.peer.client_id
    }

    /// Handle one raw text frame. Malformed frames get an error response
    /// with a null id.
    pub fn submit(&mut self, text: &str) {
        // Reap finished requests
        while self.in_flight.try_join_next().is_some() {}

        let request: RpcRequest = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(e) => {
                let response = RpcResponse::err(Value::Null, invalid_request(format!("malformed request: {e}")));
                if self
                    .peer
                    .outbound
                    .try_send(OutboundMessage::Response(response))
                    .is_err()
                {
                    warn!("Could not report malformed request to {}", self.peer.client_id);
                }
                return;
            }
        };

        let handler = self.handler.clone();
        let peer = self.peer.clone();
        self.in_flight.spawn(async move {
            let response = handler.handle(&peer, request).await;
            let _ = peer.outbound.send(OutboundMessage::Response(response)).await;
        });
    }

    /// Abort in-flight requests, then release everything the peer held.
    pub async fn close(mut self) {
        self.in_flight.shutdown().await;
        self.broadcast_forwarder.abort();
        self.handler.disconnect(&self.peer).await;
    }
}
