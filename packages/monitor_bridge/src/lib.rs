//! Monitor Bridge - HTTP and WebSocket transports for the monitor hub
//!
//! Wires a [`MonitorHub`], an [`AttachmentRegistry`] and a port discovery
//! watcher into one axum router. The `bridge` binary serves it and exits once
//! the registry reports that every client has gone.

pub mod config;
pub mod handlers;
pub mod provider;
pub mod websocket;

use axum::{
    Router,
    routing::{delete, get, post},
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use monitor_hub::{
    AttachmentRegistry, ControlHandler, DiscoveryWatcher, IdleCallback, MonitorAcquirer,
    MonitorHub, MonitorProvider,
};

use crate::config::BridgeConfig;

#[derive(Clone)]
pub struct AppState {
    pub control: Arc<ControlHandler>,
    pub discovery: Arc<DiscoveryWatcher>,
    /// Backlog per transport connection.
    pub sink_capacity: usize,
}

impl AppState {
    pub fn hub(&self) -> &MonitorHub {
        self.control.hub()
    }

    pub fn registry(&self) -> &AttachmentRegistry {
        self.control.registry()
    }
}

/// Assemble hub, registry and discovery around `provider`.
pub async fn build_state(
    config: &BridgeConfig,
    provider: Arc<dyn MonitorProvider>,
    on_idle: Option<IdleCallback>,
) -> AppState {
    let discovery = Arc::new(DiscoveryWatcher::new(config.enforce_discovery));
    let acquirer = MonitorAcquirer::new(provider, discovery.clone(), config.priming_timeout);
    let hub = MonitorHub::new(acquirer, config.hub.clone());

    let registry = AttachmentRegistry::new();
    registry.configure(config.attachments.clone(), on_idle).await;

    AppState {
        control: ControlHandler::new(hub, registry),
        discovery,
        sink_capacity: config.sink_capacity,
    }
}

pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/control", get(websocket::control_handler))
        .route("/monitors", post(handlers::open_monitor_handler))
        .route("/monitors/{id}", delete(handlers::close_monitor_handler))
        .route("/monitors/{id}/ws", get(websocket::monitor_handler))
        .route("/monitors/{id}/stream", get(handlers::stream_monitor_handler))
        .route(
            "/ports",
            get(handlers::list_ports_handler).put(handlers::replace_ports_handler),
        )
        .route("/ports/pause", post(handlers::pause_port_handler))
        .route("/ports/resume", post(handlers::resume_port_handler))
        .route("/attach", post(handlers::attach_handler))
        .route("/heartbeat", post(handlers::heartbeat_handler))
        .route("/detach", post(handlers::detach_handler))
        .route("/sessions", get(handlers::list_sessions_handler));

    Router::new()
        .route("/health", get(handlers::health_handler))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Stop liveness timers, then dispose every upstream monitor.
pub async fn shutdown(state: &AppState) {
    state.registry().shutdown().await;
    state.hub().shutdown().await;
}
