use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::stream;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use tracing::{debug, info};

use monitor_hub::protocol::{AttachParams, PortParams, TokenParams, invalid_request};
use monitor_hub::{
    ChannelSink, ClientId, DetectedPort, ErrorBody, MonitorError, MonitorHub, MonitorKey,
    OpenMode, PortIdentifier, ReaderId, SessionStatus, SinkMessage, SubscriptionId,
};

use crate::AppState;

/// Client id used for HTTP opens that don't name one.
const HTTP_CLIENT: &str = "http";

/// A hub error rendered as `ErrorBody` with its status.
#[derive(Debug)]
pub struct ApiError(pub MonitorError);

impl From<MonitorError> for ApiError {
    fn from(err: MonitorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(invalid_request(message))).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct TailQuery {
    #[serde(default)]
    pub tail: usize,
}

pub fn parse_subscription(raw: &str) -> Result<SubscriptionId, ApiError> {
    raw.parse::<SubscriptionId>().map_err(ApiError)
}

// =============================================================================
// Health & introspection
// =============================================================================

pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.hub().sessions().await.len();
    let attachments = state.registry().len().await;
    Json(json!({
        "status": "ok",
        "sessions": sessions,
        "attachments": attachments,
    }))
}

pub async fn list_sessions_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub().sessions().await)
}

pub async fn list_ports_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.discovery.snapshot())
}

/// Replace the detected-port set with whatever discovery last reported.
pub async fn replace_ports_handler(
    State(state): State<AppState>,
    Json(ports): Json<Vec<DetectedPort>>,
) -> impl IntoResponse {
    let count = ports.len();
    state.discovery.replace(ports);
    Json(json!({ "ports": count }))
}

// =============================================================================
// Monitor sessions
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenMonitorRequest {
    pub port: String,
    #[serde(default)]
    pub mode: OpenMode,
    #[serde(default)]
    pub fqbn: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

pub async fn open_monitor_handler(
    State(state): State<AppState>,
    Json(req): Json<OpenMonitorRequest>,
) -> Result<Response, ApiError> {
    let key = MonitorKey::parse(&req.port)?;
    let client_id = ClientId::new(req.client_id.unwrap_or_else(|| HTTP_CLIENT.to_string()));
    let id = state
        .control
        .open(key.clone(), client_id, req.mode, req.fqbn)
        .await?;
    Ok(Json(json!({ "subscriptionId": id, "key": key.to_string() })).into_response())
}

pub async fn close_monitor_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_subscription(&id)?;
    state.hub().close(id).await?;
    Ok(Json(json!({ "closed": true })).into_response())
}

/// Unsubscribes when the response body is dropped, unless another reader
/// has taken the subscription over since.
struct UnsubscribeOnDrop {
    hub: MonitorHub,
    id: SubscriptionId,
    reader: ReaderId,
}

impl Drop for UnsubscribeOnDrop {
    fn drop(&mut self) {
        let hub = self.hub.clone();
        let id = self.id;
        let reader = self.reader;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                hub.unsubscribe_reader(id, reader).await;
                debug!("HTTP reader for {} went away", id);
            });
        }
    }
}

/// Chunked reader: replays `tail` bytes, then follows live output until the
/// session stops or the client hangs up.
pub async fn stream_monitor_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TailQuery>,
) -> Result<Response, ApiError> {
    let id = parse_subscription(&id)?;
    let hub = state.hub().clone();

    let (sink, rx) = ChannelSink::new(state.sink_capacity);
    let reader = hub.subscribe(id, query.tail, sink).await?;
    info!("HTTP reader attached to {}", id);

    let guard = UnsubscribeOnDrop { hub, id, reader };
    let body = stream::unfold((rx, guard), |(mut rx, guard)| async move {
        loop {
            match rx.recv().await {
                Some(SinkMessage::Data(bytes)) => {
                    return Some((
                        Ok::<_, Infallible>(Bytes::copy_from_slice(&bytes)),
                        (rx, guard),
                    ));
                }
                Some(SinkMessage::Status(SessionStatus::Stopped { reason })) => {
                    debug!("Stream for {} ended: {}", guard.id, reason);
                    return None;
                }
                Some(SinkMessage::Status(_)) => continue,
                None => return None,
            }
        }
    });

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(body),
    )
        .into_response())
}

pub async fn pause_port_handler(
    State(state): State<AppState>,
    Json(req): Json<PortParams>,
) -> Result<Response, ApiError> {
    let port = PortIdentifier::parse(&req.port)?;
    let paused = state.hub().pause(&port).await?;
    Ok(Json(json!({ "paused": paused })).into_response())
}

pub async fn resume_port_handler(
    State(state): State<AppState>,
    Json(req): Json<PortParams>,
) -> Result<Response, ApiError> {
    let port = PortIdentifier::parse(&req.port)?;
    let resumed = state.hub().resume(&port).await?;
    Ok(Json(json!({ "resumed": resumed })).into_response())
}

// =============================================================================
// Attachments
// =============================================================================

/// The body is optional; an empty one attaches anonymously.
pub async fn attach_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let params: AttachParams = if body.is_empty() {
        AttachParams::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(params) => params,
            Err(e) => return bad_request(format!("bad attach body: {e}")),
        }
    };
    let token = state
        .registry()
        .attach(params.client_id.map(ClientId::new))
        .await;
    Json(json!({ "token": token })).into_response()
}

pub async fn heartbeat_handler(
    State(state): State<AppState>,
    Json(req): Json<TokenParams>,
) -> Result<Response, ApiError> {
    state.registry().heartbeat(&req.token).await?;
    Ok(Json(json!({ "ok": true })).into_response())
}

pub async fn detach_handler(
    State(state): State<AppState>,
    Json(req): Json<TokenParams>,
) -> Result<Response, ApiError> {
    let remaining = state.registry().detach(&req.token).await?;
    Ok(Json(json!({ "remaining": remaining })).into_response())
}
