use axum::{
    body::Bytes,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use monitor_hub::{
    ChannelSink, ControlHandler, ErrorBody, MonitorError, MonitorHub, SessionStatus, SinkMessage,
    SubscriptionId,
};

use crate::AppState;
use crate::handlers::{ApiError, TailQuery, parse_subscription};

// =============================================================================
// Control channel: JSON-RPC style requests, responses and notifications
// =============================================================================

pub async fn control_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let control = state.control.clone();
    let capacity = state.sink_capacity;
    ws.on_upgrade(move |socket| handle_control(socket, control, capacity))
}

pub async fn handle_control(socket: WebSocket, control: Arc<ControlHandler>, capacity: usize) {
    let (mut sender, mut receiver) = socket.split();
    let (mut session, mut outbound) = control.connect(capacity);
    info!("Control connection opened for {}", session.client_id());

    loop {
        tokio::select! {
            Some(message) = outbound.recv() => {
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode control message: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => session.submit(text.as_str()),
                Some(Ok(Message::Binary(_))) => {
                    debug!("Binary frame ignored on control channel");
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Control socket error: {}", e);
                    break;
                }
            },
        }
    }

    let client_id = session.client_id().clone();
    session.close().await;
    info!("Control connection for {} closed", client_id);
}

// =============================================================================
// Binary duplex channel for one subscription
// =============================================================================

pub async fn monitor_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TailQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let id = parse_subscription(&id)?;
    if state.hub().subscription_key(id).await.is_none() {
        return Err(MonitorError::MonitorNotFound(id.to_string()).into());
    }

    let hub = state.hub().clone();
    let capacity = state.sink_capacity;
    Ok(ws
        .on_upgrade(move |socket| handle_monitor(socket, hub, id, query.tail, capacity))
        .into_response())
}

fn error_frame(err: &MonitorError) -> Message {
    Message::Text(json!({ "error": ErrorBody::from(err) }).to_string().into())
}

/// Binary frames in are writes, binary frames out are monitor output, and
/// status changes go out as JSON text frames. Hanging up unsubscribes.
pub async fn handle_monitor(
    socket: WebSocket,
    hub: MonitorHub,
    id: SubscriptionId,
    tail: usize,
    capacity: usize,
) {
    let (mut sender, mut receiver) = socket.split();

    let (sink, mut rx) = ChannelSink::new(capacity);
    let reader = match hub.subscribe(id, tail, sink).await {
        Ok(reader) => reader,
        Err(e) => {
            warn!("WebSocket subscribe for {} failed: {}", id, e);
            let _ = sender.send(error_frame(&e)).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    info!("WebSocket reader attached to {}", id);

    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(SinkMessage::Data(bytes)) => {
                    if sender
                        .send(Message::Binary(Bytes::copy_from_slice(&bytes)))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(SinkMessage::Status(status)) => {
                    let stopped = matches!(status, SessionStatus::Stopped { .. });
                    match serde_json::to_string(&status) {
                        Ok(json) => {
                            if sender.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Failed to encode status: {}", e),
                    }
                    if stopped {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
                None => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Binary(data))) => {
                    if let Err(e) = hub.write(id, &data).await {
                        debug!("Write on {} failed: {}", id, e);
                        if sender.send(error_frame(&e)).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Text(_))) => {
                    debug!("Text frame ignored on monitor channel {}", id);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Monitor socket error on {}: {}", id, e);
                    break;
                }
            },
        }
    }

    hub.unsubscribe_reader(id, reader).await;
    info!("WebSocket reader for {} detached", id);
}
