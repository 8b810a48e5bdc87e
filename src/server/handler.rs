//! Request and WebSocket session handling

use crate::audio::{DeviceInfo, list_input_devices};
use crate::config::ConfigUpdate;
use crate::pipeline::{Pipeline, PipelineError};
use crate::protocol::{CommandResponse, DeviceRequest, StatusResponse};
use crate::transport::frame_id;
use axum::Json;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use jiff::Timestamp;
use std::sync::Arc;
use std::time::Duration;

/// A client that cannot take a frame within this long is disconnected
const SEND_TIMEOUT: Duration = Duration::from_millis(250);

type CommandReply = (StatusCode, Json<CommandResponse>);

pub(super) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(pipeline): State<Arc<Pipeline>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, pipeline))
}

async fn handle_socket(socket: WebSocket, pipeline: Arc<Pipeline>) {
    let broadcaster = pipeline.broadcaster().clone();
    let shutdown = pipeline.shutdown_token();
    let mut session = broadcaster.register();
    let (mut sender, mut receiver) = socket.split();

    log::info!("WebSocket client {} connected", session.id);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = tokio::time::timeout(SEND_TIMEOUT, sender.send(Message::Close(None))).await;
                break;
            }
            frame = session.frames.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                let frame_id = frame_id(&frame).unwrap_or(0);
                let send = sender.send(Message::Binary(frame.to_vec()));
                match tokio::time::timeout(SEND_TIMEOUT, send).await {
                    Ok(Ok(())) => session.stats.record_sent(frame_id),
                    Ok(Err(e)) => {
                        log::debug!("WebSocket send to {} failed: {}", session.id, e);
                        break;
                    }
                    Err(_) => {
                        log::warn!("WebSocket client {} stalled, disconnecting", session.id);
                        break;
                    }
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    log::debug!("WebSocket receive from {} failed: {}", session.id, e);
                    break;
                }
                // Clients only listen; anything else is ignored
                Some(Ok(_)) => {}
            }
        }
    }

    broadcaster.unregister(session.id);
    log::info!(
        "WebSocket client {} disconnected ({} frames sent, {} dropped, last frame {})",
        session.id,
        session.stats.sent(),
        session.stats.dropped(),
        session.stats.last_frame_id()
    );
}

pub(super) async fn list_devices() -> Result<Json<Vec<DeviceInfo>>, CommandReply> {
    let devices = tokio::task::spawn_blocking(list_input_devices)
        .await
        .map_err(|e| internal_error(e.to_string()))?
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(devices))
}

pub(super) async fn get_state(State(pipeline): State<Arc<Pipeline>>) -> Json<StatusResponse> {
    let state = pipeline.store().get();
    Json(StatusResponse::from_state(&state, Timestamp::now()))
}

pub(super) async fn select_device(
    State(pipeline): State<Arc<Pipeline>>,
    Json(request): Json<DeviceRequest>,
) -> CommandReply {
    if request.device_id.is_none() && request.device_name.is_none() {
        return (
            StatusCode::BAD_REQUEST,
            Json(CommandResponse::error("device_id or device_name is required")),
        );
    }

    let update = ConfigUpdate {
        device_id: request.device_id,
        device_name: request.device_name,
        ..Default::default()
    };
    command_reply(pipeline.reconfigure(&update).await)
}

pub(super) async fn update_options(
    State(pipeline): State<Arc<Pipeline>>,
    Json(update): Json<ConfigUpdate>,
) -> CommandReply {
    command_reply(pipeline.reconfigure(&update).await)
}

fn command_reply<T>(result: Result<T, PipelineError>) -> CommandReply {
    match result {
        Ok(_) => (StatusCode::OK, Json(CommandResponse::ok())),
        Err(PipelineError::Config(e)) => {
            log::warn!("Rejected configuration change: {}", e);
            (StatusCode::BAD_REQUEST, Json(CommandResponse::error(e.to_string())))
        }
        Err(e) => {
            log::error!("Configuration change failed: {}", e);
            internal_error(e.to_string())
        }
    }
}

fn internal_error(message: String) -> CommandReply {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(CommandResponse::error(message)),
    )
}
