//! HTTP and WebSocket surface
//!
//! | Path | Description |
//! |------|-------------|
//! | `GET /ws/audio` | WebSocket, one binary `AVF1` frame per snapshot |
//! | `GET /api/devices` | Input devices |
//! | `GET /api/state` | Service state and latest metrics |
//! | `POST /api/device` | Switch input device |
//! | `POST /api/options` | Change analysis or capture options |

mod broadcast;
mod handler;

pub use broadcast::{Broadcaster, ClientSession, FrameReceiver, SessionStats};

use crate::pipeline::Pipeline;
use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;
use thiserror::Error;

/// Server error types
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("Server I/O error: {0}")]
    Serve(#[from] std::io::Error),
}

pub fn router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/ws/audio", get(handler::ws_handler))
        .route("/api/devices", get(handler::list_devices))
        .route("/api/state", get(handler::get_state))
        .route("/api/device", post(handler::select_device))
        .route("/api/options", post(handler::update_options))
        .with_state(pipeline)
}

/// Serve until the pipeline's shutdown token is cancelled
pub async fn run_server(host: &str, port: u16, pipeline: Arc<Pipeline>) -> Result<(), ServerError> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;

    log::info!("Listening on http://{}", addr);
    log::info!("Audio stream at ws://{}/ws/audio", addr);

    let shutdown = pipeline.shutdown_token();
    axum::serve(listener, router(pipeline))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            log::info!("HTTP server shutting down");
        })
        .await?;

    Ok(())
}
