//! HTTP and WebSocket handlers.
//!
//! Defines `AppState`, the shared state carried through axum extractors,
//! and the error response used by both transports.

pub mod health;
pub mod http;
pub mod websocket;

pub use health::{health_handler, liveness_handler, readiness_handler};
pub use http::dispatch_handler;
pub use websocket::{ws_namespace_handler, ws_root_handler};

use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use switchyard_core::DispatchError;

use super::{ConnectionRegistry, NetworkConfig, ShutdownController};
use crate::service::Application;

/// Shared state passed to all axum handlers via `State` extraction.
#[derive(Clone)]
pub struct AppState {
    pub app: Application,
    /// Open sockets.
    pub registry: Arc<ConnectionRegistry>,
    /// Health state and in-flight tracking.
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<NetworkConfig>,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    #[must_use]
    pub fn new(app: Application, config: NetworkConfig) -> Self {
        Self {
            app,
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown: Arc::new(ShutdownController::new()),
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }
}

/// A dispatch error rendered for an HTTP caller.
///
/// Client errors carry `{"status", "message"}`; server errors carry only
/// the generic `{"message"}`.
#[derive(Debug)]
pub struct ErrorResponse(pub DispatchError);

impl ErrorResponse {
    #[must_use]
    pub fn body(&self) -> serde_json::Value {
        let err = &self.0;
        if err.is_client_error() {
            json!({"status": err.status(), "message": err.public_message()})
        } else {
            json!({"message": err.public_message()})
        }
    }
}

impl From<DispatchError> for ErrorResponse {
    fn from(err: DispatchError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.body())).into_response()
    }
}
