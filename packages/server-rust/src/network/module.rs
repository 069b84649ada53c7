//! Network module with deferred startup lifecycle.
//!
//! `new()` creates shared state, `start()` binds the TCP listener, and
//! `serve()` accepts connections until the shutdown signal fires.

use std::future::Future;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::connection::{ConnectionRegistry, OutboundMessage};
use super::handlers::{
    dispatch_handler, health_handler, liveness_handler, readiness_handler, ws_namespace_handler,
    ws_root_handler, AppState,
};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use crate::service::Application;

/// Assembles the axum router.
///
/// Routes:
/// - `GET /health`, `/health/live`, `/health/ready`
/// - `GET /ws` and `GET /ws/{namespace}` for socket upgrades
/// - everything else is dispatched to the application's mounted routers
#[must_use]
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .route("/ws", get(ws_root_handler))
        .route("/ws/{*namespace}", get(ws_namespace_handler))
        .fallback(dispatch_handler)
        .layer(DefaultBodyLimit::max(state.config.max_body_bytes))
        .layer(build_http_layers())
        .with_state(state)
}

/// Manages the HTTP/WebSocket server lifecycle for one [`Application`].
pub struct NetworkModule {
    state: AppState,
    listener: Option<TcpListener>,
}

impl NetworkModule {
    /// Creates the module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig, app: Application) -> Self {
        Self {
            state: AppState::new(app, config),
            listener: None,
        }
    }

    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.state.registry)
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.state.shutdown)
    }

    /// Binds the TCP listener. Returns the bound port, which is
    /// OS-assigned when the configured port is 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let config = &self.state.config;
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("TCP listener bound to {}:{}", config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves connections until `shutdown` resolves.
    ///
    /// On shutdown the health state moves to Draining, every socket is sent
    /// a Close frame, and in-flight invocations get up to `drain_timeout`
    /// to finish before the state moves to Stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first or the server hits
    /// a fatal I/O error.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let state = self.state;
        let router = build_router(state.clone());

        let mut sampler = state.app.start_load_sampler();
        state.shutdown.set_ready();
        info!("Serving HTTP and WebSocket connections");

        let draining = {
            let state = state.clone();
            async move {
                shutdown.await;
                state.shutdown.trigger_shutdown();
                close_sockets(&state.registry);
            }
        };
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(draining)
            .await;

        if state.shutdown.wait_for_drain(state.config.drain_timeout).await {
            info!("All in-flight invocations drained");
        } else {
            warn!(
                in_flight = state.shutdown.in_flight_count(),
                "Drain timeout expired with invocations still running"
            );
        }
        sampler.stop().await;
        served?;
        Ok(())
    }
}

/// Queue a Close frame on every open socket.
fn close_sockets(registry: &ConnectionRegistry) {
    let handles = registry.drain_all();
    if !handles.is_empty() {
        info!("Closing {} sockets", handles.len());
    }
    for handle in &handles {
        // A full queue means the socket is already stuck; its reader ends
        // when the peer goes away.
        let _ = handle.try_send(OutboundMessage::Close(Some(
            "server shutting down".to_string(),
        )));
    }
}
