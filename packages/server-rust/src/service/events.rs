//! Process-wide event stream.
//!
//! The application publishes every surfaced error, every lag sample, and
//! every shed invocation on a broadcast channel. Subscribers that fall behind
//! lose the oldest events (`RecvError::Lagged`); publishing never blocks.

use std::sync::Arc;
use std::time::Duration;

use switchyard_core::{DispatchError, ErrorReporter};
use tokio::sync::broadcast;
use tracing::{error, warn};

/// An error surfaced to a caller, as seen by operators.
#[derive(Debug)]
pub struct ErrorEvent {
    /// Where it happened: endpoint label, connection, background task.
    pub origin: String,
    /// HTTP-equivalent status.
    pub status: u16,
    /// The full error including any internal cause.
    pub error: DispatchError,
}

/// Typed application events.
#[derive(Debug, Clone)]
pub enum AppEvent {
    Error(Arc<ErrorEvent>),
    /// One scheduler lag sample.
    Lag { lag: Duration, overloaded: bool },
    /// An invocation rejected by load shedding.
    Shed { lag: Duration, endpoint: Arc<str> },
}

/// Sender side of the application event stream. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AppEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: AppEvent) {
        let _ = self.tx.send(event);
    }

    /// Log an error and publish it on the stream.
    pub fn error(&self, origin: &str, error: DispatchError) {
        let status = error.status();
        if error.is_client_error() {
            warn!(origin, status, "{error}");
        } else {
            error!(
                origin,
                status,
                escalate = error.should_escalate(),
                "{}",
                error.diagnostic()
            );
        }
        self.emit(AppEvent::Error(Arc::new(ErrorEvent {
            origin: origin.to_string(),
            status,
            error,
        })));
    }
}

impl ErrorReporter for EventBus {
    fn report(&self, origin: &str, error: DispatchError) {
        self.error(origin, error);
    }
}
