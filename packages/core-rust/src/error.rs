//! Dispatch error taxonomy.
//!
//! Every failure that leaves the execution pipeline is a [`DispatchError`].
//! Variants split into two kinds:
//!
//! - **client errors**: caused by the caller. They carry a status in the
//!   4xx range and a message that is safe to show to the caller.
//! - **server errors**: caused by the process or a collaborator. Their
//!   caller-visible message is generic; the cause is kept for the internal
//!   error stream only.

use std::fmt;

/// Generic message shown to callers for unexpected server failures.
pub const INTERNAL_MESSAGE: &str = "Internal server error";

/// Coarse classification of a [`DispatchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller-caused; status and message may be exposed.
    Client,
    /// Server-caused; only a generic message may be exposed.
    Server,
}

/// Errors produced while resolving or executing an endpoint.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Generic caller error with an explicit status (400 unless stated).
    #[error("{message}")]
    Client { status: u16, message: String },
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    /// Unmatched route, or a response view that produced nothing.
    #[error("{0}")]
    NotFound(String),
    #[error("Method {method} is not supported for {path} endpoint")]
    MethodNotAllowed { method: String, path: String },
    #[error("{0}")]
    UnsupportedMediaType(String),
    #[error("{0}")]
    TooManyRequests(String),
    /// Load shedding rejection, carrying the observed scheduler lag.
    #[error("Server is too busy, scheduler lag is {lag_ms}ms")]
    ServiceUnavailable { lag_ms: u64 },
    /// The per-invocation deadline expired.
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    /// Unexpected failure. `message` is what the caller sees.
    #[error("{message}")]
    Internal {
        message: String,
        #[source]
        cause: Option<anyhow::Error>,
        /// Whether operators should be alerted loudly.
        escalate: bool,
    },
}

impl DispatchError {
    /// Client error with status 400.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::client(400, message)
    }

    /// Client error with an explicit status.
    pub fn client(status: u16, message: impl Into<String>) -> Self {
        Self::Client {
            status,
            message: message.into(),
        }
    }

    /// The no-route error for a concrete request path.
    pub fn endpoint_not_found(path: &str) -> Self {
        Self::NotFound(format!("Endpoint for {path} does not exist"))
    }

    /// The error for a response view that rendered nothing.
    #[must_use]
    pub fn resource_not_found() -> Self {
        Self::NotFound("Resource not found".to_string())
    }

    /// Server error with a caller-safe message and an optional cause.
    pub fn internal(message: impl Into<String>, cause: Option<anyhow::Error>) -> Self {
        Self::Internal {
            message: message.into(),
            cause,
            escalate: false,
        }
    }

    /// Server error flagged for loud escalation.
    pub fn escalated(message: impl Into<String>, cause: anyhow::Error) -> Self {
        Self::Internal {
            message: message.into(),
            cause: Some(cause),
            escalate: true,
        }
    }

    /// Recovers a `DispatchError` carried inside an `anyhow::Error`, or wraps
    /// any other failure as an escalated internal error.
    ///
    /// `what` names the failed step and ends up in the generic message
    /// (`"Failed to execute <what>"`).
    #[must_use]
    pub fn from_anyhow(err: anyhow::Error, what: &str) -> Self {
        match err.downcast::<DispatchError>() {
            Ok(dispatch) => dispatch,
            Err(other) => Self::escalated(format!("Failed to execute {what}"), other),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } | Self::Internal { .. } => ErrorKind::Server,
            _ => ErrorKind::Client,
        }
    }

    #[must_use]
    pub fn is_client_error(&self) -> bool {
        self.kind() == ErrorKind::Client
    }

    /// The HTTP-equivalent status for this error.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::Client { status, .. } => *status,
            Self::Unauthorized(_) => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::MethodNotAllowed { .. } => 405,
            Self::UnsupportedMediaType(_) => 415,
            Self::TooManyRequests(_) => 429,
            Self::ServiceUnavailable { .. } => 503,
            Self::Timeout { .. } => 504,
            Self::Internal { .. } => 500,
        }
    }

    /// The message that may be shown to the caller.
    ///
    /// For internal errors this is the generic message only; the cause is
    /// never included.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal { message, .. } if message.is_empty() => INTERNAL_MESSAGE.to_string(),
            _ => self.to_string(),
        }
    }

    /// Whether this error should be escalated to operators.
    #[must_use]
    pub fn should_escalate(&self) -> bool {
        matches!(self, Self::Internal { escalate: true, .. })
    }

    /// The underlying cause of an internal error, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Internal { cause, .. } => cause.as_ref(),
            _ => None,
        }
    }

    /// Full diagnostic text for operators: message plus the cause chain.
    #[must_use]
    pub fn diagnostic(&self) -> Diagnostic<'_> {
        Diagnostic(self)
    }

    /// A copy for the caller: same variant, status and message, without
    /// the internal cause. The original goes to the error stream.
    #[must_use]
    pub fn for_caller(&self) -> Self {
        match self {
            Self::Client { status, message } => Self::Client {
                status: *status,
                message: message.clone(),
            },
            Self::Unauthorized(m) => Self::Unauthorized(m.clone()),
            Self::Forbidden(m) => Self::Forbidden(m.clone()),
            Self::NotFound(m) => Self::NotFound(m.clone()),
            Self::MethodNotAllowed { method, path } => Self::MethodNotAllowed {
                method: method.clone(),
                path: path.clone(),
            },
            Self::UnsupportedMediaType(m) => Self::UnsupportedMediaType(m.clone()),
            Self::TooManyRequests(m) => Self::TooManyRequests(m.clone()),
            Self::ServiceUnavailable { lag_ms } => Self::ServiceUnavailable { lag_ms: *lag_ms },
            Self::Timeout { timeout_ms } => Self::Timeout {
                timeout_ms: *timeout_ms,
            },
            Self::Internal {
                message, escalate, ..
            } => Self::Internal {
                message: message.clone(),
                cause: None,
                escalate: *escalate,
            },
        }
    }
}

/// Display adapter rendering an error with its full cause chain.
pub struct Diagnostic<'a>(&'a DispatchError);

impl fmt::Display for Diagnostic<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        if let Some(cause) = self.0.cause() {
            write!(f, ": {cause:#}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
