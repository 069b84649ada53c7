use std::sync::Arc;

use serde_json::Value;
use tracing::Instrument;

use crate::error::DispatchError;
use crate::traits::{DaoHandle, ErrorReporter, Notifier, Opaque};
use crate::types::AuthInfo;

/// Per-invocation bundle of resources handed to an action.
///
/// Built by the executor after the DAO handle is acquired and dropped when
/// the invocation finishes. Clones share the same handle, so an action may
/// pass the context into helpers, but the context never outlives the
/// invocation that created it.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Endpoint label (`"POST /users/:id"`, `"chat:message"`).
    pub endpoint: Arc<str>,
    /// Resolved authentication, `None` when the caller sent no credentials.
    pub auth: Option<Arc<AuthInfo>>,
    /// Read-only application settings snapshot.
    pub settings: Arc<Value>,
    /// Invocation span; actions log through it.
    pub span: tracing::Span,
    dao: Arc<dyn DaoHandle>,
    cache: Option<Opaque>,
    dispatcher: Option<Opaque>,
    notifier: Option<Arc<dyn Notifier>>,
    reporter: Arc<dyn ErrorReporter>,
}

/// Shared collaborators an `ExecutionContext` is assembled from.
#[derive(Clone)]
pub struct ContextParts {
    pub settings: Arc<Value>,
    pub cache: Option<Opaque>,
    pub dispatcher: Option<Opaque>,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub reporter: Arc<dyn ErrorReporter>,
}

impl ExecutionContext {
    #[must_use]
    pub fn new(
        endpoint: Arc<str>,
        auth: Option<Arc<AuthInfo>>,
        dao: Arc<dyn DaoHandle>,
        parts: ContextParts,
        span: tracing::Span,
    ) -> Self {
        Self {
            endpoint,
            auth,
            settings: parts.settings,
            span,
            dao,
            cache: parts.cache,
            dispatcher: parts.dispatcher,
            notifier: parts.notifier,
            reporter: parts.reporter,
        }
    }

    /// The raw DAO handle acquired for this invocation.
    #[must_use]
    pub fn dao_handle(&self) -> &Arc<dyn DaoHandle> {
        &self.dao
    }

    /// The DAO handle downcast to its concrete type.
    #[must_use]
    pub fn dao<T: DaoHandle>(&self) -> Option<&T> {
        self.dao.as_any().downcast_ref::<T>()
    }

    #[must_use]
    pub fn cache<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.cache.as_deref().and_then(|c| c.downcast_ref::<T>())
    }

    #[must_use]
    pub fn dispatcher<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.dispatcher.as_deref().and_then(|d| d.downcast_ref::<T>())
    }

    /// Fire-and-forget notification.
    ///
    /// Runs on a separate task so the action is not held up. Failures, and a
    /// missing notifier, are reported on the application error stream.
    pub fn notify(&self, topic: impl Into<String>, payload: Value) {
        let topic = topic.into();
        let reporter = Arc::clone(&self.reporter);
        let origin = format!("{} notify({topic})", self.endpoint);

        let Some(notifier) = self.notifier.clone() else {
            reporter.report(
                &origin,
                DispatchError::internal("No notifier configured", None),
            );
            return;
        };

        tokio::spawn(
            async move {
                if let Err(err) = notifier.notify(&topic, payload).await {
                    reporter.report(
                        &origin,
                        DispatchError::internal(format!("Failed to notify {topic}"), Some(err)),
                    );
                }
            }
            .instrument(self.span.clone()),
        );
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("endpoint", &self.endpoint)
            .field("auth", &self.auth)
            .field("has_cache", &self.cache.is_some())
            .field("has_dispatcher", &self.dispatcher.is_some())
            .field("has_notifier", &self.notifier.is_some())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
