use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::DispatchError;
use crate::types::{AuthInfo, Credentials, DaoOptions, RateOptions, Release};

/// Validates a credential pair and resolves who the caller is.
///
/// `options` is the endpoint's (or listener's) opaque `auth` configuration.
/// Any failure is reported to the caller as Unauthorized.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        credentials: &Credentials,
        options: Option<&Value>,
    ) -> anyhow::Result<AuthInfo>;
}

/// Source of per-invocation DAO handles.
#[async_trait]
pub trait Database: Send + Sync {
    /// Acquire a handle scoped to one invocation.
    async fn connect(&self, options: DaoOptions) -> anyhow::Result<Arc<dyn DaoHandle>>;
}

/// Transactional data-access handle owned by exactly one invocation.
#[async_trait]
pub trait DaoHandle: Send + Sync + Any {
    /// Finish the handle. Called exactly once per acquired handle.
    async fn release(&self, outcome: Release) -> anyhow::Result<()>;

    /// Upcast for downcasting to the concrete handle inside actions.
    fn as_any(&self) -> &dyn Any;
}

/// Per-identity call budget. Fails when the budget is exhausted.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn try_acquire(&self, identity: &str, options: &RateOptions) -> anyhow::Result<()>;
}

/// Best-effort outbound notifications (push, mail, webhooks...).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, topic: &str, payload: Value) -> anyhow::Result<()>;
}

/// Sink for failures that cannot be returned to a caller.
pub trait ErrorReporter: Send + Sync {
    /// `origin` names where the failure happened (endpoint label, task...).
    fn report(&self, origin: &str, error: DispatchError);
}

/// Opaque collaborator passed through to actions untouched (cache, job
/// dispatcher, ...). Actions downcast to the concrete type they expect.
pub type Opaque = Arc<dyn Any + Send + Sync>;
