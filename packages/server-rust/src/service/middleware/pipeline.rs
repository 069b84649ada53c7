//! Pipeline composition: wraps the executor with every middleware layer.

use std::sync::Arc;

use tower::ServiceBuilder;

use super::load_shed::{LoadShedLayer, LoadShedService};
use super::metrics::{MetricsLayer, MetricsService};
use crate::service::events::EventBus;
use crate::service::executor::Executor;
use crate::service::load::LoadController;

/// The fully layered invocation service. Cheap to clone and `Sync`, so it can
/// be shared by every transport and called with `clone().oneshot(..)`.
pub type InvocationPipeline = LoadShedService<MetricsService<Executor>>;

/// Build the invocation pipeline around an executor.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- reject when overloaded, before any stage runs
/// 2. `MetricsLayer` -- open the invocation span, record timing and outcome
/// 3. `Executor` -- the governed stages, including the deadline
#[must_use]
pub fn build_invocation_pipeline(
    executor: Executor,
    controller: Arc<LoadController>,
    events: EventBus,
) -> InvocationPipeline {
    ServiceBuilder::new()
        .layer(LoadShedLayer::new(controller, events))
        .layer(MetricsLayer)
        .service(executor)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
