//! Load-shedding middleware for invocations.
//!
//! Asks the [`LoadController`] for admission before anything else runs.
//! Rejected invocations fail with `DispatchError::ServiceUnavailable`
//! immediately; nothing is queued.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use switchyard_core::DispatchError;
use tower::{Layer, Service};

use crate::service::events::{AppEvent, EventBus};
use crate::service::executor::{Invocation, Reply};
use crate::service::load::LoadController;

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

/// Tower layer that rejects invocations while the controller reports overload.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    controller: Arc<LoadController>,
    events: EventBus,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(controller: Arc<LoadController>, events: EventBus) -> Self {
        Self { controller, events }
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            controller: Arc::clone(&self.controller),
            events: self.events.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    controller: Arc<LoadController>,
    events: EventBus,
}

impl<S> Service<Invocation> for LoadShedService<S>
where
    S: Service<Invocation, Response = Reply, Error = DispatchError> + Send,
    S::Future: Send + 'static,
{
    type Response = Reply;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<Reply, DispatchError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let admission = match self.controller.admit() {
            Ok(admission) => admission,
            Err(rejection) => {
                metrics::counter!("switchyard_shed_total").increment(1);
                self.events.emit(AppEvent::Shed {
                    lag: self.controller.current_lag(),
                    endpoint: Arc::clone(&invocation.label),
                });
                return Box::pin(async move { Err(rejection) });
            }
        };

        let fut = self.inner.call(invocation);
        Box::pin(async move {
            // Hold the admission (and any concurrency permit) until done.
            let result = fut.await;
            drop(admission);
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
