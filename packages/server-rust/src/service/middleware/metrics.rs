//! Metrics middleware for invocations.
//!
//! Opens the `invocation` span every later stage logs under, then records
//! duration and outcome both on the span and through the `metrics` facade.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use switchyard_core::DispatchError;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::service::executor::{Invocation, Reply};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Records invocation duration and outcome.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<Invocation> for MetricsService<S>
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
        let endpoint = invocation.label.clone();
        let invocation_id = uuid::Uuid::new_v4();

        let span = info_span!(
            "invocation",
            endpoint = %endpoint,
            id = %invocation_id,
            duration_ms = tracing::field::Empty,
            status = tracing::field::Empty,
        );

        // The inner future is created inside the span so stage logs nest.
        let fut = span.in_scope(|| self.inner.call(invocation));

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let status: u16 = match &result {
                    Ok(Reply::Body(_)) => 200,
                    Ok(Reply::NoContent) => 204,
                    Err(err) => err.status(),
                };
                let outcome = if result.is_ok() { "ok" } else { "error" };

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("status", status);

                metrics::counter!(
                    "switchyard_invocations_total",
                    "endpoint" => endpoint.to_string(),
                    "outcome" => outcome,
                )
                .increment(1);
                metrics::histogram!(
                    "switchyard_invocation_duration_seconds",
                    "endpoint" => endpoint.to_string(),
                )
                .record(elapsed.as_secs_f64());

                tracing::debug!(duration_ms, status, outcome, "invocation complete");

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
