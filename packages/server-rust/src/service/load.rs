//! Scheduler-lag load controller.
//!
//! A background sampler measures how late its own periodic tick fires. That
//! delay approximates how long runnable tasks wait for the scheduler. While
//! the last sample exceeds `max_lag`, new invocations are rejected with
//! `ServiceUnavailable` before any pipeline stage runs. Nothing is queued.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use switchyard_core::DispatchError;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{info, warn};

use super::config::LoadConfig;
use super::events::{AppEvent, EventBus};
use super::worker::{BackgroundRunnable, BackgroundWorker};

fn saturating_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

fn saturating_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// LoadController
// ---------------------------------------------------------------------------

/// Tracks scheduler lag and decides whether new work is admitted.
#[derive(Debug)]
pub struct LoadController {
    config: LoadConfig,
    lag_nanos: AtomicU64,
    overloaded: AtomicBool,
    permits: Option<Arc<Semaphore>>,
    events: EventBus,
}

/// Proof of admission. Holds a concurrency permit when a cap is configured.
#[derive(Debug)]
pub struct Admission {
    _permit: Option<OwnedSemaphorePermit>,
}

impl LoadController {
    #[must_use]
    pub fn new(config: LoadConfig, events: EventBus) -> Self {
        let permits = config
            .max_concurrent
            .map(|max| Arc::new(Semaphore::new(max as usize)));
        Self {
            config,
            lag_nanos: AtomicU64::new(0),
            overloaded: AtomicBool::new(false),
            permits,
            events,
        }
    }

    #[must_use]
    pub fn config(&self) -> &LoadConfig {
        &self.config
    }

    /// Record one lag sample and publish it.
    pub fn observe(&self, lag: Duration) {
        self.lag_nanos.store(saturating_nanos(lag), Ordering::Relaxed);
        let overloaded = lag > self.config.max_lag;
        let was_overloaded = self.overloaded.swap(overloaded, Ordering::Relaxed);

        if overloaded && !was_overloaded {
            warn!(
                lag_ms = saturating_millis(lag),
                max_lag_ms = saturating_millis(self.config.max_lag),
                "scheduler lag above threshold, shedding new work"
            );
        } else if !overloaded && was_overloaded {
            info!(lag_ms = saturating_millis(lag), "scheduler lag recovered");
        }

        self.events.emit(AppEvent::Lag { lag, overloaded });
    }

    /// The most recent lag sample.
    #[must_use]
    pub fn current_lag(&self) -> Duration {
        Duration::from_nanos(self.lag_nanos.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn is_overloaded(&self) -> bool {
        self.overloaded.load(Ordering::Relaxed)
    }

    /// Admit one invocation or reject it.
    ///
    /// # Errors
    ///
    /// Returns `ServiceUnavailable` carrying the current lag when the last
    /// sample exceeded `max_lag`, or when every concurrency permit is taken.
    pub fn admit(&self) -> Result<Admission, DispatchError> {
        if self.is_overloaded() {
            return Err(self.rejection());
        }
        let permit = match &self.permits {
            Some(permits) => Some(
                Arc::clone(permits)
                    .try_acquire_owned()
                    .map_err(|_| self.rejection())?,
            ),
            None => None,
        };
        Ok(Admission { _permit: permit })
    }

    fn rejection(&self) -> DispatchError {
        DispatchError::ServiceUnavailable {
            lag_ms: saturating_millis(self.current_lag()),
        }
    }

    /// Spawn the periodic lag sampler for this controller.
    #[must_use]
    pub fn start_sampler(self: &Arc<Self>) -> BackgroundWorker {
        let sampler = LagSampler {
            controller: Arc::clone(self),
            last_tick: Instant::now(),
        };
        BackgroundWorker::start(sampler, self.config.interval)
    }
}

// ---------------------------------------------------------------------------
// LagSampler
// ---------------------------------------------------------------------------

/// Measures tick lateness and feeds it to the controller.
struct LagSampler {
    controller: Arc<LoadController>,
    last_tick: Instant,
}

#[async_trait]
impl BackgroundRunnable for LagSampler {
    async fn on_start(&mut self) {
        self.last_tick = Instant::now();
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_tick);
        self.last_tick = now;
        let lag = elapsed.saturating_sub(self.controller.config.interval);
        self.controller.observe(lag);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(max_concurrent: Option<u32>) -> (Arc<LoadController>, EventBus) {
        let events = EventBus::new(64);
        let config = LoadConfig {
            interval: Duration::from_millis(10),
            max_lag: Duration::from_millis(50),
            max_concurrent,
        };
        (Arc::new(LoadController::new(config, events.clone())), events)
    }

    #[test]
    fn admits_while_lag_is_low() {
        let (controller, _events) = controller(None);
        controller.observe(Duration::from_millis(5));
        assert!(!controller.is_overloaded());
        assert!(controller.admit().is_ok());
    }

    #[test]
    fn rejects_every_invocation_while_overloaded() {
        let (controller, _events) = controller(None);
        controller.observe(Duration::from_millis(120));

        for _ in 0..5 {
            let err = controller.admit().unwrap_err();
            assert!(matches!(err, DispatchError::ServiceUnavailable { lag_ms: 120 }));
        }

        controller.observe(Duration::from_millis(1));
        assert!(controller.admit().is_ok());
    }

    #[test]
    fn lag_exactly_at_threshold_is_admitted() {
        let (controller, _events) = controller(None);
        controller.observe(Duration::from_millis(50));
        assert!(controller.admit().is_ok());
    }

    #[test]
    fn concurrency_cap_rejects_without_queuing() {
        let (controller, _events) = controller(Some(1));
        let first = controller.admit().unwrap();
        assert!(matches!(
            controller.admit(),
            Err(DispatchError::ServiceUnavailable { .. })
        ));
        drop(first);
        assert!(controller.admit().is_ok());
    }

    #[tokio::test]
    async fn every_sample_is_published() {
        let (controller, events) = controller(None);
        let mut rx = events.subscribe();

        controller.observe(Duration::from_millis(80));

        let AppEvent::Lag { lag, overloaded } = rx.recv().await.unwrap() else {
            panic!("expected a lag event");
        };
        assert_eq!(lag, Duration::from_millis(80));
        assert!(overloaded);
    }

    #[tokio::test(start_paused = true)]
    async fn sampler_detects_stalled_scheduler() {
        let (controller, events) = controller(None);
        let mut rx = events.subscribe();
        let mut sampler = controller.start_sampler();

        // Let the sampler take its baseline, then jump the clock past several
        // periods at once, as a blocked scheduler would.
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(200)).await;

        loop {
            if let AppEvent::Lag {
                lag,
                overloaded: true,
            } = rx.recv().await.unwrap()
            {
                assert!(lag >= Duration::from_millis(150), "lag was {lag:?}");
                break;
            }
        }
        assert!(controller.admit().is_err());

        sampler.stop().await;
    }
}
