//! Background worker for periodic tasks.
//!
//! Provides a generic `BackgroundWorker<R>` that drives a `BackgroundRunnable`
//! on a fixed tick interval until it is stopped.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Trait for periodic task handlers executed by `BackgroundWorker`.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// Called once, right before the first tick is awaited.
    async fn on_start(&mut self) {}

    /// Called on each tick interval.
    async fn on_tick(&mut self);

    /// Called once when the worker is shutting down. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Generic background worker driving a runnable on a tick interval.
///
/// The worker spawns a tokio task that:
/// 1. Calls `BackgroundRunnable::on_start()`
/// 2. Calls `BackgroundRunnable::on_tick()` at the configured interval. Late
///    ticks are delayed, not bursted, so a stalled scheduler produces one
///    late tick rather than a catch-up burst.
/// 3. Calls `BackgroundRunnable::shutdown()` when stopped
pub struct BackgroundWorker {
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl BackgroundWorker {
    /// Start the background worker with the given runnable and tick interval.
    pub fn start<R: BackgroundRunnable>(mut runnable: R, tick_interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(tick_interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Consume the immediate first tick so on_tick starts one period in.
            ticks.tick().await;
            runnable.on_start().await;

            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        runnable.on_tick().await;
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            runnable.shutdown().await;
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Whether the worker task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the worker gracefully, waiting for the worker task to complete.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    struct CountingRunnable {
        start_count: Arc<AtomicU32>,
        tick_count: Arc<AtomicU32>,
        shutdown_called: Arc<AtomicU32>,
    }

    #[async_trait]
    impl BackgroundRunnable for CountingRunnable {
        async fn on_start(&mut self) {
            self.start_count.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.tick_count.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.shutdown_called.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counters() -> (Arc<AtomicU32>, Arc<AtomicU32>, Arc<AtomicU32>) {
        (
            Arc::new(AtomicU32::new(0)),
            Arc::new(AtomicU32::new(0)),
            Arc::new(AtomicU32::new(0)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn tick_fires_periodically() {
        let (start_count, tick_count, shutdown_called) = counters();
        let runnable = CountingRunnable {
            start_count: start_count.clone(),
            tick_count: tick_count.clone(),
            shutdown_called: shutdown_called.clone(),
        };

        let mut worker = BackgroundWorker::start(runnable, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(55)).await;

        assert_eq!(start_count.load(Ordering::SeqCst), 1);
        let ticks = tick_count.load(Ordering::SeqCst);
        assert!((4..=6).contains(&ticks), "unexpected tick count {ticks}");

        worker.stop().await;
        assert_eq!(shutdown_called.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_runs_shutdown_once() {
        let (start_count, tick_count, shutdown_called) = counters();
        let runnable = CountingRunnable {
            start_count,
            tick_count,
            shutdown_called: shutdown_called.clone(),
        };

        let mut worker = BackgroundWorker::start(runnable, Duration::from_secs(60));
        assert!(worker.is_running());
        worker.stop().await;
        worker.stop().await;

        assert!(!worker.is_running());
        assert_eq!(shutdown_called.load(Ordering::SeqCst), 1);
    }
}
