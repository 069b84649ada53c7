//! Fixed-window in-memory rate limiter.
//!
//! Counts calls per `(identity, window, limit)` in a `DashMap`. A window
//! opens on the first call and admits `limit` calls until it expires.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use switchyard_core::{DispatchError, RateLimiter, RateOptions};
use tokio::time::Instant;
use tracing::debug;

use crate::service::worker::{BackgroundRunnable, BackgroundWorker};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    identity: String,
    window: Duration,
    limit: u32,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    opened: Instant,
    count: u32,
}

/// Per-identity fixed-window limiter.
///
/// Endpoints with different rate options keep separate counters for the
/// same identity.
#[derive(Debug, Default)]
pub struct FixedWindowLimiter {
    windows: DashMap<WindowKey, Window>,
}

impl FixedWindowLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked windows, expired ones included.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }

    /// Drop every window that has expired. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows
            .retain(|key, window| now.duration_since(window.opened) < key.window);
        before.saturating_sub(self.windows.len())
    }

    /// Periodically purge expired windows so idle identities do not pile up.
    #[must_use]
    pub fn start_janitor(self: &Arc<Self>, every: Duration) -> BackgroundWorker {
        BackgroundWorker::start(
            Janitor {
                limiter: Arc::clone(self),
            },
            every,
        )
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    async fn try_acquire(&self, identity: &str, options: &RateOptions) -> anyhow::Result<()> {
        let key = WindowKey {
            identity: identity.to_string(),
            window: options.window,
            limit: options.limit,
        };
        let now = Instant::now();
        let mut entry = self.windows.entry(key).or_insert(Window {
            opened: now,
            count: 0,
        });
        let window = entry.value_mut();
        if now.duration_since(window.opened) >= options.window {
            window.opened = now;
            window.count = 0;
        }
        if window.count >= options.limit {
            let retry_in = options.window.saturating_sub(now.duration_since(window.opened));
            debug!(
                identity,
                retry_in_ms = u64::try_from(retry_in.as_millis()).unwrap_or(u64::MAX),
                "rate limit hit"
            );
            return Err(DispatchError::TooManyRequests(format!(
                "Rate limit of {} requests per {}s exceeded",
                options.limit,
                options.window.as_secs()
            ))
            .into());
        }
        window.count += 1;
        Ok(())
    }
}

struct Janitor {
    limiter: Arc<FixedWindowLimiter>,
}

#[async_trait]
impl BackgroundRunnable for Janitor {
    async fn on_tick(&mut self) {
        let purged = self.limiter.purge_expired();
        if purged > 0 {
            debug!(purged, "expired rate limit windows purged");
        }
    }
}
