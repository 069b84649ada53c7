use std::time::Duration;

/// Dispatch-level configuration for the execution pipeline.
///
/// Controls load shedding, the per-invocation deadline, and the event bus.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Scheduler lag sampling and shedding thresholds.
    pub load: LoadConfig,
    /// Deadline applied to every awaited collaborator call of one invocation.
    /// `None` disables the deadline.
    pub invocation_timeout: Option<Duration>,
    /// Capacity of the broadcast channel behind the application event stream.
    pub event_capacity: usize,
    /// Rate-limit identity used for callers without authentication.
    pub anonymous_identity: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            load: LoadConfig::default(),
            invocation_timeout: Some(Duration::from_secs(30)),
            event_capacity: 1024,
            anonymous_identity: "anonymous".to_string(),
        }
    }
}

/// Load controller settings.
#[derive(Debug, Clone)]
pub struct LoadConfig {
    /// How often scheduler lag is sampled.
    pub interval: Duration,
    /// Lag above which new invocations are shed.
    pub max_lag: Duration,
    /// Optional cap on concurrently running invocations.
    pub max_concurrent: Option<u32>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            max_lag: Duration::from_millis(70),
            max_concurrent: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_config_defaults() {
        let config = DispatchConfig::default();
        assert_eq!(config.invocation_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.event_capacity, 1024);
        assert_eq!(config.anonymous_identity, "anonymous");
    }

    #[test]
    fn load_config_defaults() {
        let config = LoadConfig::default();
        assert_eq!(config.interval, Duration::from_millis(500));
        assert_eq!(config.max_lag, Duration::from_millis(70));
        assert!(config.max_concurrent.is_none());
    }
}
