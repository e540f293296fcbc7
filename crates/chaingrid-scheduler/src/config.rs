//! Scheduler timing and identity.

use std::time::Duration;

use crate::error::{SchedulerError, SchedulerResult};

/// Settings for one scheduler instance.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Identity of this node. Used as the scheduler's key in the cluster
    /// map and in its running-chains address.
    pub agent_id: String,
    /// Period of the full lookup (with capability refresh).
    pub lookup_interval: Duration,
    /// Period of orphan recovery.
    pub lookup_orphans_interval: Duration,
    /// Delay before the first orphan recovery after start.
    pub lookup_orphans_initial_delay: Duration,
    /// Timeout for requests to other schedulers and agents.
    pub request_timeout: Duration,
}

impl SchedulerConfig {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            lookup_interval: Duration::from_secs(20),
            lookup_orphans_interval: Duration::from_secs(300),
            lookup_orphans_initial_delay: Duration::ZERO,
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_lookup_interval(mut self, interval: Duration) -> Self {
        self.lookup_interval = interval;
        self
    }

    pub fn with_lookup_orphans_interval(mut self, interval: Duration) -> Self {
        self.lookup_orphans_interval = interval;
        self
    }

    pub fn with_lookup_orphans_initial_delay(mut self, delay: Duration) -> Self {
        self.lookup_orphans_initial_delay = delay;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.agent_id.trim().is_empty() {
            return Err(SchedulerError::Config("agent id is not set".into()));
        }
        if self.lookup_interval.is_zero() || self.lookup_orphans_interval.is_zero() {
            return Err(SchedulerError::Config(
                "lookup intervals must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SchedulerConfig::new("node-1");
        assert_eq!(config.lookup_interval, Duration::from_secs(20));
        assert_eq!(config.lookup_orphans_interval, Duration::from_secs(300));
        assert_eq!(config.lookup_orphans_initial_delay, Duration::ZERO);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_agent_id_is_rejected() {
        let err = SchedulerConfig::new("  ").validate().unwrap_err();
        assert!(matches!(err, SchedulerError::Config(_)));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = SchedulerConfig::new("n").with_lookup_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
