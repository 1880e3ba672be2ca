use std::time::Duration;

use crate::error::{BrokerError, Result};

/// Retrieval order of payloads pushed at the same priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TierOrder {
    /// Last pushed is popped first. Matches the historical list-push behaviour.
    #[default]
    Lifo,
    /// First pushed is popped first.
    Fifo,
}

/// Runtime settings for the broker core and its background loops.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Upper bound of a single blocking wait inside `fetch`/`bpop`.
    pub fetch_timeout: Duration,
    /// How often due scheduled jobs are promoted into their queues.
    pub scheduler_interval: Duration,
    /// How often stale worker heartbeats are reaped.
    pub reap_interval: Duration,
    /// A worker without a heartbeat for this long is reaped.
    pub heartbeat_timeout: Duration,
    pub tier_order: TierOrder,
    /// Most entries kept in the dead set; the oldest are evicted first.
    pub dead_set_limit: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(2),
            scheduler_interval: Duration::from_secs(1),
            reap_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(60),
            tier_order: TierOrder::Lifo,
            dead_set_limit: 10_000,
        }
    }
}

impl BrokerConfig {
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_scheduler_interval(mut self, interval: Duration) -> Self {
        self.scheduler_interval = interval;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_tier_order(mut self, order: TierOrder) -> Self {
        self.tier_order = order;
        self
    }

    pub fn with_dead_set_limit(mut self, limit: usize) -> Self {
        self.dead_set_limit = limit;
        self
    }

    /// Reject settings the background loops cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler_interval.is_zero() {
            return Err(BrokerError::Config(
                "scheduler interval must be greater than zero".to_string(),
            ));
        }
        if self.reap_interval.is_zero() {
            return Err(BrokerError::Config(
                "reap interval must be greater than zero".to_string(),
            ));
        }
        if self.dead_set_limit == 0 {
            return Err(BrokerError::Config(
                "dead set limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
