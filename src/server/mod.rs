//! Broker process state and its background loops.
//!
//! - [`workers`]: registry of consumer processes, heartbeats and lifecycle
//! - [`reply`]: response vocabulary for the command layer
//!
//! [`Broker::run`] drives two periodic tasks until shutdown:
//!
//! 1. **Scheduler**: promotes due scheduled jobs into their queues
//! 2. **Reaper**: drops workers that stopped heartbeating and closes their
//!    connections

pub mod reply;
pub mod workers;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::manager::Manager;
use crate::storage::Store;

pub use reply::Reply;
pub use workers::{ClientData, Closer, ConnectionHandle, WorkerRecord, WorkerState, Workers};

pub struct Broker {
    config: BrokerConfig,
    manager: Arc<Manager>,
    workers: Arc<Workers>,
}

impl Broker {
    pub fn new(config: BrokerConfig, store: Arc<dyn Store>) -> Self {
        Self {
            config,
            manager: Arc::new(Manager::new(store)),
            workers: Arc::new(Workers::new()),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn workers(&self) -> &Arc<Workers> {
        &self.workers
    }

    /// Run the scheduler and reaper loops until `shutdown` is cancelled,
    /// then close the store.
    ///
    /// # Errors
    ///
    /// Returns an error before starting anything if the configuration is
    /// invalid (for example a zero interval). Afterwards, errors come from a
    /// panicked loop task or from closing the store.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.config.validate()?;
        let heartbeat_timeout = chrono::Duration::from_std(self.config.heartbeat_timeout)
            .map_err(|e| BrokerError::Internal(format!("heartbeat timeout: {e}")))?;

        tracing::info!(
            scheduler_interval_ms = self.config.scheduler_interval.as_millis() as u64,
            reap_interval_ms = self.config.reap_interval.as_millis() as u64,
            heartbeat_timeout_s = self.config.heartbeat_timeout.as_secs(),
            "Broker running"
        );

        let scheduler = tokio::spawn(Self::scheduler_loop(
            self.manager.clone(),
            self.config.scheduler_interval,
            shutdown.clone(),
        ));
        let reaper = tokio::spawn(Self::reaper_loop(
            self.workers.clone(),
            self.config.reap_interval,
            heartbeat_timeout,
            shutdown.clone(),
        ));

        let (scheduler, reaper) = tokio::join!(scheduler, reaper);
        scheduler.map_err(|e| BrokerError::Internal(format!("scheduler loop: {e}")))?;
        reaper.map_err(|e| BrokerError::Internal(format!("reaper loop: {e}")))?;

        self.manager.store().close()?;
        tracing::info!("Broker stopped");
        Ok(())
    }

    async fn scheduler_loop(manager: Arc<Manager>, every: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match manager.promote_scheduled(Utc::now()) {
                        Ok(report) if report.promoted > 0 => {
                            tracing::info!(promoted = report.promoted, parked = report.parked, "Promoted scheduled jobs");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Scheduled job promotion failed"),
                    }
                }
            }
        }
        tracing::debug!("Scheduler loop stopped");
    }

    async fn reaper_loop(
        workers: Arc<Workers>,
        every: Duration,
        timeout: chrono::Duration,
        shutdown: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let reaped = workers.reap_heartbeats(Utc::now() - timeout);
                    if reaped > 0 {
                        tracing::info!(reaped, remaining = workers.count(), "Reaped stale workers");
                    }
                }
            }
        }
        tracing::debug!("Reaper loop stopped");
    }
}
