use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use broker_lite::config::{BrokerConfig, TierOrder};
use broker_lite::server::Broker;
use broker_lite::shutdown::install_shutdown_handler;
use broker_lite::storage::MemoryStore;

#[derive(Parser, Debug)]
#[command(name = "broker-lite")]
#[command(version)]
#[command(about = "A background-job broker with scheduled jobs and worker heartbeats")]
struct Args {
    /// Upper bound of one blocking fetch wait, in milliseconds
    #[arg(long, default_value = "2000")]
    fetch_timeout_ms: u64,

    /// How often due scheduled jobs are promoted, in milliseconds
    #[arg(long, default_value = "1000", value_parser = clap::value_parser!(u64).range(1..))]
    scheduler_interval_ms: u64,

    /// How often stale workers are reaped, in seconds
    #[arg(long, default_value = "15", value_parser = clap::value_parser!(u64).range(1..))]
    reap_interval_secs: u64,

    /// Workers silent for longer than this are reaped, in seconds
    #[arg(long, default_value = "60")]
    heartbeat_timeout_secs: u64,

    /// Retrieval order for jobs pushed at the same priority
    #[arg(long, value_enum, default_value = "lifo")]
    tier_order: TierOrderArg,

    /// Most entries kept in the dead set
    #[arg(long, default_value = "10000", value_parser = clap::value_parser!(u64).range(1..))]
    dead_set_limit: u64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TierOrderArg {
    Lifo,
    Fifo,
}

impl From<TierOrderArg> for TierOrder {
    fn from(arg: TierOrderArg) -> Self {
        match arg {
            TierOrderArg::Lifo => TierOrder::Lifo,
            TierOrderArg::Fifo => TierOrder::Fifo,
        }
    }
}

impl Args {
    fn broker_config(&self) -> BrokerConfig {
        BrokerConfig::default()
            .with_fetch_timeout(Duration::from_millis(self.fetch_timeout_ms))
            .with_scheduler_interval(Duration::from_millis(self.scheduler_interval_ms))
            .with_reap_interval(Duration::from_secs(self.reap_interval_secs))
            .with_heartbeat_timeout(Duration::from_secs(self.heartbeat_timeout_secs))
            .with_tier_order(self.tier_order.into())
            .with_dead_set_limit(usize::try_from(self.dead_set_limit).unwrap_or(usize::MAX))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting broker-lite");

    let config = args.broker_config();
    tracing::debug!(?config, "Configuration");

    let store = Arc::new(MemoryStore::new(&config));
    let broker = Broker::new(config, store);

    let shutdown = install_shutdown_handler();
    broker.run(shutdown).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_make_a_valid_config() {
        let args = Args::try_parse_from(["broker-lite"]).unwrap();
        let config = args.broker_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler_interval, Duration::from_secs(1));
        assert_eq!(config.dead_set_limit, 10_000);
    }

    #[test]
    fn zero_intervals_are_refused_at_parse_time() {
        for flag in ["--scheduler-interval-ms", "--reap-interval-secs", "--dead-set-limit"] {
            assert!(
                Args::try_parse_from(["broker-lite", flag, "0"]).is_err(),
                "{flag} accepted 0"
            );
        }
    }
}
