//! Controller configuration

use std::time::Duration;

use clap::Args;

/// Tunables for the controller, embeddable in an operator's CLI
#[derive(Args, Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Concurrent workers per resource queue
    #[arg(long, env = "CATALOG_WORKERS", default_value = "5")]
    pub workers: usize,

    /// Relist interval for brokers that do not set one
    #[arg(long, env = "CATALOG_BROKER_RELIST_INTERVAL_SECS", default_value = "900")]
    pub broker_relist_interval_secs: u64,

    /// How long a broker may keep failing before it is marked Failed
    #[arg(
        long,
        env = "CATALOG_RECONCILIATION_RETRY_DURATION_SECS",
        default_value = "604800"
    )]
    pub reconciliation_retry_duration_secs: u64,

    /// Interval at which every object is re-enqueued
    #[arg(long, env = "CATALOG_RESYNC_PERIOD_SECS", default_value = "300")]
    pub resync_period_secs: u64,

    /// Failed reconciles of a key before it is dropped
    #[arg(long, env = "CATALOG_MAX_RETRIES", default_value = "15")]
    pub max_retries: u32,

    /// First delay between last-operation polls
    #[arg(long, env = "CATALOG_POLLING_START_INTERVAL_SECS", default_value = "1")]
    pub polling_start_interval_secs: u64,

    /// Longest delay between last-operation polls
    #[arg(long, env = "CATALOG_POLLING_MAX_BACKOFF_SECS", default_value = "3600")]
    pub polling_max_backoff_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            broker_relist_interval_secs: 900,
            reconciliation_retry_duration_secs: 7 * 24 * 60 * 60,
            resync_period_secs: 300,
            max_retries: catalog_queue::DEFAULT_MAX_RETRIES,
            polling_start_interval_secs: 1,
            polling_max_backoff_secs: 3600,
        }
    }
}

impl ControllerConfig {
    pub fn broker_relist_interval(&self) -> Duration {
        Duration::from_secs(self.broker_relist_interval_secs)
    }

    pub fn reconciliation_retry_duration(&self) -> Duration {
        Duration::from_secs(self.reconciliation_retry_duration_secs)
    }

    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period_secs)
    }

    pub fn polling_start_interval(&self) -> Duration {
        Duration::from_secs(self.polling_start_interval_secs)
    }

    pub fn polling_max_backoff(&self) -> Duration {
        Duration::from_secs(self.polling_max_backoff_secs)
    }
}
