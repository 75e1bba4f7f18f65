pub mod poll;
pub mod registry;
pub mod retry;
pub mod writer;

use std::time::Duration;

use crate::config::Config;

/// Which monitoring policy runs for every tracked transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorMode {
    /// Full poll/retry hybrid: receipt-resolved terminal writes, not-found
    /// resend policy, replacement issuance, timeout.
    Poll,
    /// Pure retry: keeps a transaction broadcast until it is included,
    /// writes nothing.
    Retry,
}

/// Timing/threshold knobs shared by both monitor policies.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub time_limit: Duration,
    pub poll_interval: Duration,
    pub not_found_interval: Duration,
    pub not_found_count_before_retry: u32,
    pub first_enqueue_delay: Duration,
}

impl MonitorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            time_limit: config.time_limit,
            poll_interval: config.tx_loop_interval,
            not_found_interval: config.retry_not_found_interval,
            not_found_count_before_retry: config.not_found_count_before_retry,
            first_enqueue_delay: config.time_before_first_enqueue,
        }
    }
}
