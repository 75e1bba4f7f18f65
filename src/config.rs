use std::time::Duration;

use config::ConfigError;

use crate::monitor::MonitorMode;

/// Runtime configuration, read once from the environment at startup.
///
/// Every interval/threshold of the monitoring policy is a knob here;
/// defaults match the production fallbacks the service has always run with.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub monitor_mode: MonitorMode,

    /// Normal delay between polls of a tracked transaction.
    pub tx_loop_interval: Duration,
    /// Shorter delay used after a not-found observation.
    pub retry_not_found_interval: Duration,
    /// Consecutive not-found polls before a resend is attempted.
    pub not_found_count_before_retry: u32,
    /// Time without progress before a transaction is timed out.
    pub time_limit: Duration,
    /// Grace period after enqueue before the first poll.
    pub time_before_first_enqueue: Duration,
    /// Minimum spacing between upstream calls across all monitors.
    pub fetch_interval: Duration,
    /// Confirmation depth required on block-confirmation ledgers.
    pub confirmation_needed: u64,
    /// Cap on concurrently tracked transactions.
    pub max_tx_in_queue: i64,
    /// How often the store is re-read for added/removed transactions.
    pub watch_interval: Duration,
    /// Status values whose records are watched (OR'ed together).
    pub watch_statuses: Vec<String>,

    pub evm: EvmConfig,
    pub cosmos: CosmosConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone)]
pub struct EvmConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    /// Target block time, drives the chain-head cache refresh.
    pub block_time: Duration,
    pub replacer: Option<ReplacerConfig>,
}

/// Credentials for issuing fee-bump replacement transactions.
/// The key must resolve to `address`; this is validated fatally at startup.
#[derive(Debug, Clone)]
pub struct ReplacerConfig {
    pub private_key: String,
    pub address: String,
    pub gas_price_wei: u128,
}

#[derive(Debug, Clone)]
pub struct CosmosConfig {
    pub lcd_url: String,
}

#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// When false, audit records are dropped before the sink, not queued.
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub app_server: String,
    pub network: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::Message("DATABASE_URL must be set".into()))?;

        let monitor_mode = match env_or("MONITOR_MODE", "poll").as_str() {
            "poll" => MonitorMode::Poll,
            "retry" => MonitorMode::Retry,
            other => {
                return Err(ConfigError::Message(format!(
                    "unrecognized MONITOR_MODE {other:?} (expected \"poll\" or \"retry\")"
                )))
            }
        };

        let replacer = match std::env::var("REPLACER_PRIVATE_KEY") {
            Ok(private_key) => Some(ReplacerConfig {
                private_key,
                address: std::env::var("REPLACER_ADDRESS").map_err(|_| {
                    ConfigError::Message(
                        "REPLACER_ADDRESS must be set when REPLACER_PRIVATE_KEY is".into(),
                    )
                })?,
                gas_price_wei: env_u128("REPLACEMENT_GAS_PRICE_WEI", 40_000_000_000)?,
            }),
            Err(_) => None,
        };

        Ok(Self {
            database_url,
            monitor_mode,
            tx_loop_interval: Duration::from_millis(env_u64("TX_LOOP_INTERVAL_MS", 30_000)?),
            retry_not_found_interval: Duration::from_millis(env_u64(
                "RETRY_NOT_FOUND_INTERVAL_MS",
                30_000,
            )?),
            not_found_count_before_retry: env_u64("NOT_FOUND_COUNT_BEFORE_RETRY", 3)? as u32,
            time_limit: Duration::from_millis(env_u64("TIME_LIMIT_MS", 24 * 60 * 60 * 1000)?),
            time_before_first_enqueue: Duration::from_millis(env_u64(
                "TIME_BEFORE_FIRST_ENQUEUE_MS",
                60_000,
            )?),
            fetch_interval: Duration::from_millis(env_u64("FETCH_INTERVAL_MS", 1_000)?),
            confirmation_needed: env_u64("CONFIRMATION_NEEDED", 5)?,
            max_tx_in_queue: env_u64("MAX_TX_IN_QUEUE", 1_000)? as i64,
            watch_interval: Duration::from_millis(env_u64("WATCH_INTERVAL_MS", 1_000)?),
            watch_statuses: env_or("WATCH_STATUSES", "pending")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            evm: EvmConfig {
                rpc_url: env_or("EVM_RPC_URL", "http://localhost:8545"),
                chain_id: env_u64("EVM_CHAIN_ID", 1)?,
                block_time: Duration::from_millis(env_u64("EVM_BLOCK_TIME_MS", 14_400)?),
                replacer,
            },
            cosmos: CosmosConfig {
                lcd_url: env_or("COSMOS_LCD_URL", "http://localhost:1317"),
            },
            audit: AuditConfig {
                enabled: env_or("AUDIT_ENABLED", "false") == "true",
                endpoint: std::env::var("AUDIT_ENDPOINT").ok(),
                app_server: env_or("APP_SERVER", "tx-reconciler"),
                network: env_or("NETWORK", "mainnet"),
            },
        })
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Message(format!("{name} must be an integer, got {raw:?}"))),
        Err(_) => Ok(default),
    }
}

fn env_u128(name: &str, default: u128) -> Result<u128, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Message(format!("{name} must be an integer, got {raw:?}"))),
        Err(_) => Ok(default),
    }
}
