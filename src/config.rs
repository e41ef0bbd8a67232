use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::execution::LedgerConfig;

const ENV_PREFIX: &str = "KLINETRADER";
const DEFAULT_CONFIG_FILE: &str = "klinetrader";

/// Top-level application configuration
///
/// Layered as built-in defaults, then an optional TOML file, then
/// `KLINETRADER_SECTION__KEY` environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub account: LedgerConfig,
    pub market: MarketConfig,
    pub pipeline: PipelineConfig,
    pub supervisor: SupervisorConfig,
    pub exchange: ExchangeConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub symbol: String,
    pub bar_seconds: u64,
    /// Lookback handed to the signal source each cycle
    pub history_bars: usize,
    /// Seconds without ticks before the live bar is flagged stale
    pub stale_after_secs: u64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            symbol: "DOGE-USDT-SWAP".to_string(),
            bar_seconds: 300,
            history_bars: 22,
            stale_after_secs: 10,
        }
    }
}

impl MarketConfig {
    pub fn bar_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.bar_seconds as i64)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub update_interval_ms: u64,
    pub execution_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// Capacity of the tick channel between ingestion and the updater
    pub tick_channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 1000,
            execution_interval_ms: 500,
            shutdown_timeout_ms: 5000,
            tick_channel_capacity: 4096,
        }
    }
}

impl PipelineConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn execution_interval(&self) -> Duration {
        Duration::from_millis(self.execution_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub live_restart_delay_ms: u64,
    pub backfill_max_retries: u32,
    pub backfill_initial_backoff_ms: u64,
    pub backfill_max_backoff_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            live_restart_delay_ms: 1000,
            backfill_max_retries: 3,
            backfill_initial_backoff_ms: 1000,
            backfill_max_backoff_ms: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub base_url: String,
    pub requests_per_second: u32,
    pub trade_poll_ms: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.okx.com".to_string(),
            requests_per_second: 10,
            trade_poll_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub trade_log_path: Option<PathBuf>,
    pub bar_history_path: Option<PathBuf>,
}

impl AppConfig {
    /// Load configuration from defaults, file and environment
    ///
    /// Without an explicit path, `klinetrader.toml` in the working directory
    /// is read if present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;

        tracing::debug!(
            symbol = %config.market.symbol,
            leverage = %config.account.leverage,
            "Configuration loaded"
        );

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let account = &self.account;

        if account.initial_balance <= Decimal::ZERO {
            return Err(invalid("account.initial_balance must be positive"));
        }
        if account.leverage <= Decimal::ZERO {
            return Err(invalid("account.leverage must be positive"));
        }
        if account.position_ratio <= Decimal::ZERO || account.position_ratio > Decimal::ONE {
            return Err(invalid("account.position_ratio must lie in (0, 1]"));
        }
        if !unit_interval(account.maintenance_margin_rate) {
            return Err(invalid("account.maintenance_margin_rate must lie in [0, 1)"));
        }
        if !unit_interval(account.fees.open_rate) || !unit_interval(account.fees.close_rate) {
            return Err(invalid("account.fees rates must lie in [0, 1)"));
        }
        if account.min_unit < Decimal::ZERO {
            return Err(invalid("account.min_unit must not be negative"));
        }
        if self.market.bar_seconds == 0 {
            return Err(invalid("market.bar_seconds must be positive"));
        }
        if self.market.symbol.is_empty() {
            return Err(invalid("market.symbol must not be empty"));
        }
        if !(300..=1000).contains(&self.pipeline.execution_interval_ms) {
            return Err(invalid(
                "pipeline.execution_interval_ms must lie in 300..=1000",
            ));
        }
        if self.pipeline.update_interval_ms == 0 {
            return Err(invalid("pipeline.update_interval_ms must be positive"));
        }
        if self.pipeline.tick_channel_capacity == 0 {
            return Err(invalid("pipeline.tick_channel_capacity must be positive"));
        }
        if self.exchange.requests_per_second == 0 {
            return Err(invalid("exchange.requests_per_second must be positive"));
        }

        Ok(())
    }
}

fn unit_interval(rate: Decimal) -> bool {
    rate >= Decimal::ZERO && rate < Decimal::ONE
}

fn invalid(message: &str) -> EngineError {
    EngineError::InvalidConfig(message.to_string())
}
