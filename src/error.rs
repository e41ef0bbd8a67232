use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Errors raised by the engine, the aggregation pipeline and the adapters.
///
/// Liquidations are not errors; they appear in the ledger's closing report.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("insufficient margin for {symbol}: need {required}, available {available}")]
    InsufficientMargin {
        symbol: String,
        required: Decimal,
        available: Decimal,
    },

    #[error("invalid order for {symbol}: {reason}")]
    InvalidOrder { symbol: String, reason: String },

    #[error("invalid signal: {0}")]
    InvalidSignal(String),

    #[error("position {0} not found")]
    PositionNotFound(Uuid),

    #[error("out-of-order tick for {symbol}: {tick} is earlier than {last}")]
    OutOfOrderTick {
        symbol: String,
        tick: DateTime<Utc>,
        last: DateTime<Utc>,
    },

    #[error("data gap on {symbol}: no ticks since {since}")]
    DataGap { symbol: String, since: DateTime<Utc> },

    #[error("invalid bar at {timestamp}: {reason}")]
    InvalidBar {
        timestamp: DateTime<Utc>,
        reason: String,
    },

    #[error("not enough bars: need {needed}, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("feed disconnected: {0}")]
    FeedDisconnected(String),

    #[error("backfill for {symbol} failed after {attempts} attempts: {reason}")]
    BackfillExhausted {
        symbol: String,
        attempts: u32,
        reason: String,
    },

    #[error("exchange API error: {0}")]
    ExchangeApi(String),

    #[error("order placement halted until acknowledged: {0}")]
    TradingHalted(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
