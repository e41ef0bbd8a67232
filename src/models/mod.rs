use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Current version of the [`Signal`] record.
pub const SIGNAL_VERSION: u16 = 1;

/// A single executed trade from the market feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub timestamp: DateTime<Utc>,
    pub price: Decimal,
    pub size: Decimal,
}

impl Tick {
    pub fn new(timestamp: DateTime<Utc>, price: Decimal, size: Decimal) -> Self {
        Self {
            timestamp,
            price,
            size,
        }
    }
}

/// OHLCV bar (kline). `timestamp` is the start of the bar's interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Bar {
    /// A bar seeded from a single trade
    pub fn from_tick(timestamp: DateTime<Utc>, tick: &Tick) -> Self {
        Self {
            timestamp,
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.size,
        }
    }

    /// A flat bar where O=H=L=C, mostly useful for tests and replayed closes
    pub fn flat(timestamp: DateTime<Utc>, price: Decimal) -> Self {
        Self {
            timestamp,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: Decimal::ZERO,
        }
    }

    /// Fold a later bar in: keep open, extend high/low, take close, add volume
    pub fn absorb(&mut self, next: &Bar) {
        self.high = self.high.max(next.high);
        self.low = self.low.min(next.low);
        self.close = next.close;
        self.volume += next.volume;
    }
}

/// Side of a leveraged position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for longs, -1 for shorts
    pub fn sign(self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn as_i8(self) -> i8 {
        match self {
            Direction::Long => 1,
            Direction::Short => -1,
        }
    }

    /// Maps the legacy integer encoding; 0 means "no direction"
    pub fn from_i8(value: i8) -> Option<Self> {
        match value {
            1 => Some(Direction::Long),
            -1 => Some(Direction::Short),
            _ => None,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "long"),
            Direction::Short => write!(f, "short"),
        }
    }
}

/// Which open positions an explicit exit should close
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitSignal {
    #[default]
    None,
    /// Close positions held in this direction
    Close(Direction),
    /// Close every position of the symbol
    All,
}

impl ExitSignal {
    pub fn matches(self, direction: Direction) -> bool {
        match self {
            ExitSignal::None => false,
            ExitSignal::Close(target) => target == direction,
            ExitSignal::All => true,
        }
    }
}

fn default_version() -> u16 {
    SIGNAL_VERSION
}

fn default_exit_ratio() -> Decimal {
    Decimal::ONE
}

/// Trading signal produced by a [`crate::SignalSource`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    #[serde(default = "default_version")]
    pub version: u16,
    /// Direction to open; `None` means do not open
    #[serde(default)]
    pub direction: Option<Direction>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub size: Decimal,
    #[serde(default)]
    pub exit: ExitSignal,
    /// Fraction of each matching position closed by `exit`, in (0, 1]
    #[serde(default = "default_exit_ratio")]
    pub exit_ratio: Decimal,
}

impl Default for Signal {
    fn default() -> Self {
        Self::hold()
    }
}

impl Signal {
    /// Do nothing
    pub fn hold() -> Self {
        Self {
            version: SIGNAL_VERSION,
            direction: None,
            take_profit: None,
            stop_loss: None,
            size: Decimal::ZERO,
            exit: ExitSignal::None,
            exit_ratio: Decimal::ONE,
        }
    }

    pub fn open(direction: Direction, size: Decimal) -> Self {
        Self {
            direction: Some(direction),
            size,
            ..Self::hold()
        }
    }

    /// Close positions held in `direction`
    pub fn exit(direction: Direction) -> Self {
        Self {
            exit: ExitSignal::Close(direction),
            ..Self::hold()
        }
    }

    pub fn with_take_profit(mut self, price: Decimal) -> Self {
        self.take_profit = Some(price);
        self
    }

    pub fn with_stop_loss(mut self, price: Decimal) -> Self {
        self.stop_loss = Some(price);
        self
    }

    pub fn with_exit(mut self, exit: ExitSignal) -> Self {
        self.exit = exit;
        self
    }

    pub fn with_exit_ratio(mut self, ratio: Decimal) -> Self {
        self.exit_ratio = ratio;
        self
    }

    pub fn is_hold(&self) -> bool {
        self.direction.is_none() && self.exit == ExitSignal::None
    }

    /// Check field ranges before the signal reaches the ledger
    pub fn validate(&self) -> Result<()> {
        if self.version != SIGNAL_VERSION {
            return Err(EngineError::InvalidSignal(format!(
                "unsupported signal version {}",
                self.version
            )));
        }
        if self.size < Decimal::ZERO {
            return Err(EngineError::InvalidSignal(format!(
                "negative size {}",
                self.size
            )));
        }
        if self.exit_ratio <= Decimal::ZERO || self.exit_ratio > Decimal::ONE {
            return Err(EngineError::InvalidSignal(format!(
                "exit ratio {} outside (0, 1]",
                self.exit_ratio
            )));
        }
        if let Some(tp) = self.take_profit {
            if tp <= Decimal::ZERO {
                return Err(EngineError::InvalidSignal(format!(
                    "non-positive take profit {}",
                    tp
                )));
            }
        }
        if let Some(sl) = self.stop_loss {
            if sl <= Decimal::ZERO {
                return Err(EngineError::InvalidSignal(format!(
                    "non-positive stop loss {}",
                    sl
                )));
            }
        }
        Ok(())
    }
}

/// Open leveraged position, owned by the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub margin: Decimal,
    pub entry_fee: Decimal,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub open_timestamp: DateTime<Utc>,
}

impl Position {
    /// direction · (mark − entry) · size
    pub fn unrealized_pnl(&self, mark: Decimal) -> Decimal {
        self.direction.sign() * (mark - self.entry_price) * self.size
    }

    pub fn notional(&self, mark: Decimal) -> Decimal {
        self.size * mark
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Open,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Liquidation,
    TakeProfit,
    StopLoss,
    ExitSignal,
    EndOfData,
    Manual,
}

/// Append-only trade log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeLogEntry {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub position_id: Uuid,
    pub action: TradeAction,
    pub direction: Direction,
    pub price: Decimal,
    pub size: Decimal,
    pub fee: Decimal,
    pub margin: Decimal,
    /// Net P&L (after the close fee); only set on closes
    pub pnl: Option<Decimal>,
    pub entry_price: Option<Decimal>,
    pub reason: Option<CloseReason>,
}
