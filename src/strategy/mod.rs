// Signal sources
pub mod ma_cross;

pub use ma_cross::MaCrossStrategy;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::models::{Bar, Direction, Signal};
use crate::Result;

/// Where in the data a cycle is evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Position of the current bar in a backtest series
    Index(usize),
    /// Wall-clock time of a live cycle
    Time(DateTime<Utc>),
}

/// Which half of the two-phase cycle is asking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    /// Before liquidation, TP/SL and exit processing
    CloseCheck,
    /// After closes, before opening
    Reopen,
}

/// Everything a signal source may look at for one query
#[derive(Debug, Clone, Copy)]
pub struct SignalContext<'a> {
    pub cursor: Cursor,
    /// Bars up to and including the one being evaluated
    pub bars: &'a [Bar],
    pub balance: Decimal,
    pub leverage: Decimal,
    /// Direction of the position currently held, if any
    pub current_direction: Option<Direction>,
    pub phase: CyclePhase,
}

impl SignalContext<'_> {
    pub fn current_bar(&self) -> Option<&Bar> {
        self.bars.last()
    }
}

/// Pluggable producer of trading signals
pub trait SignalSource: Send + Sync {
    fn generate_signal(&self, ctx: &SignalContext<'_>) -> Result<Signal>;

    fn name(&self) -> &str;

    /// Bars needed before the first meaningful signal
    fn min_bars_required(&self) -> usize;
}

/// Signal source backed by a closure
pub struct FnSignalSource<F> {
    name: String,
    min_bars: usize,
    f: F,
}

impl<F> FnSignalSource<F>
where
    F: Fn(&SignalContext<'_>) -> Signal + Send + Sync,
{
    pub fn new(name: impl Into<String>, min_bars: usize, f: F) -> Self {
        Self {
            name: name.into(),
            min_bars,
            f,
        }
    }
}

impl<F> SignalSource for FnSignalSource<F>
where
    F: Fn(&SignalContext<'_>) -> Signal + Send + Sync,
{
    fn generate_signal(&self, ctx: &SignalContext<'_>) -> Result<Signal> {
        Ok((self.f)(ctx))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn min_bars_required(&self) -> usize {
        self.min_bars
    }
}

impl<S: SignalSource + ?Sized> SignalSource for Box<S> {
    fn generate_signal(&self, ctx: &SignalContext<'_>) -> Result<Signal> {
        (**self).generate_signal(ctx)
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn min_bars_required(&self) -> usize {
        (**self).min_bars_required()
    }
}
