use rust_decimal::Decimal;

use super::{SignalContext, SignalSource};
use crate::indicators::calculate_sma;
use crate::models::{Direction, ExitSignal, Signal};
use crate::Result;

/// Moving-average crossing strategy
///
/// Goes long when the previous bar's low touched the MA and the current
/// bar's low is back above it; goes short on the mirror image using highs.
/// Every entry first exits the opposite side. A signal in the direction
/// already held is ignored.
#[derive(Debug, Clone)]
pub struct MaCrossStrategy {
    ma_length: usize,
    position_ratio: Decimal,
}

impl MaCrossStrategy {
    pub fn new(ma_length: usize, position_ratio: Decimal) -> Self {
        Self {
            ma_length,
            position_ratio,
        }
    }

    pub fn ma_length(&self) -> usize {
        self.ma_length
    }

    /// balance · position_ratio · leverage / price
    fn position_size(&self, balance: Decimal, leverage: Decimal, price: Decimal) -> Decimal {
        if price <= Decimal::ZERO || balance <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        balance * self.position_ratio * leverage / price
    }
}

impl Default for MaCrossStrategy {
    fn default() -> Self {
        Self::new(20, Decimal::new(5, 1))
    }
}

impl SignalSource for MaCrossStrategy {
    fn generate_signal(&self, ctx: &SignalContext<'_>) -> Result<Signal> {
        let bars = ctx.bars;
        if bars.len() < self.min_bars_required() {
            return Ok(Signal::hold());
        }

        let closes: Vec<Decimal> = bars.iter().map(|b| b.close).collect();
        let n = closes.len();
        let (Some(ma), Some(prev_ma)) = (
            calculate_sma(&closes, self.ma_length),
            calculate_sma(&closes[..n - 1], self.ma_length),
        ) else {
            return Ok(Signal::hold());
        };

        let current = &bars[n - 1];
        let previous = &bars[n - 2];

        let direction = if previous.low <= prev_ma && current.low > ma {
            Direction::Long
        } else if previous.high >= prev_ma && current.high < ma {
            Direction::Short
        } else {
            return Ok(Signal::hold());
        };

        if ctx.current_direction == Some(direction) {
            tracing::debug!(
                timestamp = %current.timestamp,
                "{} signal ignored, position already held",
                direction
            );
            return Ok(Signal::hold());
        }

        let size = self.position_size(ctx.balance, ctx.leverage, current.close);
        if size <= Decimal::ZERO {
            return Ok(Signal::hold());
        }

        Ok(Signal::open(direction, size).with_exit(ExitSignal::Close(direction.opposite())))
    }

    fn name(&self) -> &str {
        "MA Cross"
    }

    fn min_bars_required(&self) -> usize {
        // MA for the current and the previous bar
        self.ma_length + 1
    }
}
