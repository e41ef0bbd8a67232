use rust_decimal::Decimal;

use crate::error::{EngineError, Result};
use crate::models::Bar;

/// Validates OHLCV bars before they reach the history
pub struct BarValidator;

impl BarValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, bar: &Bar) -> Result<()> {
        self.validate_prices(bar)?;
        self.validate_ohlc_relationship(bar)?;
        Ok(())
    }

    /// Keep the valid bars, returning them with the number dropped
    pub fn filter_valid(&self, bars: Vec<Bar>) -> (Vec<Bar>, usize) {
        let total = bars.len();
        let valid: Vec<Bar> = bars
            .into_iter()
            .filter(|bar| match self.validate(bar) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("Dropping bar: {}", e);
                    false
                }
            })
            .collect();
        let dropped = total - valid.len();
        (valid, dropped)
    }

    fn validate_prices(&self, bar: &Bar) -> Result<()> {
        for (name, price) in [
            ("open", bar.open),
            ("high", bar.high),
            ("low", bar.low),
            ("close", bar.close),
        ] {
            if price <= Decimal::ZERO {
                return Err(reject(bar, format!("invalid {} price {}", name, price)));
            }
        }
        // Zero volume is fine for quiet intervals
        if bar.volume < Decimal::ZERO {
            return Err(reject(bar, format!("invalid volume {}", bar.volume)));
        }
        Ok(())
    }

    fn validate_ohlc_relationship(&self, bar: &Bar) -> Result<()> {
        if bar.high < bar.low {
            return Err(reject(
                bar,
                format!("high ({}) is less than low ({})", bar.high, bar.low),
            ));
        }
        if bar.high < bar.open.max(bar.close) {
            return Err(reject(
                bar,
                format!(
                    "high ({}) is below open ({}) or close ({})",
                    bar.high, bar.open, bar.close
                ),
            ));
        }
        if bar.low > bar.open.min(bar.close) {
            return Err(reject(
                bar,
                format!(
                    "low ({}) is above open ({}) or close ({})",
                    bar.low, bar.open, bar.close
                ),
            ));
        }
        Ok(())
    }
}

impl Default for BarValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn reject(bar: &Bar, reason: String) -> EngineError {
    EngineError::InvalidBar {
        timestamp: bar.timestamp,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_valid_bar() -> Bar {
        Bar {
            timestamp: Utc::now(),
            open: Decimal::from(100),
            high: Decimal::from(102),
            low: Decimal::from(99),
            close: Decimal::from(101),
            volume: Decimal::from(1_000_000),
        }
    }

    #[test]
    fn test_validate_valid_bar() {
        assert!(BarValidator::new().validate(&make_valid_bar()).is_ok());
    }

    #[test]
    fn test_validate_negative_open() {
        let mut bar = make_valid_bar();
        bar.open = Decimal::from(-100);

        let result = BarValidator::new().validate(&bar);
        assert!(result.unwrap_err().to_string().contains("invalid open price"));
    }

    #[test]
    fn test_zero_volume_allowed() {
        let mut bar = make_valid_bar();
        bar.volume = Decimal::ZERO;
        assert!(BarValidator::new().validate(&bar).is_ok());
    }

    #[test]
    fn test_negative_volume_rejected() {
        let mut bar = make_valid_bar();
        bar.volume = Decimal::from(-1);
        assert!(BarValidator::new().validate(&bar).is_err());
    }

    #[test]
    fn test_high_below_close_rejected() {
        let mut bar = make_valid_bar();
        bar.close = Decimal::from(103);

        let err = BarValidator::new().validate(&bar).unwrap_err();
        assert!(matches!(err, EngineError::InvalidBar { .. }));
    }

    #[test]
    fn test_low_above_open_rejected() {
        let mut bar = make_valid_bar();
        bar.low = Decimal::new(1005, 1);
        assert!(BarValidator::new().validate(&bar).is_err());
    }

    #[test]
    fn test_filter_valid_counts_dropped() {
        let mut broken = make_valid_bar();
        broken.high = Decimal::from(50);

        let (valid, dropped) =
            BarValidator::new().filter_valid(vec![make_valid_bar(), broken, make_valid_bar()]);
        assert_eq!(valid.len(), 2);
        assert_eq!(dropped, 1);
    }
}
