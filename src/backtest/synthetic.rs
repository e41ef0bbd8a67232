use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use crate::models::{Bar, Tick};

/// 2025-01-01T00:00:00Z
const DEFAULT_START_SECS: i64 = 1_735_689_600;

/// Market scenario types for synthetic data generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketScenario {
    /// Steady uptrend with noise
    Uptrend,
    /// Steady downtrend with noise
    Downtrend,
    /// Mean-reverting chop around the base price
    Sideways,
    /// Calm market followed by a sharp 30% drop
    Crash,
}

impl std::str::FromStr for MarketScenario {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "uptrend" => Ok(MarketScenario::Uptrend),
            "downtrend" => Ok(MarketScenario::Downtrend),
            "sideways" => Ok(MarketScenario::Sideways),
            "crash" => Ok(MarketScenario::Crash),
            other => Err(format!("unknown scenario '{}'", other)),
        }
    }
}

/// Seeded generator of synthetic bars and ticks
pub struct SyntheticDataGenerator {
    rng: StdRng,
    base_price: f64,
    base_volume: f64,
    start: DateTime<Utc>,
}

impl SyntheticDataGenerator {
    /// Create a new generator with a seed for reproducibility
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            base_price: 0.35,
            base_volume: 1_000_000.0,
            start: DateTime::from_timestamp(DEFAULT_START_SECS, 0).unwrap_or_default(),
        }
    }

    pub fn with_base_price(mut self, price: f64) -> Self {
        self.base_price = price;
        self
    }

    pub fn with_start(mut self, start: DateTime<Utc>) -> Self {
        self.start = start;
        self
    }

    /// Generate `num_bars` consecutive bars of `bar_size`
    ///
    /// Each bar opens at the previous close; high and low extend slightly
    /// beyond the body.
    pub fn generate(
        &mut self,
        scenario: MarketScenario,
        num_bars: usize,
        bar_size: Duration,
    ) -> Vec<Bar> {
        let mut bars = Vec::with_capacity(num_bars);
        let mut price = self.base_price;

        for i in 0..num_bars {
            let open = price;
            price = self.step(scenario, i, num_bars, price);
            let close = price;

            let wick_up = self.rng.gen_range(0.0..0.002);
            let wick_down = self.rng.gen_range(0.0..0.002);
            let high = open.max(close) * (1.0 + wick_up);
            let low = open.min(close) * (1.0 - wick_down);
            let volume = self.base_volume * self.rng.gen_range(0.5..1.5);

            bars.push(Bar {
                timestamp: self.start + bar_size * i as i32,
                open: to_price(open),
                high: to_price(high),
                low: to_price(low),
                close: to_price(close),
                volume: to_price(volume).round(),
            });
        }

        bars
    }

    /// Generate `num_ticks` trades spaced `spacing` apart
    pub fn generate_ticks(
        &mut self,
        scenario: MarketScenario,
        num_ticks: usize,
        spacing: Duration,
    ) -> Vec<Tick> {
        let mut ticks = Vec::with_capacity(num_ticks);
        let mut price = self.base_price;

        for i in 0..num_ticks {
            price = self.step(scenario, i, num_ticks, price);
            let size: u32 = self.rng.gen_range(1..1_000);
            ticks.push(Tick::new(
                self.start + spacing * i as i32,
                to_price(price),
                Decimal::from(size),
            ));
        }

        ticks
    }

    /// Next price of the path for step `i` of `total`
    fn step(&mut self, scenario: MarketScenario, i: usize, total: usize, price: f64) -> f64 {
        let next = match scenario {
            MarketScenario::Uptrend => {
                price * (1.0 + 0.002 + self.rng.gen_range(-0.001..0.001))
            }
            MarketScenario::Downtrend => {
                price * (1.0 - 0.002 + self.rng.gen_range(-0.001..0.001))
            }
            MarketScenario::Sideways => {
                let reversion = (self.base_price - price) * 0.1;
                price + reversion + price * self.rng.gen_range(-0.01..0.01)
            }
            MarketScenario::Crash => {
                // Drop 30% over the 5% of steps starting at 60% of the series
                let crash_start = total * 3 / 5;
                let crash_len = (total / 20).max(1);
                let noise = self.rng.gen_range(-0.002..0.002);
                if (crash_start..crash_start + crash_len).contains(&i) {
                    let per_step = 0.7_f64.powf(1.0 / crash_len as f64);
                    price * (per_step + noise)
                } else {
                    price * (1.0 + noise)
                }
            }
        };

        next.max(self.base_price * 0.01)
    }
}

fn to_price(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or_default().round_dp(6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::BarValidator;

    #[test]
    fn test_same_seed_same_series() {
        let a = SyntheticDataGenerator::new(7).generate(
            MarketScenario::Sideways,
            100,
            Duration::minutes(5),
        );
        let b = SyntheticDataGenerator::new(7).generate(
            MarketScenario::Sideways,
            100,
            Duration::minutes(5),
        );
        assert_eq!(a, b);

        let c = SyntheticDataGenerator::new(8).generate(
            MarketScenario::Sideways,
            100,
            Duration::minutes(5),
        );
        assert_ne!(a, c);
    }

    #[test]
    fn test_bars_are_valid_and_contiguous() {
        let bars = SyntheticDataGenerator::new(42).generate(
            MarketScenario::Crash,
            300,
            Duration::minutes(5),
        );
        let (valid, dropped) = BarValidator::new().filter_valid(bars.clone());

        assert_eq!(dropped, 0);
        assert_eq!(valid.len(), 300);
        assert!(bars
            .windows(2)
            .all(|w| w[1].timestamp - w[0].timestamp == Duration::minutes(5)));
        assert!(bars.windows(2).all(|w| w[1].open == w[0].close));
    }

    #[test]
    fn test_scenarios_move_in_their_direction() {
        let up = SyntheticDataGenerator::new(1).generate(
            MarketScenario::Uptrend,
            200,
            Duration::minutes(5),
        );
        let down = SyntheticDataGenerator::new(1).generate(
            MarketScenario::Downtrend,
            200,
            Duration::minutes(5),
        );
        let crash = SyntheticDataGenerator::new(1).generate(
            MarketScenario::Crash,
            200,
            Duration::minutes(5),
        );

        assert!(up.last().unwrap().close > up[0].open);
        assert!(down.last().unwrap().close < down[0].open);

        let lowest = crash.iter().map(|b| b.low).min().unwrap();
        assert!(lowest < crash[0].open * Decimal::new(8, 1));
    }

    #[test]
    fn test_ticks_are_ordered() {
        let ticks = SyntheticDataGenerator::new(3).generate_ticks(
            MarketScenario::Uptrend,
            50,
            Duration::milliseconds(250),
        );
        assert_eq!(ticks.len(), 50);
        assert!(ticks.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert!(ticks.iter().all(|t| t.price > Decimal::ZERO));
    }

    #[test]
    fn test_scenario_from_str() {
        assert_eq!("Crash".parse::<MarketScenario>(), Ok(MarketScenario::Crash));
        assert!("volatile".parse::<MarketScenario>().is_err());
    }
}
