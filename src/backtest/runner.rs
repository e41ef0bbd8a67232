use rust_decimal::Decimal;

use crate::backtest::metrics::{BacktestMetrics, EquityPoint};
use crate::error::{EngineError, Result};
use crate::execution::{ExecutionLoop, LedgerConfig, PositionLedger};
use crate::models::{Bar, CloseReason};
use crate::strategy::{Cursor, SignalSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacktestOptions {
    /// Close whatever is still open at the last processed close
    pub close_at_end: bool,
    /// Stop once the balance is gone and nothing is open
    pub stop_when_bust: bool,
}

impl Default for BacktestOptions {
    fn default() -> Self {
        Self {
            close_at_end: true,
            stop_when_bust: true,
        }
    }
}

/// Backtest runner that replays historical bars through the execution loop
pub struct BacktestRunner {
    config: LedgerConfig,
    symbol: String,
    options: BacktestOptions,
}

impl BacktestRunner {
    pub fn new(config: LedgerConfig, symbol: impl Into<String>) -> Self {
        Self {
            config,
            symbol: symbol.into(),
            options: BacktestOptions::default(),
        }
    }

    pub fn with_options(mut self, options: BacktestOptions) -> Self {
        self.options = options;
        self
    }

    /// Run a backtest of `source` over `bars`
    ///
    /// The first cycle evaluates bar index `min_bars_required()`; every
    /// cycle sees the bars up to and including the current one.
    pub fn run<S: SignalSource>(&self, source: S, bars: &[Bar]) -> Result<BacktestMetrics> {
        let first = source.min_bars_required();
        if bars.len() <= first {
            return Err(EngineError::InsufficientData {
                needed: first + 1,
                got: bars.len(),
            });
        }

        let strategy = source.name().to_string();
        tracing::info!(
            symbol = %self.symbol,
            strategy = %strategy,
            bars = bars.len(),
            first_cycle = first,
            "Starting backtest"
        );

        let ledger = PositionLedger::new(self.config.clone());
        let mut engine = ExecutionLoop::new(ledger, source, self.symbol.clone());
        let mut equity_curve = Vec::with_capacity(bars.len() - first);
        let mut last_bar = &bars[first];
        let mut processed = 0;

        for i in first..bars.len() {
            let window = &bars[..=i];
            let bar = &bars[i];
            let report = engine.run_cycle(Cursor::Index(i), window)?;
            last_bar = bar;
            processed += 1;

            for event in &report.closing.liquidations {
                tracing::warn!(
                    symbol = %self.symbol,
                    timestamp = %bar.timestamp,
                    position_id = %event.position_id,
                    net_pnl = %event.net_pnl,
                    "Position liquidated"
                );
            }

            let summary = engine.ledger().calculate_total_balance_and_roi(bar.close);
            equity_curve.push(EquityPoint {
                timestamp: bar.timestamp,
                equity: summary.total_balance,
            });

            let ledger = engine.ledger();
            if self.options.stop_when_bust
                && ledger.balance() <= Decimal::ZERO
                && ledger.open_position_count() == 0
            {
                tracing::warn!(
                    symbol = %self.symbol,
                    timestamp = %bar.timestamp,
                    "Balance exhausted, stopping backtest early"
                );
                break;
            }
        }

        if self.options.close_at_end && engine.ledger().has_open_position(&self.symbol) {
            let closed = engine.ledger_mut().close_all(
                &self.symbol,
                last_bar.close,
                last_bar.timestamp,
                CloseReason::EndOfData,
            );
            tracing::info!(
                symbol = %self.symbol,
                closed = closed.len(),
                price = %last_bar.close,
                "Closed remaining positions at end of data"
            );
        }

        let ledger = engine.into_ledger();
        let summary = ledger.calculate_total_balance_and_roi(last_bar.close);

        tracing::info!(
            symbol = %self.symbol,
            final_balance = %summary.total_balance,
            roi_pct = %summary.roi_pct.round_dp(2),
            trades = summary.total_trades,
            "Backtest complete"
        );

        Ok(BacktestMetrics::from_run(
            &self.symbol,
            &strategy,
            processed,
            ledger.initial_balance(),
            summary,
            equity_curve,
            ledger.trade_log().to_vec(),
        ))
    }

    /// Run and print the report
    pub fn run_and_report<S: SignalSource>(
        &self,
        source: S,
        bars: &[Bar],
    ) -> Result<BacktestMetrics> {
        let metrics = self.run(source, bars)?;
        metrics.print_report();
        Ok(metrics)
    }
}
