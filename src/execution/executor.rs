use chrono::{DateTime, Utc};

use crate::error::{EngineError, Result};
use crate::execution::ledger::{ClosingReport, OpenOutcome, PositionLedger};
use crate::models::{Bar, Signal};
use crate::strategy::{Cursor, CyclePhase, SignalContext, SignalSource};

/// Result of one two-phase cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub timestamp: DateTime<Utc>,
    pub close_signal: Signal,
    pub closing: ClosingReport,
    pub open_signal: Signal,
    pub opening: OpenOutcome,
}

/// Steps of one cycle: query for closes, apply them, query again, open
enum CycleState {
    CloseCheck,
    Reopen { close_signal: Signal, closing: ClosingReport },
    Complete(Box<CycleReport>),
}

/// Drives a [`PositionLedger`] from a [`SignalSource`], one bar per cycle
pub struct ExecutionLoop<S> {
    ledger: PositionLedger,
    source: S,
    symbol: String,
}

impl<S: SignalSource> ExecutionLoop<S> {
    pub fn new(ledger: PositionLedger, source: S, symbol: impl Into<String>) -> Self {
        Self {
            ledger,
            source,
            symbol: symbol.into(),
        }
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut PositionLedger {
        &mut self.ledger
    }

    pub fn into_ledger(self) -> PositionLedger {
        self.ledger
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Evaluate the last bar of `bars`
    ///
    /// The source is queried once before closing and again after, so the
    /// opening decision sees positions and balance as the closes left them.
    pub fn run_cycle(&mut self, cursor: Cursor, bars: &[Bar]) -> Result<CycleReport> {
        let bar = bars
            .last()
            .ok_or(EngineError::InsufficientData { needed: 1, got: 0 })?;

        let mut state = CycleState::CloseCheck;
        loop {
            state = match state {
                CycleState::CloseCheck => {
                    let close_signal = self.query(CyclePhase::CloseCheck, cursor, bars);
                    let closing = self
                        .ledger
                        .process_closing(&self.symbol, bar, &close_signal);
                    CycleState::Reopen {
                        close_signal,
                        closing,
                    }
                }
                CycleState::Reopen {
                    close_signal,
                    closing,
                } => {
                    let open_signal = self.query(CyclePhase::Reopen, cursor, bars);
                    let opening = self
                        .ledger
                        .process_opening(&self.symbol, bar, &open_signal);
                    CycleState::Complete(Box::new(CycleReport {
                        timestamp: bar.timestamp,
                        close_signal,
                        closing,
                        open_signal,
                        opening,
                    }))
                }
                CycleState::Complete(report) => return Ok(*report),
            };
        }
    }

    /// Ask the source for a signal against the ledger's current state
    ///
    /// Source errors and invalid signals are logged and become a hold.
    fn query(&self, phase: CyclePhase, cursor: Cursor, bars: &[Bar]) -> Signal {
        let ctx = SignalContext {
            cursor,
            bars,
            balance: self.ledger.balance(),
            leverage: self.ledger.leverage(),
            current_direction: self.ledger.current_direction(&self.symbol),
            phase,
        };

        let signal = match self.source.generate_signal(&ctx) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!(
                    source = self.source.name(),
                    phase = ?phase,
                    "Signal source failed, holding: {}",
                    e
                );
                return Signal::hold();
            }
        };

        if let Err(e) = signal.validate() {
            tracing::warn!(
                source = self.source.name(),
                phase = ?phase,
                "Discarding invalid signal: {}",
                e
            );
            return Signal::hold();
        }

        tracing::debug!(phase = ?phase, signal = ?signal, "Signal");
        signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ledger::{FeeModel, LedgerConfig};
    use crate::models::{CloseReason, Direction, ExitSignal};
    use crate::strategy::FnSignalSource;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ledger() -> PositionLedger {
        PositionLedger::new(LedgerConfig {
            fees: FeeModel::flat(Decimal::ZERO),
            ..Default::default()
        })
    }

    fn bar(price: i64) -> Bar {
        Bar::flat(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            Decimal::from(price),
        )
    }

    #[test]
    fn test_reopen_phase_sees_closes_from_same_cycle() {
        // Reverse: exit longs, then open short only once no position is held
        let source = FnSignalSource::new("reverse", 1, |ctx: &SignalContext<'_>| {
            match (ctx.phase, ctx.current_direction) {
                (CyclePhase::CloseCheck, Some(Direction::Long)) => {
                    Signal::exit(Direction::Long)
                }
                (CyclePhase::Reopen, None) => Signal::open(Direction::Short, Decimal::from(10)),
                _ => Signal::hold(),
            }
        });

        let mut ledger = ledger();
        ledger
            .open_position(
                "DOGE",
                Direction::Long,
                Decimal::ONE,
                None,
                None,
                Decimal::from(10),
                bar(1).timestamp,
            )
            .unwrap();

        let mut exec = ExecutionLoop::new(ledger, source, "DOGE");
        let report = exec.run_cycle(Cursor::Index(0), &[bar(2)]).unwrap();

        assert_eq!(report.closing.closes.len(), 1);
        assert_eq!(report.closing.closes[0].reason, CloseReason::ExitSignal);
        assert!(matches!(report.opening, OpenOutcome::Opened { .. }));
        assert_eq!(
            exec.ledger().current_direction("DOGE"),
            Some(Direction::Short)
        );
    }

    #[test]
    fn test_source_queried_twice_per_cycle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let source = FnSignalSource::new("count", 1, move |_ctx: &SignalContext<'_>| {
            counter.fetch_add(1, Ordering::SeqCst);
            Signal::hold()
        });

        let mut exec = ExecutionLoop::new(ledger(), source, "DOGE");
        exec.run_cycle(Cursor::Index(0), &[bar(1)]).unwrap();
        exec.run_cycle(Cursor::Index(1), &[bar(1), bar(1)]).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_invalid_signal_is_treated_as_hold() {
        let source = FnSignalSource::new("broken", 1, |_ctx: &SignalContext<'_>| {
            Signal::open(Direction::Long, Decimal::ONE)
                .with_exit(ExitSignal::All)
                .with_exit_ratio(Decimal::from(2))
        });

        let mut exec = ExecutionLoop::new(ledger(), source, "DOGE");
        let report = exec.run_cycle(Cursor::Index(0), &[bar(1)]).unwrap();

        assert!(report.open_signal.is_hold());
        assert_eq!(report.opening, OpenOutcome::NoSignal);
        assert!(exec.ledger().trade_log().is_empty());
    }

    #[test]
    fn test_empty_bars_is_an_error() {
        let source = FnSignalSource::new("hold", 1, |_ctx: &SignalContext<'_>| Signal::hold());
        let mut exec = ExecutionLoop::new(ledger(), source, "DOGE");
        assert!(matches!(
            exec.run_cycle(Cursor::Index(0), &[]),
            Err(EngineError::InsufficientData { .. })
        ));
    }
}
