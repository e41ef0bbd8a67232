use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{EngineError, Result};
use crate::execution::kline_buffer::BarSnapshot;
use crate::execution::ledger::{PositionLedger, PositionSizer};
use crate::models::{Bar, CloseReason, Direction, Signal, TradeLogEntry};
use crate::persistence::JsonLinesLog;
use crate::strategy::{Cursor, CyclePhase, SignalContext, SignalSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Side that opens a position in `direction`
    pub fn opening(direction: Direction) -> Self {
        match direction {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }

    /// Side that reduces a position in `direction`
    pub fn closing(direction: Direction) -> Self {
        Self::opening(direction.opposite())
    }
}

/// Market order sent to an [`OrderEndpoint`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub instrument: String,
    pub side: OrderSide,
    pub position_side: Direction,
    pub size: Decimal,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub reduce_only: bool,
    /// Price the decision was made at; paper endpoints fill here
    pub reference_price: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    pub filled_size: Decimal,
}

/// Open exposure reported by an endpoint
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionInfo {
    pub direction: Direction,
    pub size: Decimal,
}

/// Order execution endpoint used by the live executor
#[async_trait]
pub trait OrderEndpoint: Send + Sync {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck>;

    async fn available_balance(&self) -> Result<Decimal>;

    async fn open_position(&self, instrument: &str) -> Result<Option<PositionInfo>>;

    /// Latest one-second bar; simulated endpoints use it for TP/SL and liquidation
    async fn on_market_update(&self, _instrument: &str, _bar: &Bar) -> Result<()> {
        Ok(())
    }
}

/// Order endpoint that fills against a local [`PositionLedger`]
///
/// With a trade log attached, every new ledger entry is appended to it after
/// each fill.
#[derive(Clone)]
pub struct PaperExchange {
    ledger: Arc<Mutex<PositionLedger>>,
    trade_log: Option<Arc<JsonLinesLog<TradeLogEntry>>>,
    persisted: Arc<AtomicUsize>,
}

impl PaperExchange {
    pub fn new(ledger: Arc<Mutex<PositionLedger>>) -> Self {
        let persisted = ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .trade_log()
            .len();
        Self {
            ledger,
            trade_log: None,
            persisted: Arc::new(AtomicUsize::new(persisted)),
        }
    }

    pub fn with_trade_log(mut self, log: JsonLinesLog<TradeLogEntry>) -> Self {
        self.trade_log = Some(Arc::new(log));
        self
    }

    pub fn ledger(&self) -> Arc<Mutex<PositionLedger>> {
        self.ledger.clone()
    }

    /// Append trade log entries not yet written; called with the ledger locked
    fn persist(&self, ledger: &PositionLedger) -> Result<()> {
        let Some(log) = &self.trade_log else {
            return Ok(());
        };
        let entries = ledger.trade_log();
        let from = self.persisted.load(Ordering::SeqCst).min(entries.len());
        let written = log.append_all(&entries[from..])?;
        self.persisted.store(from + written, Ordering::SeqCst);
        Ok(())
    }

    fn reduce(ledger: &mut PositionLedger, order: &OrderRequest) -> Result<Decimal> {
        let mut remaining = order.size;
        let mut filled = Decimal::ZERO;

        let targets: Vec<_> = ledger
            .positions(&order.instrument)
            .iter()
            .filter(|p| p.direction == order.position_side)
            .map(|p| (p.id, p.size))
            .collect();

        for (id, size) in targets {
            if remaining <= Decimal::ZERO {
                break;
            }
            let ratio = (remaining / size).min(Decimal::ONE);
            ledger.close_partial(
                &order.instrument,
                id,
                ratio,
                order.reference_price,
                order.timestamp,
                CloseReason::ExitSignal,
            )?;
            let closed = size * ratio;
            remaining -= closed;
            filled += closed;
        }

        if filled.is_zero() {
            return Err(EngineError::InvalidOrder {
                symbol: order.instrument.clone(),
                reason: format!("no {} position to reduce", order.position_side),
            });
        }
        Ok(filled)
    }
}

#[async_trait]
impl OrderEndpoint for PaperExchange {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);

        if order.reduce_only {
            let filled = Self::reduce(&mut ledger, order);
            self.persist(&ledger)?;
            return Ok(OrderAck {
                order_id: uuid::Uuid::new_v4().to_string(),
                filled_size: filled?,
            });
        }

        let id = ledger.open_position(
            &order.instrument,
            order.position_side,
            order.reference_price,
            order.take_profit,
            order.stop_loss,
            order.size,
            order.timestamp,
        )?;
        self.persist(&ledger)?;
        Ok(OrderAck {
            order_id: id.to_string(),
            filled_size: order.size,
        })
    }

    async fn available_balance(&self) -> Result<Decimal> {
        Ok(self
            .ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .balance())
    }

    async fn open_position(&self, instrument: &str) -> Result<Option<PositionInfo>> {
        let ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        let positions = ledger.positions(instrument);
        Ok(positions.first().map(|first| PositionInfo {
            direction: first.direction,
            size: positions
                .iter()
                .filter(|p| p.direction == first.direction)
                .map(|p| p.size)
                .sum(),
        }))
    }

    async fn on_market_update(&self, instrument: &str, bar: &Bar) -> Result<()> {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        let report = ledger.process_closing(instrument, bar, &Signal::hold());
        if !report.is_empty() {
            tracing::info!(
                symbol = %instrument,
                closes = report.closes.len(),
                liquidations = report.liquidations.len(),
                "Paper positions closed by the market"
            );
        }
        self.persist(&ledger)
    }
}

/// What a live cycle did
#[derive(Debug, Clone, PartialEq)]
pub enum LiveCycleOutcome {
    Skipped(String),
    Traded {
        closed: Option<OrderAck>,
        opened: Option<OrderAck>,
    },
}

/// Two-phase execution cycle against an external order endpoint
///
/// Any endpoint failure halts order placement until
/// [`acknowledge_halt`](Self::acknowledge_halt) is called. Orders are never
/// retried.
pub struct LiveExecutor<S, E> {
    source: S,
    endpoint: E,
    symbol: String,
    leverage: Decimal,
    allow_multiple_positions: bool,
    history_bars: usize,
    sizer: PositionSizer,
    halted: Option<String>,
    last_open_bar: Option<DateTime<Utc>>,
}

impl<S: SignalSource, E: OrderEndpoint> LiveExecutor<S, E> {
    pub fn new(
        source: S,
        endpoint: E,
        symbol: impl Into<String>,
        leverage: Decimal,
        allow_multiple_positions: bool,
        history_bars: usize,
    ) -> Self {
        Self {
            source,
            endpoint,
            symbol: symbol.into(),
            leverage,
            allow_multiple_positions,
            history_bars,
            sizer: PositionSizer::verbatim(),
            halted: None,
            last_open_bar: None,
        }
    }

    /// Size openings with the account's sizing policy instead of verbatim
    pub fn with_sizer(mut self, sizer: PositionSizer) -> Self {
        self.sizer = sizer;
        self
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn halt_reason(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    /// Operator acknowledgement that resumes order placement
    pub fn acknowledge_halt(&mut self) {
        if let Some(reason) = self.halted.take() {
            tracing::info!(symbol = %self.symbol, "Trading halt acknowledged: {}", reason);
        }
    }

    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    /// Run one cycle on the latest snapshot and finalized history
    pub async fn run_cycle(
        &mut self,
        snapshot: &BarSnapshot,
        history: &[Bar],
    ) -> Result<LiveCycleOutcome> {
        if let Some(reason) = &self.halted {
            return Err(EngineError::TradingHalted(reason.clone()));
        }
        if snapshot.stale {
            return Ok(LiveCycleOutcome::Skipped("live bar is stale".to_string()));
        }
        if snapshot.live_bar.is_none() {
            return Ok(LiveCycleOutcome::Skipped("no live bar yet".to_string()));
        }

        if let Some(second) = &snapshot.second_bar {
            if let Err(e) = self.endpoint.on_market_update(&self.symbol, second).await {
                return Err(self.halt(e));
            }
        }

        let bars = merge_live_bar(history, snapshot.live_bar.as_ref(), self.history_bars);
        let needed = self.source.min_bars_required();
        if bars.len() < needed {
            return Ok(LiveCycleOutcome::Skipped(format!(
                "need {} bars, have {}",
                needed,
                bars.len()
            )));
        }
        let Some(bar) = bars.last() else {
            return Ok(LiveCycleOutcome::Skipped("no bars".to_string()));
        };
        let cursor = Cursor::Time(snapshot.updated_at);

        // Phase 1: close-check
        let (balance, position) = self.account_state().await?;
        let close_signal = self.query(CyclePhase::CloseCheck, cursor, &bars, balance, position);

        let closed = match position {
            Some(held) if close_signal.exit.matches(held.direction) => {
                let order = OrderRequest {
                    instrument: self.symbol.clone(),
                    side: OrderSide::closing(held.direction),
                    position_side: held.direction,
                    size: held.size * close_signal.exit_ratio,
                    take_profit: None,
                    stop_loss: None,
                    reduce_only: true,
                    reference_price: bar.close,
                    timestamp: bar.timestamp,
                };
                Some(self.submit(&order).await?)
            }
            _ => None,
        };

        // Phase 2: reopen against refreshed state
        let (balance, position) = self.account_state().await?;
        let open_signal = self.query(CyclePhase::Reopen, cursor, &bars, balance, position);

        let opened = match open_signal.direction {
            None => None,
            Some(_) if position.is_some() && !self.allow_multiple_positions => {
                tracing::debug!(symbol = %self.symbol, "Position already open, not opening");
                None
            }
            Some(_) if self.last_open_bar == Some(bar.timestamp) => {
                tracing::debug!(
                    symbol = %self.symbol,
                    bar = %bar.timestamp,
                    "Already opened on this bar"
                );
                None
            }
            Some(direction) => {
                let size = self.sizer.resolve(bar.close, balance, open_signal.size);
                if size <= Decimal::ZERO {
                    None
                } else {
                    let order = OrderRequest {
                        instrument: self.symbol.clone(),
                        side: OrderSide::opening(direction),
                        position_side: direction,
                        size,
                        take_profit: open_signal.take_profit,
                        stop_loss: open_signal.stop_loss,
                        reduce_only: false,
                        reference_price: bar.close,
                        timestamp: bar.timestamp,
                    };
                    let ack = self.submit(&order).await?;
                    self.last_open_bar = Some(bar.timestamp);
                    Some(ack)
                }
            }
        };

        Ok(LiveCycleOutcome::Traded { closed, opened })
    }

    async fn account_state(&mut self) -> Result<(Decimal, Option<PositionInfo>)> {
        let balance = match self.endpoint.available_balance().await {
            Ok(balance) => balance,
            Err(e) => return Err(self.halt(e)),
        };
        let position = match self.endpoint.open_position(&self.symbol).await {
            Ok(position) => position,
            Err(e) => return Err(self.halt(e)),
        };
        Ok((balance, position))
    }

    async fn submit(&mut self, order: &OrderRequest) -> Result<OrderAck> {
        tracing::info!(
            symbol = %order.instrument,
            side = ?order.side,
            position_side = %order.position_side,
            size = %order.size,
            reduce_only = order.reduce_only,
            "Placing order"
        );
        match self.endpoint.place_order(order).await {
            Ok(ack) => Ok(ack),
            Err(e) => Err(self.halt(e)),
        }
    }

    fn halt(&mut self, error: EngineError) -> EngineError {
        let reason = error.to_string();
        tracing::error!(
            symbol = %self.symbol,
            "Order endpoint failed, halting order placement: {}",
            reason
        );
        self.halted = Some(reason);
        error
    }

    fn query(
        &self,
        phase: CyclePhase,
        cursor: Cursor,
        bars: &[Bar],
        balance: Decimal,
        position: Option<PositionInfo>,
    ) -> Signal {
        let ctx = SignalContext {
            cursor,
            bars,
            balance,
            leverage: self.leverage,
            current_direction: position.map(|p| p.direction),
            phase,
        };
        match self
            .source
            .generate_signal(&ctx)
            .and_then(|s| s.validate().map(|_| s))
        {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!(phase = ?phase, "Holding after bad signal: {}", e);
                Signal::hold()
            }
        }
    }
}

/// Last `window` bars of history followed by the live bar
///
/// When the live bar has the same timestamp as the last finalized bar, the
/// finalized one wins.
pub fn merge_live_bar(history: &[Bar], live: Option<&Bar>, window: usize) -> Vec<Bar> {
    let mut bars: Vec<Bar> = history.to_vec();
    if let Some(live) = live {
        let extends = bars.last().map_or(true, |last| live.timestamp > last.timestamp);
        if extends {
            bars.push(live.clone());
        }
    }
    let start = bars.len().saturating_sub(window);
    bars.split_off(start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ledger::{FeeModel, LedgerConfig, OpenOutcome, SizingPolicy};
    use crate::models::ExitSignal;
    use crate::strategy::FnSignalSource;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn history(n: i64) -> Vec<Bar> {
        (0..n)
            .map(|i| Bar::flat(start() + Duration::minutes(5 * i), Decimal::ONE))
            .collect()
    }

    fn snapshot_at(minutes: i64, price: Decimal) -> BarSnapshot {
        let ts = start() + Duration::minutes(minutes);
        BarSnapshot {
            second_bar: Some(Bar::flat(ts, price)),
            live_bar: Some(Bar::flat(ts, price)),
            seq: 1,
            stale: false,
            updated_at: ts,
        }
    }

    fn paper() -> PaperExchange {
        PaperExchange::new(Arc::new(Mutex::new(PositionLedger::new(LedgerConfig {
            fees: FeeModel::flat(Decimal::ZERO),
            ..Default::default()
        }))))
    }

    /// Endpoint whose order path always fails
    struct RejectingEndpoint {
        orders: AtomicUsize,
    }

    #[async_trait]
    impl OrderEndpoint for RejectingEndpoint {
        async fn place_order(&self, _order: &OrderRequest) -> Result<OrderAck> {
            self.orders.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::ExchangeApi("51008 insufficient balance".to_string()))
        }

        async fn available_balance(&self) -> Result<Decimal> {
            Ok(Decimal::from(1000))
        }

        async fn open_position(&self, _instrument: &str) -> Result<Option<PositionInfo>> {
            Ok(None)
        }
    }

    fn always_long() -> impl SignalSource {
        FnSignalSource::new("long", 3, |_ctx: &SignalContext<'_>| {
            Signal::open(Direction::Long, Decimal::from(100))
                .with_take_profit(Decimal::new(12, 1))
                .with_stop_loss(Decimal::new(8, 1))
        })
    }

    #[test]
    fn test_merge_prefers_history_on_duplicate_timestamp() {
        let history = history(3);
        let duplicate = Bar::flat(history[2].timestamp, Decimal::from(9));

        let merged = merge_live_bar(&history, Some(&duplicate), 10);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[2].close, Decimal::ONE);

        let newer = Bar::flat(history[2].timestamp + Duration::minutes(5), Decimal::from(9));
        let merged = merge_live_bar(&history, Some(&newer), 2);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1].close, Decimal::from(9));
    }

    #[tokio::test]
    async fn test_opens_once_with_attached_tp_sl() {
        let endpoint = paper();
        let ledger = endpoint.ledger();
        let mut exec = LiveExecutor::new(
            always_long(),
            endpoint,
            "DOGE-USDT-SWAP",
            Decimal::from(10),
            false,
            22,
        );

        let outcome = exec
            .run_cycle(&snapshot_at(15, Decimal::ONE), &history(3))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            LiveCycleOutcome::Traded {
                opened: Some(_),
                ..
            }
        ));

        // Second cycle sees the open position and does nothing
        exec.run_cycle(&snapshot_at(15, Decimal::ONE), &history(3))
            .await
            .unwrap();

        let ledger = ledger.lock().unwrap();
        let positions = ledger.positions("DOGE-USDT-SWAP");
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].take_profit, Some(Decimal::new(12, 1)));
        assert_eq!(positions[0].stop_loss, Some(Decimal::new(8, 1)));
    }

    #[tokio::test]
    async fn test_exit_then_reverse() {
        let endpoint = paper();
        let ledger = endpoint.ledger();
        ledger
            .lock()
            .unwrap()
            .open_position(
                "DOGE-USDT-SWAP",
                Direction::Long,
                Decimal::ONE,
                None,
                None,
                Decimal::from(100),
                start(),
            )
            .unwrap();

        let source = FnSignalSource::new("flip", 1, |ctx: &SignalContext<'_>| {
            match ctx.current_direction {
                Some(Direction::Long) => Signal::hold().with_exit(ExitSignal::Close(Direction::Long)),
                _ => Signal::open(Direction::Short, Decimal::from(50)),
            }
        });
        let mut exec =
            LiveExecutor::new(source, endpoint, "DOGE-USDT-SWAP", Decimal::from(10), false, 22);

        let outcome = exec
            .run_cycle(&snapshot_at(15, Decimal::new(11, 1)), &history(3))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            LiveCycleOutcome::Traded {
                closed: Some(_),
                opened: Some(_)
            }
        ));
        let ledger = ledger.lock().unwrap();
        assert_eq!(
            ledger.current_direction("DOGE-USDT-SWAP"),
            Some(Direction::Short)
        );
        assert_eq!(ledger.trade_log().len(), 3);
    }

    #[tokio::test]
    async fn test_endpoint_error_halts_until_acknowledged() {
        let endpoint = RejectingEndpoint {
            orders: AtomicUsize::new(0),
        };
        let mut exec =
            LiveExecutor::new(always_long(), endpoint, "DOGE-USDT-SWAP", Decimal::from(10), false, 22);

        let first = exec
            .run_cycle(&snapshot_at(15, Decimal::ONE), &history(3))
            .await;
        assert!(matches!(first, Err(EngineError::ExchangeApi(_))));
        assert!(exec.is_halted());

        let second = exec
            .run_cycle(&snapshot_at(20, Decimal::ONE), &history(4))
            .await;
        assert!(matches!(second, Err(EngineError::TradingHalted(_))));
        // No automatic retry
        assert_eq!(exec.endpoint().orders.load(Ordering::SeqCst), 1);

        exec.acknowledge_halt();
        assert!(!exec.is_halted());
        let _ = exec
            .run_cycle(&snapshot_at(20, Decimal::ONE), &history(4))
            .await;
        assert_eq!(exec.endpoint().orders.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_snapshot_skips_cycle() {
        let mut exec = LiveExecutor::new(
            always_long(),
            paper(),
            "DOGE-USDT-SWAP",
            Decimal::from(10),
            false,
            22,
        );
        let mut snapshot = snapshot_at(15, Decimal::ONE);
        snapshot.stale = true;

        let outcome = exec.run_cycle(&snapshot, &history(3)).await.unwrap();
        assert!(matches!(outcome, LiveCycleOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn test_balance_ratio_sizes_live_like_backtest() {
        let config = LedgerConfig {
            sizing: SizingPolicy::BalanceRatio,
            fees: FeeModel::flat(Decimal::ZERO),
            ..Default::default()
        };
        let seven = || Signal::open(Direction::Long, Decimal::from(7));

        let mut backtest = PositionLedger::new(config.clone());
        let bar = Bar::flat(start() + Duration::minutes(15), Decimal::ONE);
        let OpenOutcome::Opened {
            size: backtest_size,
            ..
        } = backtest.process_opening("DOGE-USDT-SWAP", &bar, &seven())
        else {
            panic!("backtest ledger did not open");
        };

        let endpoint = PaperExchange::new(Arc::new(Mutex::new(PositionLedger::new(
            config.clone(),
        ))));
        let ledger = endpoint.ledger();
        let mut exec = LiveExecutor::new(
            FnSignalSource::new("seven", 3, move |_ctx: &SignalContext<'_>| seven()),
            endpoint,
            "DOGE-USDT-SWAP",
            config.leverage,
            false,
            22,
        )
        .with_sizer(config.sizer());
        exec.run_cycle(&snapshot_at(15, Decimal::ONE), &history(3))
            .await
            .unwrap();

        // 10000 * 0.1 * 10 / 1
        assert_eq!(backtest_size, Decimal::from(10_000));
        let ledger = ledger.lock().unwrap();
        let live = ledger.positions("DOGE-USDT-SWAP");
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].size, backtest_size);
    }

    #[tokio::test]
    async fn test_history_without_live_bar_does_not_trade() {
        let endpoint = paper();
        let ledger = endpoint.ledger();
        let mut exec = LiveExecutor::new(
            always_long(),
            endpoint,
            "DOGE-USDT-SWAP",
            Decimal::from(10),
            false,
            22,
        );
        let mut snapshot = snapshot_at(15, Decimal::ONE);
        snapshot.second_bar = None;
        snapshot.live_bar = None;

        let outcome = exec.run_cycle(&snapshot, &history(5)).await.unwrap();
        assert!(matches!(outcome, LiveCycleOutcome::Skipped(_)));
        assert!(ledger.lock().unwrap().trade_log().is_empty());
    }

    #[tokio::test]
    async fn test_second_bar_triggers_paper_take_profit() {
        let endpoint = paper();
        let ledger = endpoint.ledger();
        let mut exec = LiveExecutor::new(
            always_long(),
            endpoint,
            "DOGE-USDT-SWAP",
            Decimal::from(10),
            false,
            22,
        );

        exec.run_cycle(&snapshot_at(15, Decimal::ONE), &history(3))
            .await
            .unwrap();

        // The next second trades through the take profit; the position is
        // closed before the signal is consulted, and a new bar allows a reopen
        let outcome = exec
            .run_cycle(&snapshot_at(20, Decimal::new(13, 1)), &history(4))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            LiveCycleOutcome::Traded {
                closed: None,
                opened: Some(_)
            }
        ));

        let ledger = ledger.lock().unwrap();
        let tp_close = ledger
            .trade_log()
            .iter()
            .find(|e| e.reason == Some(CloseReason::TakeProfit))
            .unwrap();
        assert_eq!(tp_close.price, Decimal::new(12, 1));
        assert_eq!(tp_close.pnl, Some(Decimal::from(20)));
    }

    #[tokio::test]
    async fn test_paper_fills_are_appended_to_trade_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.jsonl");
        let endpoint = paper().with_trade_log(JsonLinesLog::open(&path).unwrap());
        let mut exec = LiveExecutor::new(
            always_long(),
            endpoint,
            "DOGE-USDT-SWAP",
            Decimal::from(10),
            false,
            22,
        );

        exec.run_cycle(&snapshot_at(15, Decimal::ONE), &history(3))
            .await
            .unwrap();
        exec.run_cycle(&snapshot_at(20, Decimal::new(7, 1)), &history(4))
            .await
            .unwrap();

        let logged = JsonLinesLog::<TradeLogEntry>::load_all(&path).unwrap();
        let ledger = exec.endpoint().ledger();
        let ledger = ledger.lock().unwrap();
        // open, liquidation at 0.7, reopen
        assert_eq!(logged.len(), 3);
        assert_eq!(logged.as_slice(), ledger.trade_log());
        assert_eq!(logged[1].reason, Some(CloseReason::Liquidation));
    }
}
