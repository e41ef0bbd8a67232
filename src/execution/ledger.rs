use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{
    Bar, CloseReason, Direction, Position, Signal, TradeAction, TradeLogEntry,
};

/// Opening and closing fee rates, charged on notional
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "FeeSpec", into = "FeeSpec")]
pub struct FeeModel {
    pub open_rate: Decimal,
    pub close_rate: Decimal,
}

/// Configuration shape: either one rate for both sides or one per side
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum FeeSpec {
    Split {
        open_fee_rate: Decimal,
        close_fee_rate: Decimal,
    },
    Flat {
        fee_rate: Decimal,
    },
}

impl From<FeeSpec> for FeeModel {
    fn from(spec: FeeSpec) -> Self {
        match spec {
            FeeSpec::Split {
                open_fee_rate,
                close_fee_rate,
            } => FeeModel::split(open_fee_rate, close_fee_rate),
            FeeSpec::Flat { fee_rate } => FeeModel::flat(fee_rate),
        }
    }
}

impl From<FeeModel> for FeeSpec {
    fn from(model: FeeModel) -> Self {
        if model.open_rate == model.close_rate {
            FeeSpec::Flat {
                fee_rate: model.open_rate,
            }
        } else {
            FeeSpec::Split {
                open_fee_rate: model.open_rate,
                close_fee_rate: model.close_rate,
            }
        }
    }
}

impl FeeModel {
    pub fn flat(rate: Decimal) -> Self {
        Self {
            open_rate: rate,
            close_rate: rate,
        }
    }

    pub fn split(open_rate: Decimal, close_rate: Decimal) -> Self {
        Self {
            open_rate,
            close_rate,
        }
    }

    pub fn open_fee(&self, price: Decimal, size: Decimal) -> Decimal {
        price * size * self.open_rate
    }

    pub fn close_fee(&self, price: Decimal, size: Decimal) -> Decimal {
        price * size * self.close_rate
    }
}

/// How the opening size is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingPolicy {
    /// Trust the size carried by the signal
    #[default]
    Verbatim,
    /// balance · position_ratio · leverage / price, rounded to `min_unit`
    BalanceRatio,
}

/// Sizing policy together with the account parameters it reads
///
/// Shared by the backtest ledger and the live executor so both size an
/// opening the same way.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSizer {
    pub policy: SizingPolicy,
    pub position_ratio: Decimal,
    pub leverage: Decimal,
    pub min_unit: Decimal,
}

impl PositionSizer {
    /// Sizer that passes the requested size through
    pub fn verbatim() -> Self {
        Self {
            policy: SizingPolicy::Verbatim,
            position_ratio: Decimal::ZERO,
            leverage: Decimal::ONE,
            min_unit: Decimal::ZERO,
        }
    }

    /// Opening size for `requested` at `price` given the available `balance`
    ///
    /// `BalanceRatio` rounds to the nearest multiple of `min_unit`, ties to even.
    pub fn resolve(&self, price: Decimal, balance: Decimal, requested: Decimal) -> Decimal {
        match self.policy {
            SizingPolicy::Verbatim => requested,
            SizingPolicy::BalanceRatio => {
                if price <= Decimal::ZERO || balance <= Decimal::ZERO {
                    return Decimal::ZERO;
                }
                let raw = balance * self.position_ratio * self.leverage / price;
                if self.min_unit > Decimal::ZERO {
                    (raw / self.min_unit).round() * self.min_unit
                } else {
                    raw
                }
            }
        }
    }
}

/// How open positions are valued in [`PositionLedger::calculate_total_balance_and_roi`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValuationMode {
    /// margin + unrealized P&L at the mark
    #[default]
    MarkToMarket,
    /// size · mark / leverage, as the prior system reported it
    LegacyNotional,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub initial_balance: Decimal,
    pub leverage: Decimal,
    pub position_ratio: Decimal,
    pub maintenance_margin_rate: Decimal,
    pub min_unit: Decimal,
    pub fees: FeeModel,
    pub allow_multiple_positions: bool,
    pub sizing: SizingPolicy,
    pub valuation: ValuationMode,
}

impl LedgerConfig {
    pub fn sizer(&self) -> PositionSizer {
        PositionSizer {
            policy: self.sizing,
            position_ratio: self.position_ratio,
            leverage: self.leverage,
            min_unit: self.min_unit,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            initial_balance: Decimal::from(10_000),
            leverage: Decimal::from(10),
            position_ratio: Decimal::new(1, 1),         // 10% of balance
            maintenance_margin_rate: Decimal::new(5, 3), // 0.5%
            min_unit: Decimal::from(10),
            fees: FeeModel::flat(Decimal::new(5, 4)), // 5 bps
            allow_multiple_positions: false,
            sizing: SizingPolicy::Verbatim,
            valuation: ValuationMode::MarkToMarket,
        }
    }
}

/// Forced close recorded during the liquidation scan
#[derive(Debug, Clone, PartialEq)]
pub struct LiquidationEvent {
    pub position_id: Uuid,
    pub direction: Direction,
    pub mark: Decimal,
    pub margin: Decimal,
    pub unrealized_pnl: Decimal,
    pub maintenance_requirement: Decimal,
    pub net_pnl: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloseRecord {
    pub position_id: Uuid,
    pub reason: CloseReason,
    pub price: Decimal,
    pub size: Decimal,
    pub net_pnl: Decimal,
}

/// Everything stages 1-3 of a bar evaluation closed, in order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClosingReport {
    pub liquidations: Vec<LiquidationEvent>,
    pub closes: Vec<CloseRecord>,
}

impl ClosingReport {
    pub fn is_empty(&self) -> bool {
        self.closes.is_empty()
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.closes.iter().map(|c| c.net_pnl).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpenOutcome {
    Opened { position_id: Uuid, size: Decimal },
    NoSignal,
    AlreadyPositioned,
    ZeroSize,
    Rejected { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub total_balance: Decimal,
    pub roi_pct: Decimal,
    pub total_trades: usize,
}

/// Simulated leveraged exchange account
///
/// Owns the balance, the open positions per symbol and the trade log.
/// Balance changes only through opens and closes.
#[derive(Debug, Clone)]
pub struct PositionLedger {
    config: LedgerConfig,
    balance: Decimal,
    positions: HashMap<String, Vec<Position>>,
    trade_log: Vec<TradeLogEntry>,
}

impl PositionLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            balance: config.initial_balance,
            config,
            positions: HashMap::new(),
            trade_log: Vec::new(),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn balance(&self) -> Decimal {
        self.balance
    }

    pub fn initial_balance(&self) -> Decimal {
        self.config.initial_balance
    }

    pub fn leverage(&self) -> Decimal {
        self.config.leverage
    }

    pub fn trade_log(&self) -> &[TradeLogEntry] {
        &self.trade_log
    }

    /// Open positions for a symbol, oldest first
    pub fn positions(&self, symbol: &str) -> &[Position] {
        self.positions
            .get(symbol)
            .map(|p| p.as_slice())
            .unwrap_or_default()
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values().flatten()
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.values().map(|p| p.len()).sum()
    }

    pub fn has_open_position(&self, symbol: &str) -> bool {
        !self.positions(symbol).is_empty()
    }

    /// Direction of the oldest open position for the symbol
    pub fn current_direction(&self, symbol: &str) -> Option<Direction> {
        self.positions(symbol).first().map(|p| p.direction)
    }

    pub fn position(&self, symbol: &str, position_id: Uuid) -> Option<&Position> {
        self.positions(symbol).iter().find(|p| p.id == position_id)
    }

    /// Open a position, debiting margin and the opening fee
    ///
    /// Rejects without touching any state when the balance cannot cover
    /// margin + fee.
    #[allow(clippy::too_many_arguments)]
    pub fn open_position(
        &mut self,
        symbol: &str,
        direction: Direction,
        price: Decimal,
        take_profit: Option<Decimal>,
        stop_loss: Option<Decimal>,
        size: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Result<Uuid> {
        if size <= Decimal::ZERO {
            return Err(EngineError::InvalidOrder {
                symbol: symbol.to_string(),
                reason: format!("non-positive size {}", size),
            });
        }
        if price <= Decimal::ZERO {
            return Err(EngineError::InvalidOrder {
                symbol: symbol.to_string(),
                reason: format!("non-positive price {}", price),
            });
        }

        let margin = price * size / self.config.leverage;
        let entry_fee = self.config.fees.open_fee(price, size);
        let required = margin + entry_fee;

        if self.balance < required {
            tracing::warn!(
                symbol = %symbol,
                required = %required,
                available = %self.balance,
                "Open rejected: insufficient margin"
            );
            return Err(EngineError::InsufficientMargin {
                symbol: symbol.to_string(),
                required,
                available: self.balance,
            });
        }

        let before = self.balance;
        self.balance -= required;

        let position = Position {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            direction,
            size,
            entry_price: price,
            margin,
            entry_fee,
            take_profit,
            stop_loss,
            open_timestamp: timestamp,
        };
        let id = position.id;

        self.trade_log.push(TradeLogEntry {
            timestamp,
            symbol: symbol.to_string(),
            position_id: id,
            action: TradeAction::Open,
            direction,
            price,
            size,
            fee: entry_fee,
            margin,
            pnl: None,
            entry_price: None,
            reason: None,
        });
        self.positions
            .entry(symbol.to_string())
            .or_default()
            .push(position);

        tracing::info!(
            symbol = %symbol,
            direction = %direction,
            size = %size,
            price = %price,
            balance_before = %before,
            balance_after = %self.balance,
            "Opened position"
        );

        Ok(id)
    }

    /// Fully close a position, returning net P&L (after the close fee)
    pub fn close_position(
        &mut self,
        symbol: &str,
        position_id: Uuid,
        exit_price: Decimal,
        timestamp: DateTime<Utc>,
        reason: CloseReason,
    ) -> Result<Decimal> {
        let position = self.take_position(symbol, position_id)?;
        Ok(self.settle(&position, exit_price, timestamp, reason))
    }

    /// Close `ratio` of a position and keep the remainder open
    ///
    /// The closed slice takes its proportional share of margin and entry fee;
    /// the remainder keeps the entry price. A ratio of 1 or more is a full close.
    pub fn close_partial(
        &mut self,
        symbol: &str,
        position_id: Uuid,
        ratio: Decimal,
        exit_price: Decimal,
        timestamp: DateTime<Utc>,
        reason: CloseReason,
    ) -> Result<Decimal> {
        if ratio >= Decimal::ONE {
            return self.close_position(symbol, position_id, exit_price, timestamp, reason);
        }
        if ratio <= Decimal::ZERO {
            return Err(EngineError::InvalidOrder {
                symbol: symbol.to_string(),
                reason: format!("partial close ratio {} must be positive", ratio),
            });
        }

        let slice = {
            let position = self
                .positions
                .get_mut(symbol)
                .and_then(|list| list.iter_mut().find(|p| p.id == position_id))
                .ok_or(EngineError::PositionNotFound(position_id))?;

            let mut slice = position.clone();
            slice.size = position.size * ratio;
            slice.margin = position.margin * ratio;
            slice.entry_fee = position.entry_fee * ratio;

            position.size -= slice.size;
            position.margin -= slice.margin;
            position.entry_fee -= slice.entry_fee;
            slice
        };

        Ok(self.settle(&slice, exit_price, timestamp, reason))
    }

    /// Close every open position of a symbol at one price
    pub fn close_all(
        &mut self,
        symbol: &str,
        price: Decimal,
        timestamp: DateTime<Utc>,
        reason: CloseReason,
    ) -> Vec<CloseRecord> {
        let positions = self.positions.remove(symbol).unwrap_or_default();
        positions
            .into_iter()
            .map(|position| {
                let net_pnl = self.settle(&position, price, timestamp, reason);
                CloseRecord {
                    position_id: position.id,
                    reason,
                    price,
                    size: position.size,
                    net_pnl,
                }
            })
            .collect()
    }

    /// Stages 1-3 of the per-bar evaluation: liquidation, TP/SL, explicit exit
    pub fn process_closing(&mut self, symbol: &str, bar: &Bar, signal: &Signal) -> ClosingReport {
        let mut report = ClosingReport::default();
        let timestamp = bar.timestamp;

        // 1. Liquidation at the worst intrabar mark
        for position in self.positions(symbol).to_vec() {
            let mark = match position.direction {
                Direction::Long => bar.low,
                Direction::Short => bar.high,
            };
            let unrealized = position.unrealized_pnl(mark);
            let maintenance = position.notional(mark) * self.config.maintenance_margin_rate;

            if position.margin + unrealized < maintenance {
                tracing::warn!(
                    symbol = %symbol,
                    position_id = %position.id,
                    mark = %mark,
                    equity = %(position.margin + unrealized),
                    maintenance = %maintenance,
                    "Liquidating position"
                );
                if let Ok(net_pnl) = self.close_position(
                    symbol,
                    position.id,
                    mark,
                    timestamp,
                    CloseReason::Liquidation,
                ) {
                    report.liquidations.push(LiquidationEvent {
                        position_id: position.id,
                        direction: position.direction,
                        mark,
                        margin: position.margin,
                        unrealized_pnl: unrealized,
                        maintenance_requirement: maintenance,
                        net_pnl,
                    });
                    report.closes.push(CloseRecord {
                        position_id: position.id,
                        reason: CloseReason::Liquidation,
                        price: mark,
                        size: position.size,
                        net_pnl,
                    });
                }
            }
        }

        // 2. Take profit / stop loss, at the trigger price
        for position in self.positions(symbol).to_vec() {
            let Some((reason, price)) = Self::triggered_exit(&position, bar) else {
                continue;
            };
            if let Ok(net_pnl) = self.close_position(symbol, position.id, price, timestamp, reason)
            {
                report.closes.push(CloseRecord {
                    position_id: position.id,
                    reason,
                    price,
                    size: position.size,
                    net_pnl,
                });
            }
        }

        // 3. Explicit exit at the bar close
        for position in self.positions(symbol).to_vec() {
            if !signal.exit.matches(position.direction) {
                continue;
            }
            let size = if signal.exit_ratio < Decimal::ONE {
                position.size * signal.exit_ratio
            } else {
                position.size
            };
            match self.close_partial(
                symbol,
                position.id,
                signal.exit_ratio,
                bar.close,
                timestamp,
                CloseReason::ExitSignal,
            ) {
                Ok(net_pnl) => report.closes.push(CloseRecord {
                    position_id: position.id,
                    reason: CloseReason::ExitSignal,
                    price: bar.close,
                    size,
                    net_pnl,
                }),
                Err(e) => tracing::warn!(symbol = %symbol, "Exit signal close failed: {}", e),
            }
        }

        report
    }

    /// Stage 4 of the per-bar evaluation: open at the bar close
    pub fn process_opening(&mut self, symbol: &str, bar: &Bar, signal: &Signal) -> OpenOutcome {
        let Some(direction) = signal.direction else {
            return OpenOutcome::NoSignal;
        };

        if !self.config.allow_multiple_positions && self.has_open_position(symbol) {
            tracing::info!(
                symbol = %symbol,
                timestamp = %bar.timestamp,
                "Position already open, skipping new {} entry",
                direction
            );
            return OpenOutcome::AlreadyPositioned;
        }

        let size = self.resolve_open_size(bar.close, signal.size);
        if size <= Decimal::ZERO {
            return OpenOutcome::ZeroSize;
        }

        match self.open_position(
            symbol,
            direction,
            bar.close,
            signal.take_profit,
            signal.stop_loss,
            size,
            bar.timestamp,
        ) {
            Ok(position_id) => OpenOutcome::Opened { position_id, size },
            Err(e) => OpenOutcome::Rejected {
                reason: e.to_string(),
            },
        }
    }

    /// Full per-bar evaluation with a single signal for every stage
    pub fn process_bar(
        &mut self,
        symbol: &str,
        bar: &Bar,
        signal: &Signal,
    ) -> (ClosingReport, OpenOutcome) {
        let closing = self.process_closing(symbol, bar, signal);
        let opening = self.process_opening(symbol, bar, signal);
        (closing, opening)
    }

    /// Size an opening according to the configured sizing policy
    pub fn resolve_open_size(&self, price: Decimal, requested: Decimal) -> Decimal {
        self.config.sizer().resolve(price, self.balance, requested)
    }

    /// Equity of the account at a single mark price
    pub fn calculate_total_balance_and_roi(&self, mark_price: Decimal) -> AccountSummary {
        let open_value: Decimal = self
            .open_positions()
            .map(|p| match self.config.valuation {
                ValuationMode::MarkToMarket => p.margin + p.unrealized_pnl(mark_price),
                ValuationMode::LegacyNotional => p.size * mark_price / self.config.leverage,
            })
            .sum();
        let total_balance = self.balance + open_value;

        let initial = self.config.initial_balance;
        let roi_pct = if initial.is_zero() {
            Decimal::ZERO
        } else {
            (total_balance - initial) / initial * Decimal::ONE_HUNDRED
        };

        AccountSummary {
            total_balance,
            roi_pct,
            total_trades: self.trade_log.len(),
        }
    }

    fn triggered_exit(position: &Position, bar: &Bar) -> Option<(CloseReason, Decimal)> {
        match position.direction {
            Direction::Long => {
                if let Some(tp) = position.take_profit.filter(|tp| bar.high >= *tp) {
                    return Some((CloseReason::TakeProfit, tp));
                }
                position
                    .stop_loss
                    .filter(|sl| bar.low <= *sl)
                    .map(|sl| (CloseReason::StopLoss, sl))
            }
            Direction::Short => {
                if let Some(tp) = position.take_profit.filter(|tp| bar.low <= *tp) {
                    return Some((CloseReason::TakeProfit, tp));
                }
                position
                    .stop_loss
                    .filter(|sl| bar.high >= *sl)
                    .map(|sl| (CloseReason::StopLoss, sl))
            }
        }
    }

    fn take_position(&mut self, symbol: &str, position_id: Uuid) -> Result<Position> {
        let list = self
            .positions
            .get_mut(symbol)
            .ok_or(EngineError::PositionNotFound(position_id))?;
        let index = list
            .iter()
            .position(|p| p.id == position_id)
            .ok_or(EngineError::PositionNotFound(position_id))?;
        let position = list.remove(index);
        if list.is_empty() {
            self.positions.remove(symbol);
        }
        Ok(position)
    }

    /// Credit margin + P&L − close fee for a position already detached from the book
    fn settle(
        &mut self,
        position: &Position,
        exit_price: Decimal,
        timestamp: DateTime<Utc>,
        reason: CloseReason,
    ) -> Decimal {
        let gross = position.unrealized_pnl(exit_price);
        let fee = self.config.fees.close_fee(exit_price, position.size);
        let net_pnl = gross - fee;

        let before = self.balance;
        self.balance += position.margin + net_pnl;

        self.trade_log.push(TradeLogEntry {
            timestamp,
            symbol: position.symbol.clone(),
            position_id: position.id,
            action: TradeAction::Close,
            direction: position.direction,
            price: exit_price,
            size: position.size,
            fee,
            margin: position.margin,
            pnl: Some(net_pnl),
            entry_price: Some(position.entry_price),
            reason: Some(reason),
        });

        tracing::info!(
            symbol = %position.symbol,
            direction = %position.direction,
            size = %position.size,
            entry = %position.entry_price,
            exit = %exit_price,
            net_pnl = %net_pnl,
            reason = ?reason,
            balance_before = %before,
            balance_after = %self.balance,
            "Closed position"
        );

        net_pnl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dec(mantissa: i64, scale: u32) -> Decimal {
        Decimal::new(mantissa, scale)
    }

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, minute, 0).unwrap()
    }

    fn bar(open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Bar {
        Bar {
            timestamp: ts(5),
            open,
            high,
            low,
            close,
            volume: Decimal::from(1000),
        }
    }

    fn scenario_config() -> LedgerConfig {
        LedgerConfig {
            initial_balance: Decimal::from(10_000),
            leverage: Decimal::from(10),
            fees: FeeModel::flat(dec(5, 4)),
            ..Default::default()
        }
    }

    #[test]
    fn test_open_and_close_scenario() {
        let mut ledger = PositionLedger::new(scenario_config());

        let id = ledger
            .open_position(
                "DOGE",
                Direction::Long,
                dec(100, 2),
                None,
                None,
                Decimal::from(1000),
                ts(0),
            )
            .unwrap();

        let position = ledger.position("DOGE", id).unwrap();
        assert_eq!(position.margin, dec(10000, 2));
        assert_eq!(position.entry_fee, dec(50, 2));
        assert_eq!(ledger.balance(), dec(989950, 2));

        let net = ledger
            .close_position("DOGE", id, dec(102, 2), ts(5), CloseReason::Manual)
            .unwrap();

        assert_eq!(net, dec(1949, 2)); // 20.00 - 0.51
        assert_eq!(ledger.balance(), dec(1001899, 2));
        assert!(!ledger.has_open_position("DOGE"));
        assert_eq!(ledger.trade_log().len(), 2);
        assert_eq!(ledger.trade_log()[1].fee, dec(51, 2));
    }

    #[test]
    fn test_insufficient_margin_leaves_state_untouched() {
        let mut ledger = PositionLedger::new(LedgerConfig {
            initial_balance: Decimal::from(100),
            ..scenario_config()
        });

        // margin 100 + fee 0.5 > 100
        let result = ledger.open_position(
            "DOGE",
            Direction::Long,
            Decimal::ONE,
            None,
            None,
            Decimal::from(1000),
            ts(0),
        );

        assert!(matches!(result, Err(EngineError::InsufficientMargin { .. })));
        assert_eq!(ledger.balance(), Decimal::from(100));
        assert_eq!(ledger.open_position_count(), 0);
        assert!(ledger.trade_log().is_empty());
    }

    #[test]
    fn test_no_drift_over_repeated_cycles() {
        let mut ledger = PositionLedger::new(LedgerConfig {
            leverage: Decimal::from(5),
            fees: FeeModel::split(dec(2, 4), dec(7, 4)),
            ..scenario_config()
        });

        let mut expected = ledger.balance();
        for i in 0..50 {
            let entry = dec(1000 + i * 7, 3);
            let exit = dec(1000 + i * 11, 3);
            let size = Decimal::from(333);
            let direction = if i % 2 == 0 {
                Direction::Long
            } else {
                Direction::Short
            };

            let id = ledger
                .open_position("DOGE", direction, entry, None, None, size, ts(0))
                .unwrap();
            let open_fee = ledger.position("DOGE", id).unwrap().entry_fee;
            let net = ledger
                .close_position("DOGE", id, exit, ts(1), CloseReason::Manual)
                .unwrap();

            let gross = direction.sign() * (exit - entry) * size;
            let close_fee = exit * size * dec(7, 4);
            assert_eq!(net, gross - close_fee);

            expected = expected + gross - open_fee - close_fee;
            assert_eq!(ledger.balance(), expected);
        }
    }

    #[test]
    fn test_liquidation_scenario() {
        let mut ledger = PositionLedger::new(scenario_config());
        ledger
            .open_position(
                "DOGE",
                Direction::Long,
                Decimal::ONE,
                None,
                None,
                Decimal::from(1000),
                ts(0),
            )
            .unwrap();

        let report = ledger.process_closing(
            "DOGE",
            &bar(dec(95, 2), dec(96, 2), dec(90, 2), dec(95, 2)),
            &Signal::hold(),
        );

        assert_eq!(report.liquidations.len(), 1);
        let event = &report.liquidations[0];
        assert_eq!(event.mark, dec(90, 2));
        assert_eq!(event.unrealized_pnl, Decimal::from(-100));
        assert_eq!(event.maintenance_requirement, dec(45, 1));
        assert!(!ledger.has_open_position("DOGE"));
        assert_eq!(
            ledger.trade_log().last().unwrap().reason,
            Some(CloseReason::Liquidation)
        );
        assert_eq!(ledger.trade_log().last().unwrap().price, dec(90, 2));
    }

    #[test]
    fn test_liquidation_boundary_equality_is_not_liquidated() {
        // Zero maintenance: equity of exactly 0 at mark 0.90 is not below the requirement
        let mut ledger = PositionLedger::new(LedgerConfig {
            maintenance_margin_rate: Decimal::ZERO,
            ..scenario_config()
        });
        ledger
            .open_position(
                "DOGE",
                Direction::Long,
                Decimal::ONE,
                None,
                None,
                Decimal::from(1000),
                ts(0),
            )
            .unwrap();

        let report = ledger.process_closing(
            "DOGE",
            &bar(dec(95, 2), dec(96, 2), dec(90, 2), dec(95, 2)),
            &Signal::hold(),
        );
        assert!(report.liquidations.is_empty());
        assert!(ledger.has_open_position("DOGE"));

        // One tick lower and equity goes negative
        let report = ledger.process_closing(
            "DOGE",
            &bar(dec(95, 2), dec(96, 2), dec(89, 2), dec(95, 2)),
            &Signal::hold(),
        );
        assert_eq!(report.liquidations.len(), 1);
    }

    #[test]
    fn test_liquidation_boundary_with_maintenance_rate() {
        // Long: margin 100, entry 1, size 1000, mmr 0.005 at mark 0.904:
        // equity = 100 - 96 = 4, requirement = 904 * 0.005 = 4.52 -> liquidated.
        // At mark 0.905: equity 5, requirement 4.525 -> kept.
        let mut ledger = PositionLedger::new(scenario_config());
        ledger
            .open_position(
                "DOGE",
                Direction::Long,
                Decimal::ONE,
                None,
                None,
                Decimal::from(1000),
                ts(0),
            )
            .unwrap();

        let kept = ledger.process_closing(
            "DOGE",
            &bar(dec(95, 2), dec(96, 2), dec(905, 3), dec(95, 2)),
            &Signal::hold(),
        );
        assert!(kept.liquidations.is_empty());

        let liquidated = ledger.process_closing(
            "DOGE",
            &bar(dec(95, 2), dec(96, 2), dec(904, 3), dec(95, 2)),
            &Signal::hold(),
        );
        assert_eq!(liquidated.liquidations.len(), 1);
    }

    #[test]
    fn test_short_liquidation_uses_bar_high() {
        let mut ledger = PositionLedger::new(scenario_config());
        ledger
            .open_position(
                "DOGE",
                Direction::Short,
                Decimal::ONE,
                None,
                None,
                Decimal::from(1000),
                ts(0),
            )
            .unwrap();

        // Low is harmless for a short, high of 1.10 wipes the margin
        let report = ledger.process_closing(
            "DOGE",
            &bar(Decimal::ONE, dec(110, 2), dec(80, 2), Decimal::ONE),
            &Signal::hold(),
        );
        assert_eq!(report.liquidations.len(), 1);
        assert_eq!(report.liquidations[0].mark, dec(110, 2));
    }

    #[test]
    fn test_take_profit_and_stop_loss_fill_at_trigger() {
        let mut ledger = PositionLedger::new(scenario_config());
        let long = ledger
            .open_position(
                "DOGE",
                Direction::Long,
                Decimal::ONE,
                Some(dec(105, 2)),
                Some(dec(97, 2)),
                Decimal::from(100),
                ts(0),
            )
            .unwrap();

        let report = ledger.process_closing(
            "DOGE",
            &bar(Decimal::ONE, dec(106, 2), dec(99, 2), dec(101, 2)),
            &Signal::hold(),
        );
        assert_eq!(report.closes.len(), 1);
        assert_eq!(report.closes[0].position_id, long);
        assert_eq!(report.closes[0].reason, CloseReason::TakeProfit);
        assert_eq!(report.closes[0].price, dec(105, 2));

        ledger
            .open_position(
                "DOGE",
                Direction::Short,
                Decimal::ONE,
                Some(dec(95, 2)),
                Some(dec(103, 2)),
                Decimal::from(100),
                ts(0),
            )
            .unwrap();
        let report = ledger.process_closing(
            "DOGE",
            &bar(Decimal::ONE, dec(104, 2), dec(99, 2), dec(102, 2)),
            &Signal::hold(),
        );
        assert_eq!(report.closes[0].reason, CloseReason::StopLoss);
        assert_eq!(report.closes[0].price, dec(103, 2));
    }

    #[test]
    fn test_partial_exit_keeps_remainder() {
        let mut ledger = PositionLedger::new(scenario_config());
        let id = ledger
            .open_position(
                "DOGE",
                Direction::Long,
                Decimal::ONE,
                None,
                None,
                Decimal::from(1000),
                ts(0),
            )
            .unwrap();
        let balance_after_open = ledger.balance();

        let signal = Signal::exit(Direction::Long).with_exit_ratio(dec(25, 2));
        let report = ledger.process_closing(
            "DOGE",
            &bar(Decimal::ONE, dec(110, 2), dec(99, 2), dec(110, 2)),
            &signal,
        );

        assert_eq!(report.closes.len(), 1);
        assert_eq!(report.closes[0].size, Decimal::from(250));

        let remaining = ledger.position("DOGE", id).unwrap();
        assert_eq!(remaining.size, Decimal::from(750));
        assert_eq!(remaining.margin, Decimal::from(75));
        assert_eq!(remaining.entry_price, Decimal::ONE);

        // 25 margin back + 25 profit - 250 * 1.1 * 0.0005 fee
        let fee = dec(1375, 4);
        assert_eq!(
            ledger.balance(),
            balance_after_open + Decimal::from(25) + Decimal::from(25) - fee
        );
    }

    #[test]
    fn test_exit_signal_ignores_other_direction() {
        let mut ledger = PositionLedger::new(scenario_config());
        ledger
            .open_position(
                "DOGE",
                Direction::Short,
                Decimal::ONE,
                None,
                None,
                Decimal::from(100),
                ts(0),
            )
            .unwrap();

        let report = ledger.process_closing(
            "DOGE",
            &bar(Decimal::ONE, Decimal::ONE, Decimal::ONE, Decimal::ONE),
            &Signal::exit(Direction::Long),
        );
        assert!(report.is_empty());
        assert!(ledger.has_open_position("DOGE"));
    }

    #[test]
    fn test_opening_is_noop_when_already_positioned() {
        let mut ledger = PositionLedger::new(scenario_config());
        let flat = bar(Decimal::ONE, Decimal::ONE, Decimal::ONE, Decimal::ONE);
        let signal = Signal::open(Direction::Long, Decimal::from(100));

        assert!(matches!(
            ledger.process_opening("DOGE", &flat, &signal),
            OpenOutcome::Opened { .. }
        ));

        let balance = ledger.balance();
        let log_len = ledger.trade_log().len();
        let outcome = ledger.process_opening("DOGE", &flat, &Signal::open(Direction::Short, Decimal::ONE));

        assert_eq!(outcome, OpenOutcome::AlreadyPositioned);
        assert_eq!(ledger.balance(), balance);
        assert_eq!(ledger.trade_log().len(), log_len);
        assert_eq!(ledger.open_position_count(), 1);
    }

    #[test]
    fn test_multiple_positions_allowed() {
        let mut ledger = PositionLedger::new(LedgerConfig {
            allow_multiple_positions: true,
            ..scenario_config()
        });
        let flat = bar(Decimal::ONE, Decimal::ONE, Decimal::ONE, Decimal::ONE);
        let signal = Signal::open(Direction::Long, Decimal::from(100));

        ledger.process_opening("DOGE", &flat, &signal);
        ledger.process_opening("DOGE", &flat, &signal);
        assert_eq!(ledger.positions("DOGE").len(), 2);
    }

    #[test]
    fn test_hold_signal_opens_nothing() {
        let mut ledger = PositionLedger::new(scenario_config());
        let flat = bar(Decimal::ONE, Decimal::ONE, Decimal::ONE, Decimal::ONE);
        assert_eq!(
            ledger.process_opening("DOGE", &flat, &Signal::hold()),
            OpenOutcome::NoSignal
        );
    }

    #[test]
    fn test_balance_ratio_sizing() {
        let ledger = PositionLedger::new(LedgerConfig {
            sizing: SizingPolicy::BalanceRatio,
            position_ratio: dec(1, 1),
            min_unit: Decimal::from(10),
            ..scenario_config()
        });

        // 10000 * 0.1 * 10 / 0.3 = 33333.33 -> 33330
        assert_eq!(
            ledger.resolve_open_size(dec(3, 1), Decimal::from(5)),
            Decimal::from(33330)
        );
    }

    #[test]
    fn test_valuation_modes() {
        let mut ledger = PositionLedger::new(scenario_config());
        ledger
            .open_position(
                "DOGE",
                Direction::Long,
                Decimal::ONE,
                None,
                None,
                Decimal::from(1000),
                ts(0),
            )
            .unwrap();

        // 9899.50 + 100 margin + 20 unrealized
        let summary = ledger.calculate_total_balance_and_roi(dec(102, 2));
        assert_eq!(summary.total_balance, dec(1001950, 2));
        assert_eq!(summary.total_trades, 1);
        assert_eq!(summary.roi_pct, dec(195, 3));

        let mut legacy = PositionLedger::new(LedgerConfig {
            valuation: ValuationMode::LegacyNotional,
            ..scenario_config()
        });
        legacy
            .open_position(
                "DOGE",
                Direction::Long,
                Decimal::ONE,
                None,
                None,
                Decimal::from(1000),
                ts(0),
            )
            .unwrap();
        // 9899.50 + 1000 * 1.02 / 10
        assert_eq!(
            legacy.calculate_total_balance_and_roi(dec(102, 2)).total_balance,
            dec(1000150, 2)
        );
    }

    #[test]
    fn test_fee_model_from_config_shapes() {
        let flat: FeeModel = serde_json::from_str(r#"{"fee_rate":"0.001"}"#).unwrap();
        assert_eq!(flat, FeeModel::flat(dec(1, 3)));

        let split: FeeModel =
            serde_json::from_str(r#"{"open_fee_rate":"0.0002","close_fee_rate":"0.0005"}"#)
                .unwrap();
        assert_eq!(split, FeeModel::split(dec(2, 4), dec(5, 4)));
    }
}
