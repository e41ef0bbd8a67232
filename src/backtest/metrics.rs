use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::execution::AccountSummary;
use crate::models::{CloseReason, TradeAction, TradeLogEntry};

/// Mark-to-market account value after a bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
}

/// Complete backtest performance metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub symbol: String,
    pub strategy: String,
    pub bars_processed: usize,

    // P&L
    pub initial_balance: Decimal,
    pub final_balance: Decimal,
    pub total_return_pct: Decimal,
    pub realized_pnl: Decimal,

    // Trade statistics
    pub round_trips: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: Decimal,
    pub largest_win: Decimal,
    pub largest_loss: Decimal,

    // Risk
    pub max_drawdown: Decimal,
    pub max_drawdown_pct: Decimal,
    pub liquidations: usize,

    // Costs
    pub total_fees: Decimal,

    pub summary: AccountSummary,
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<TradeLogEntry>,
}

impl BacktestMetrics {
    /// Derive metrics from the ledger's trade log and the per-bar equity curve
    pub fn from_run(
        symbol: &str,
        strategy: &str,
        bars_processed: usize,
        initial_balance: Decimal,
        summary: AccountSummary,
        equity_curve: Vec<EquityPoint>,
        trades: Vec<TradeLogEntry>,
    ) -> Self {
        let closes: Vec<&TradeLogEntry> = trades
            .iter()
            .filter(|t| t.action == TradeAction::Close)
            .collect();
        let pnls: Vec<Decimal> = closes.iter().filter_map(|t| t.pnl).collect();

        let round_trips = closes.len();
        let winning_trades = pnls.iter().filter(|p| **p > Decimal::ZERO).count();
        let losing_trades = round_trips - winning_trades;
        let win_rate = if round_trips > 0 {
            Decimal::from(winning_trades) / Decimal::from(round_trips) * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        };

        let realized_pnl: Decimal = pnls.iter().sum();
        let largest_win = pnls
            .iter()
            .copied()
            .filter(|p| *p > Decimal::ZERO)
            .max()
            .unwrap_or(Decimal::ZERO);
        let largest_loss = pnls
            .iter()
            .copied()
            .filter(|p| *p <= Decimal::ZERO)
            .min()
            .unwrap_or(Decimal::ZERO);

        let liquidations = closes
            .iter()
            .filter(|t| t.reason == Some(CloseReason::Liquidation))
            .count();
        let total_fees = trades.iter().map(|t| t.fee).sum();

        let (max_drawdown, max_drawdown_pct) =
            Self::calculate_drawdown(&equity_curve, initial_balance);

        let final_balance = summary.total_balance;
        let total_return_pct = if initial_balance.is_zero() {
            Decimal::ZERO
        } else {
            (final_balance - initial_balance) / initial_balance * Decimal::ONE_HUNDRED
        };

        Self {
            symbol: symbol.to_string(),
            strategy: strategy.to_string(),
            bars_processed,
            initial_balance,
            final_balance,
            total_return_pct,
            realized_pnl,
            round_trips,
            winning_trades,
            losing_trades,
            win_rate,
            largest_win,
            largest_loss,
            max_drawdown,
            max_drawdown_pct,
            liquidations,
            total_fees,
            summary,
            equity_curve,
            trades,
        }
    }

    /// Largest peak-to-trough fall of the equity curve, starting from the initial balance
    fn calculate_drawdown(curve: &[EquityPoint], initial: Decimal) -> (Decimal, Decimal) {
        let mut peak = initial;
        let mut max_dd = Decimal::ZERO;
        let mut peak_at_max = initial;

        for point in curve {
            if point.equity > peak {
                peak = point.equity;
            }
            let drawdown = peak - point.equity;
            if drawdown > max_dd {
                max_dd = drawdown;
                peak_at_max = peak;
            }
        }

        let max_dd_pct = if peak_at_max > Decimal::ZERO {
            max_dd / peak_at_max * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        };

        (max_dd, max_dd_pct)
    }

    /// Print a formatted report to stdout
    pub fn print_report(&self) {
        println!("\n╔═══════════════════════════════════════════════════════╗");
        println!("║              BACKTEST PERFORMANCE REPORT              ║");
        println!("╚═══════════════════════════════════════════════════════╝\n");

        println!("  Symbol:                {}", self.symbol);
        println!("  Strategy:              {}", self.strategy);
        println!("  Bars Processed:        {}", self.bars_processed);

        println!("\n📊 P&L SUMMARY");
        println!("  Initial Balance:       {:.2}", self.initial_balance);
        println!("  Final Balance:         {:.2}", self.final_balance);
        println!(
            "  Return:                {:+.2}%",
            self.total_return_pct.round_dp(2)
        );
        println!("  Realized P&L (net):    {:.2}", self.realized_pnl);
        println!("  Total Fees:            {:.2}", self.total_fees);

        println!("\n📈 TRADE STATISTICS");
        println!("  Round Trips:           {}", self.round_trips);
        println!(
            "  Winning Trades:        {} ({:.1}%)",
            self.winning_trades, self.win_rate
        );
        println!("  Losing Trades:         {}", self.losing_trades);
        if self.round_trips > 0 {
            println!("  Largest Win:           {:.2}", self.largest_win);
            println!("  Largest Loss:          {:.2}", self.largest_loss);
        }

        println!("\n⚠️  RISK METRICS");
        println!(
            "  Max Drawdown:          {:.2} ({:.2}%)",
            self.max_drawdown, self.max_drawdown_pct
        );
        println!("  Liquidations:          {}", self.liquidations);
        println!();
    }
}
