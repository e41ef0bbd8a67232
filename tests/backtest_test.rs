use chrono::Duration;
use klinetrader::backtest::{BacktestMetrics, BacktestRunner, MarketScenario, SyntheticDataGenerator};
use klinetrader::execution::{FeeModel, LedgerConfig, SizingPolicy};
use klinetrader::models::{CloseReason, Direction, ExitSignal, Signal, TradeAction};
use klinetrader::strategy::{CyclePhase, FnSignalSource, MaCrossStrategy, SignalContext};
use rust_decimal::Decimal;

fn init_logging() {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();
}

/// Balance only moves through fees and realized P&L, with no drift
fn assert_balance_reconciles(config: &LedgerConfig, metrics: &BacktestMetrics) {
    let open_fees: Decimal = metrics
        .trades
        .iter()
        .filter(|t| t.action == TradeAction::Open)
        .map(|t| t.fee)
        .sum();
    let realized: Decimal = metrics.trades.iter().filter_map(|t| t.pnl).sum();

    assert_eq!(
        metrics.final_balance,
        config.initial_balance - open_fees + realized
    );
}

#[test]
fn test_ma_cross_over_every_scenario_reconciles() {
    init_logging();
    // Sizes rounded to whole units keep every amount exact
    let config = LedgerConfig {
        sizing: SizingPolicy::BalanceRatio,
        ..LedgerConfig::default()
    };
    let runner = BacktestRunner::new(config.clone(), "DOGE-USDT-SWAP");

    for scenario in [
        MarketScenario::Uptrend,
        MarketScenario::Downtrend,
        MarketScenario::Sideways,
        MarketScenario::Crash,
    ] {
        let bars = SyntheticDataGenerator::new(42).generate(scenario, 500, Duration::minutes(5));
        let metrics = runner.run(MaCrossStrategy::default(), &bars).unwrap();

        assert_eq!(metrics.trades.len() % 2, 0, "{:?} left a position open", scenario);
        assert_eq!(metrics.round_trips * 2, metrics.trades.len());
        assert_eq!(
            metrics.winning_trades + metrics.losing_trades,
            metrics.round_trips
        );
        assert_balance_reconciles(&config, &metrics);
    }
}

#[test]
fn test_high_leverage_long_is_liquidated_in_crash() {
    init_logging();
    let config = LedgerConfig {
        leverage: Decimal::from(50),
        sizing: SizingPolicy::BalanceRatio,
        position_ratio: Decimal::new(5, 1),
        min_unit: Decimal::ONE,
        fees: FeeModel::split(Decimal::new(2, 4), Decimal::new(5, 4)),
        ..LedgerConfig::default()
    };
    // Requested size is ignored under balance-ratio sizing
    let always_long = FnSignalSource::new("always long", 0, |ctx: &SignalContext<'_>| {
        if ctx.phase == CyclePhase::Reopen && ctx.current_direction.is_none() {
            Signal::open(Direction::Long, Decimal::ONE)
        } else {
            Signal::hold()
        }
    });

    let bars = SyntheticDataGenerator::new(9).generate(MarketScenario::Crash, 400, Duration::minutes(5));
    let metrics = BacktestRunner::new(config.clone(), "DOGE-USDT-SWAP")
        .run(always_long, &bars)
        .unwrap();

    assert!(metrics.liquidations >= 1);
    assert!(metrics
        .trades
        .iter()
        .any(|t| t.reason == Some(CloseReason::Liquidation)));
    assert!(metrics.final_balance < config.initial_balance);
    assert_balance_reconciles(&config, &metrics);
}

#[test]
fn test_short_with_take_profit_in_downtrend() {
    init_logging();
    let config = LedgerConfig::default();
    let short_with_tp = FnSignalSource::new("short tp", 1, |ctx: &SignalContext<'_>| {
        let Some(bar) = ctx.current_bar() else {
            return Signal::hold();
        };
        if ctx.phase == CyclePhase::Reopen && ctx.current_direction.is_none() {
            Signal::open(Direction::Short, Decimal::from(1000))
                .with_take_profit(bar.close * Decimal::new(99, 2))
                .with_exit(ExitSignal::Close(Direction::Long))
        } else {
            Signal::hold()
        }
    });

    let bars =
        SyntheticDataGenerator::new(5).generate(MarketScenario::Downtrend, 300, Duration::minutes(5));
    let metrics = BacktestRunner::new(config.clone(), "DOGE-USDT-SWAP")
        .run(short_with_tp, &bars)
        .unwrap();

    let take_profits = metrics
        .trades
        .iter()
        .filter(|t| t.reason == Some(CloseReason::TakeProfit))
        .count();
    assert!(take_profits > 10);
    assert!(metrics.final_balance > config.initial_balance);
    assert_eq!(metrics.liquidations, 0);
    assert_balance_reconciles(&config, &metrics);
}
