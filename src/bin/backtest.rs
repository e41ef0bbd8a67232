use clap::Parser;
use klinetrader::aggregation::BarValidator;
use klinetrader::backtest::{
    BacktestMetrics, BacktestOptions, BacktestRunner, MarketScenario, SyntheticDataGenerator,
};
use klinetrader::config::AppConfig;
use klinetrader::models::{Bar, TradeLogEntry};
use klinetrader::persistence::JsonLinesLog;
use klinetrader::strategy::MaCrossStrategy;
use std::path::PathBuf;

/// Run the moving-average cross strategy over recorded or synthetic bars
#[derive(Parser, Debug)]
#[command(name = "backtest", version)]
struct Args {
    /// Configuration file (account and market sections are used)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON-lines bar file; all synthetic scenarios are run when omitted
    #[arg(short, long)]
    bars: Option<PathBuf>,

    /// Single synthetic scenario: uptrend, downtrend, sideways or crash
    #[arg(short, long)]
    scenario: Option<MarketScenario>,

    /// Number of synthetic bars
    #[arg(long, default_value_t = 500)]
    num_bars: usize,

    /// Seed for synthetic data
    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, default_value_t = 20)]
    ma_length: usize,

    /// Leave positions open at the end instead of closing them
    #[arg(long)]
    keep_open: bool,

    /// Write the trade log of the (last) run here
    #[arg(long)]
    trade_log: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "klinetrader=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref())?;

    println!("\n╔═══════════════════════════════════════════════════════╗");
    println!("║            KLINETRADER BACKTESTING SUITE              ║");
    println!("╚═══════════════════════════════════════════════════════╝");

    let runner = BacktestRunner::new(config.account.clone(), config.market.symbol.clone())
        .with_options(BacktestOptions {
            close_at_end: !args.keep_open,
            ..BacktestOptions::default()
        });
    let strategy = || MaCrossStrategy::new(args.ma_length, config.account.position_ratio);

    let mut results: Vec<(String, BacktestMetrics)> = Vec::new();

    if let Some(path) = &args.bars {
        let recorded = JsonLinesLog::<Bar>::load_all(path)?;
        let (bars, dropped) = BarValidator::new().filter_valid(recorded);
        if dropped > 0 {
            tracing::warn!(dropped, "Skipped invalid bars from {}", path.display());
        }
        let metrics = runner.run_and_report(strategy(), &bars)?;
        results.push((path.display().to_string(), metrics));
    } else {
        let scenarios = match args.scenario {
            Some(scenario) => vec![scenario],
            None => vec![
                MarketScenario::Uptrend,
                MarketScenario::Downtrend,
                MarketScenario::Sideways,
                MarketScenario::Crash,
            ],
        };

        for scenario in scenarios {
            let bars = SyntheticDataGenerator::new(args.seed).generate(
                scenario,
                args.num_bars,
                config.market.bar_duration(),
            );
            println!("\n▶ Scenario: {:?}", scenario);
            match runner.run_and_report(strategy(), &bars) {
                Ok(metrics) => results.push((format!("{:?}", scenario), metrics)),
                Err(e) => eprintln!("❌ Backtest failed for {:?}: {}", scenario, e),
            }
        }
    }

    if results.len() > 1 {
        print_summary_comparison(&results);
    }

    if let (Some(path), Some((_, metrics))) = (&args.trade_log, results.last()) {
        let log = JsonLinesLog::<TradeLogEntry>::open(path)?;
        let written = log.append_all(&metrics.trades)?;
        println!("Wrote {} trade log entries to {}", written, path.display());
    }

    Ok(())
}

fn print_summary_comparison(results: &[(String, BacktestMetrics)]) {
    println!("\n╔═══════════════════════════════════════════════════════╗");
    println!("║              SCENARIO COMPARISON                      ║");
    println!("╚═══════════════════════════════════════════════════════╝\n");
    println!(
        "  {:<12} {:>10} {:>8} {:>8} {:>10} {:>6}",
        "Scenario", "Return %", "Trades", "Win %", "Max DD %", "Liq"
    );
    for (name, m) in results {
        println!(
            "  {:<12} {:>10.2} {:>8} {:>8.1} {:>10.2} {:>6}",
            name,
            m.total_return_pct,
            m.round_trips,
            m.win_rate,
            m.max_drawdown_pct,
            m.liquidations
        );
    }
    println!();
}
