use clap::Parser;
use klinetrader::api::OkxClient;
use klinetrader::config::AppConfig;
use klinetrader::execution::{KlineBuffer, LiveExecutor, PaperExchange, PositionLedger};
use klinetrader::feed::{preheat, Pipeline, PipelineSettings, RetryPolicy};
use klinetrader::models::{Bar, TradeLogEntry};
use klinetrader::persistence::JsonLinesLog;
use klinetrader::strategy::MaCrossStrategy;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

/// Live kline pipeline on OKX market data with paper execution
#[derive(Parser, Debug)]
#[command(name = "klinetrader", version)]
struct Args {
    /// Configuration file (defaults to ./klinetrader.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Moving-average length of the reference strategy
    #[arg(long, default_value_t = 20)]
    ma_length: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref())?;

    tracing::info!(
        symbol = %config.market.symbol,
        bar_secs = config.market.bar_seconds,
        leverage = %config.account.leverage,
        "🚀 klinetrader starting"
    );

    let client = Arc::new(OkxClient::from_config(&config.exchange)?);
    let buffer = KlineBuffer::new();

    // Previously recorded bars first; preheat only appends newer ones
    let bar_log = match &config.persistence.bar_history_path {
        Some(path) => {
            let recorded = JsonLinesLog::<Bar>::load_all(path)?;
            let restored = buffer.extend_history(recorded);
            tracing::info!(restored, "Restored bar history from {}", path.display());
            Some(JsonLinesLog::<Bar>::open(path)?)
        }
        None => None,
    };

    let report = preheat(
        client.as_ref(),
        &buffer,
        &config.market.symbol,
        config.market.bar_duration(),
        config.market.history_bars,
        RetryPolicy::backfill(&config.supervisor),
    )
    .await?;
    tracing::info!(
        fetched = report.fetched,
        appended = report.appended,
        history = buffer.history_len(),
        "History ready"
    );

    let ledger = Arc::new(Mutex::new(PositionLedger::new(config.account.clone())));
    let mut exchange = PaperExchange::new(ledger.clone());
    if let Some(path) = &config.persistence.trade_log_path {
        exchange = exchange.with_trade_log(JsonLinesLog::<TradeLogEntry>::open(path)?);
        tracing::info!("Recording trades to {}", path.display());
    }

    let strategy = MaCrossStrategy::new(args.ma_length, config.account.position_ratio);
    let executor = LiveExecutor::new(
        strategy,
        exchange,
        config.market.symbol.clone(),
        config.account.leverage,
        config.account.allow_multiple_positions,
        config.market.history_bars,
    )
    .with_sizer(config.account.sizer());

    let pipeline = Pipeline::spawn(
        PipelineSettings::from_config(&config),
        buffer,
        client,
        executor,
        bar_log,
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    if let Some(reason) = pipeline.halt_reason() {
        tracing::warn!("Stopping while trading is halted: {}", reason);
    }

    let mark = pipeline
        .buffer()
        .latest()
        .and_then(|snapshot| snapshot.live_bar.as_ref().map(|bar| bar.close))
        .or_else(|| pipeline.buffer().last_history().map(|bar| bar.close));

    let aborted = pipeline.shutdown().await;
    if !aborted.is_empty() {
        tracing::warn!(?aborted, "Some tasks were aborted");
    }

    let ledger = ledger.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(mark) = mark {
        let summary = ledger.calculate_total_balance_and_roi(mark);
        tracing::info!(
            total_balance = %summary.total_balance,
            roi_pct = %summary.roi_pct.round_dp(2),
            trades = summary.total_trades,
            "Final account"
        );
    } else {
        tracing::info!(
            balance = %ledger.balance(),
            open_positions = ledger.open_position_count(),
            trades = ledger.trade_log().len(),
            "Final account"
        );
    }

    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "klinetrader=info".into()),
        )
        .init();
}
