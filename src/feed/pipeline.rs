use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::supervisor::{supervise_ticks, RetryPolicy};
use super::TickSource;
use crate::aggregation::KlineAggregator;
use crate::config::AppConfig;
use crate::error::{EngineError, Result};
use crate::execution::{BarSnapshot, KlineBuffer, LiveCycleOutcome, LiveExecutor, OrderEndpoint};
use crate::models::{Bar, Tick};
use crate::persistence::JsonLinesLog;
use crate::strategy::SignalSource;

/// Time source for the updater
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockMode {
    /// Wall-clock time; windows close and staleness is judged in real time
    #[default]
    System,
    /// Time follows the newest tick, for replays of recorded data
    LastTick,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub symbol: String,
    pub bar_duration: chrono::Duration,
    pub stale_after: chrono::Duration,
    pub history_bars: usize,
    pub update_interval: Duration,
    pub execution_interval: Duration,
    pub shutdown_timeout: Duration,
    pub tick_channel_capacity: usize,
    pub restart_policy: RetryPolicy,
    pub clock: ClockMode,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            symbol: config.market.symbol.clone(),
            bar_duration: config.market.bar_duration(),
            stale_after: config.market.stale_after(),
            history_bars: config.market.history_bars,
            update_interval: config.pipeline.update_interval(),
            execution_interval: config.pipeline.execution_interval(),
            shutdown_timeout: config.pipeline.shutdown_timeout(),
            tick_channel_capacity: config.pipeline.tick_channel_capacity,
            restart_policy: RetryPolicy::live(&config.supervisor),
            clock: ClockMode::System,
        }
    }

    pub fn with_clock(mut self, clock: ClockMode) -> Self {
        self.clock = clock;
        self
    }
}

/// Running ingestion → aggregation → execution tasks
///
/// The aggregator is owned by the updater task alone; everything else
/// shares state through the [`KlineBuffer`].
pub struct Pipeline {
    buffer: KlineBuffer,
    shutdown_tx: watch::Sender<bool>,
    ack_tx: mpsc::UnboundedSender<()>,
    halt_rx: watch::Receiver<Option<String>>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    shutdown_timeout: Duration,
}

impl Pipeline {
    pub fn spawn<T, S, E>(
        settings: PipelineSettings,
        buffer: KlineBuffer,
        tick_source: Arc<T>,
        executor: LiveExecutor<S, E>,
        bar_log: Option<JsonLinesLog<Bar>>,
    ) -> Self
    where
        T: TickSource + ?Sized + 'static,
        S: SignalSource + 'static,
        E: OrderEndpoint + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tick_tx, tick_rx) = mpsc::channel(settings.tick_channel_capacity);
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (halt_tx, halt_rx) = watch::channel(None);

        tracing::info!(
            symbol = %settings.symbol,
            bar_secs = settings.bar_duration.num_seconds(),
            "Starting pipeline"
        );

        let ingestion = {
            let shutdown = shutdown_rx.clone();
            let symbol = settings.symbol.clone();
            let policy = settings.restart_policy;
            tokio::spawn(async move {
                let restarts = supervise_ticks(tick_source, symbol, tick_tx, shutdown, policy).await;
                tracing::info!(restarts, "Ingestion stopped");
            })
        };

        let aggregator = KlineAggregator::new(
            settings.symbol.clone(),
            settings.bar_duration,
            settings.stale_after,
        );
        let updater = tokio::spawn(run_updater(
            aggregator,
            tick_rx,
            buffer.clone(),
            bar_log,
            settings.update_interval,
            settings.clock,
            shutdown_rx.clone(),
        ));

        let execution = tokio::spawn(run_execution(
            executor,
            buffer.clone(),
            settings.history_bars,
            settings.execution_interval,
            ack_rx,
            halt_tx,
            shutdown_rx,
        ));

        Self {
            buffer,
            shutdown_tx,
            ack_tx,
            halt_rx,
            tasks: vec![
                ("ingestion", ingestion),
                ("updater", updater),
                ("execution", execution),
            ],
            shutdown_timeout: settings.shutdown_timeout,
        }
    }

    pub fn buffer(&self) -> &KlineBuffer {
        &self.buffer
    }

    /// Reason order placement is halted, if it is
    pub fn halt_reason(&self) -> Option<String> {
        self.halt_rx.borrow().clone()
    }

    /// Resume order placement after a halt
    pub fn acknowledge_halt(&self) {
        let _ = self.ack_tx.send(());
    }

    /// Signal every task to stop and wait for them within the timeout
    ///
    /// Returns the names of tasks that had to be aborted.
    pub async fn shutdown(self) -> Vec<&'static str> {
        let _ = self.shutdown_tx.send(true);
        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;

        let mut aborted = Vec::new();
        for (name, mut handle) in self.tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => tracing::debug!(task = name, "Task stopped"),
                Ok(Err(e)) => tracing::error!(task = name, "Task failed: {}", e),
                Err(_) => {
                    tracing::warn!(task = name, "Task did not stop in time, aborting");
                    handle.abort();
                    aborted.push(name);
                }
            }
        }

        tracing::info!("Pipeline stopped");
        aborted
    }
}

async fn run_updater(
    mut aggregator: KlineAggregator,
    mut ticks: mpsc::Receiver<Tick>,
    buffer: KlineBuffer,
    bar_log: Option<JsonLinesLog<Bar>>,
    update_interval: Duration,
    clock: ClockMode,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(update_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut seq: u64 = 0;
    let mut gap_reported = false;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }

        let mut batch = Vec::new();
        while let Ok(tick) = ticks.try_recv() {
            batch.push(tick);
        }

        let mut finalized = aggregator.push_ticks(&batch);
        let now = match clock {
            ClockMode::System => Utc::now(),
            ClockMode::LastTick => match aggregator.last_tick_time() {
                Some(ts) => ts,
                None => continue,
            },
        };
        finalized.extend(aggregator.advance_clock(now));

        for bar in finalized {
            if let Some(log) = &bar_log {
                if let Err(e) = log.append(&bar) {
                    tracing::error!("Failed to persist bar {}: {}", bar.timestamp, e);
                }
            }
            buffer.push_history(bar);
        }

        let stale = match aggregator.check_gap(now) {
            Ok(()) => {
                if gap_reported {
                    tracing::info!(symbol = %aggregator.symbol(), "Ticks resumed");
                }
                gap_reported = false;
                false
            }
            Err(e) => {
                if !gap_reported {
                    tracing::warn!("{}", e);
                }
                gap_reported = true;
                true
            }
        };

        seq += 1;
        publish_update(&mut aggregator, &buffer, seq, stale, now);
    }

    tracing::debug!("Updater stopped");
}

/// Hand traded prices to the consumer, then publish a fresh snapshot
fn publish_update(
    aggregator: &mut KlineAggregator,
    buffer: &KlineBuffer,
    seq: u64,
    stale: bool,
    now: DateTime<Utc>,
) {
    if let Some(sweep) = aggregator.take_sweep() {
        buffer.accumulate_sweep(sweep);
    }
    buffer.write(BarSnapshot {
        second_bar: aggregator.live_second(),
        live_bar: aggregator.live_bar(),
        seq,
        stale,
        updated_at: now,
    });
    buffer.swap();
}

async fn run_execution<S, E>(
    mut executor: LiveExecutor<S, E>,
    buffer: KlineBuffer,
    history_bars: usize,
    execution_interval: Duration,
    mut acks: mpsc::UnboundedReceiver<()>,
    halt_tx: watch::Sender<Option<String>>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: SignalSource,
    E: OrderEndpoint,
{
    let mut interval = tokio::time::interval(execution_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_seq = None;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            Some(()) = acks.recv() => {
                executor.acknowledge_halt();
                let _ = halt_tx.send(None);
                continue;
            }
            _ = shutdown.changed() => break,
        }

        if executor.is_halted() {
            continue;
        }
        let Some(snapshot) = buffer.latest() else {
            continue;
        };
        if last_seq == Some(snapshot.seq) {
            continue;
        }
        last_seq = Some(snapshot.seq);

        match execute_snapshot(&mut executor, &buffer, &snapshot, history_bars).await {
            Ok(outcome) => tracing::debug!(seq = snapshot.seq, outcome = ?outcome, "Cycle"),
            Err(EngineError::TradingHalted(_)) => {}
            Err(e) => {
                tracing::error!("Execution cycle failed: {}", e);
                let _ = halt_tx.send(executor.halt_reason().map(str::to_string));
            }
        }
    }

    tracing::debug!("Execution stopped");
}

/// One live cycle on `snapshot`
///
/// The second bar handed to the endpoint is every price traded since the
/// previous cycle, so no tick escapes the TP/SL and liquidation checks.
/// A stale snapshot leaves the swept range for the next cycle.
async fn execute_snapshot<S, E>(
    executor: &mut LiveExecutor<S, E>,
    buffer: &KlineBuffer,
    snapshot: &BarSnapshot,
    history_bars: usize,
) -> Result<LiveCycleOutcome>
where
    S: SignalSource,
    E: OrderEndpoint,
{
    let mut snapshot = snapshot.clone();
    if !snapshot.stale {
        snapshot.second_bar = buffer.take_sweep();
    }
    let history = buffer.recent_history(history_bars);
    executor.run_cycle(&snapshot, &history).await
}
