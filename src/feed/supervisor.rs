use chrono::Duration as BarDuration;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use super::{MarketDataSource, TickSource};
use crate::aggregation::BarValidator;
use crate::config::SupervisorConfig;
use crate::error::{EngineError, Result};
use crate::execution::{BarSnapshot, KlineBuffer};
use crate::models::{Bar, Tick};

/// How a failed operation is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Retry forever with a fixed delay (live feeds)
    Unbounded { delay: Duration },
    /// At most `max_attempts` attempts with doubling backoff (backfill)
    Bounded {
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
    },
}

impl RetryPolicy {
    pub fn live(config: &SupervisorConfig) -> Self {
        RetryPolicy::Unbounded {
            delay: Duration::from_millis(config.live_restart_delay_ms),
        }
    }

    pub fn backfill(config: &SupervisorConfig) -> Self {
        RetryPolicy::Bounded {
            max_attempts: config.backfill_max_retries.max(1),
            initial_backoff: Duration::from_millis(config.backfill_initial_backoff_ms),
            max_backoff: Duration::from_millis(config.backfill_max_backoff_ms),
        }
    }

    /// Delay before the next attempt after `failures` consecutive failures,
    /// or `None` when no attempts remain
    pub fn delay_after(&self, failures: u32) -> Option<Duration> {
        match *self {
            RetryPolicy::Unbounded { delay } => Some(delay),
            RetryPolicy::Bounded {
                max_attempts,
                initial_backoff,
                max_backoff,
            } => {
                if failures >= max_attempts {
                    return None;
                }
                let factor = 2_u32.saturating_pow(failures.saturating_sub(1));
                Some(initial_backoff.saturating_mul(factor).min(max_backoff))
            }
        }
    }
}

/// Keep a tick subscription alive, reconnecting according to `policy`
///
/// Returns the number of reconnects once shutdown is signalled, the sink is
/// closed, or the policy gives up.
pub async fn supervise_ticks<T: TickSource + ?Sized>(
    source: Arc<T>,
    instrument: String,
    sink: mpsc::Sender<Tick>,
    mut shutdown: watch::Receiver<bool>,
    policy: RetryPolicy,
) -> u32 {
    let mut failures = 0;
    let mut restarts = 0;

    loop {
        if *shutdown.borrow() || sink.is_closed() {
            break;
        }

        match source
            .subscribe_ticks(&instrument, sink.clone(), shutdown.clone())
            .await
        {
            Ok(()) => {
                if *shutdown.borrow() || sink.is_closed() {
                    break;
                }
                tracing::warn!(instrument = %instrument, "Tick stream ended, reconnecting");
                failures = 1;
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(
                    instrument = %instrument,
                    failures,
                    "Tick feed failed: {}",
                    e
                );
            }
        }

        let Some(delay) = policy.delay_after(failures) else {
            tracing::error!(
                instrument = %instrument,
                "Tick feed gave up after {} failures",
                failures
            );
            break;
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
        restarts += 1;
        tracing::info!(instrument = %instrument, restarts, "Restarting tick feed");
    }

    restarts
}

/// Fetch historical bars with bounded exponential backoff
pub async fn fetch_with_retry<M: MarketDataSource + ?Sized>(
    source: &M,
    instrument: &str,
    bar_size: BarDuration,
    lookback: usize,
    policy: RetryPolicy,
) -> Result<Vec<Bar>> {
    let mut failures = 0;

    loop {
        match source.fetch_bars(instrument, bar_size, lookback).await {
            Ok(bars) => {
                if failures > 0 {
                    tracing::info!(
                        instrument = %instrument,
                        "Fetched history after {} attempts",
                        failures + 1
                    );
                }
                return Ok(bars);
            }
            Err(e) => {
                failures += 1;
                match policy.delay_after(failures) {
                    Some(delay) => {
                        tracing::warn!(
                            instrument = %instrument,
                            "History fetch failed (attempt {}): {}. Retrying in {:?}",
                            failures,
                            e,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        tracing::error!(
                            instrument = %instrument,
                            "History fetch failed after {} attempts: {}",
                            failures,
                            e
                        );
                        return Err(EngineError::BackfillExhausted {
                            symbol: instrument.to_string(),
                            attempts: failures,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreheatReport {
    pub fetched: usize,
    pub dropped: usize,
    pub appended: usize,
}

/// Seed the buffer's history with recent finalized bars
///
/// Bars are validated, deduplicated by timestamp (last wins) and sorted
/// before being appended. The newest bar is also published as the initial
/// snapshot, flagged stale until the first live tick arrives.
pub async fn preheat<M: MarketDataSource + ?Sized>(
    source: &M,
    buffer: &KlineBuffer,
    symbol: &str,
    bar_size: BarDuration,
    lookback: usize,
    policy: RetryPolicy,
) -> Result<PreheatReport> {
    let fetched = fetch_with_retry(source, symbol, bar_size, lookback, policy).await?;
    let fetched_count = fetched.len();

    let (valid, dropped) = BarValidator::new().filter_valid(fetched);

    let deduped: BTreeMap<_, _> = valid.into_iter().map(|bar| (bar.timestamp, bar)).collect();
    let bars: Vec<Bar> = deduped.into_values().collect();
    let latest = bars.last().cloned();

    let appended = buffer.extend_history(bars);

    if let Some(bar) = latest {
        buffer.publish(BarSnapshot {
            second_bar: None,
            updated_at: bar.timestamp,
            live_bar: Some(bar),
            seq: 0,
            stale: true,
        });
    }

    tracing::info!(
        symbol = %symbol,
        fetched = fetched_count,
        dropped,
        appended,
        "Preheated bar history"
    );

    Ok(PreheatReport {
        fetched: fetched_count,
        dropped,
        appended,
    })
}
