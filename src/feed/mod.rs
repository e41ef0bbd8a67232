// Market data interfaces, supervision and the live pipeline
pub mod pipeline;
pub mod supervisor;

pub use pipeline::{ClockMode, Pipeline, PipelineSettings};
pub use supervisor::{fetch_with_retry, preheat, supervise_ticks, PreheatReport, RetryPolicy};

use async_trait::async_trait;
use chrono::Duration;
use tokio::sync::{mpsc, watch};

use crate::models::{Bar, Tick};
use crate::Result;

/// Historical bar provider
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Most recent `lookback` finalized bars, oldest first
    async fn fetch_bars(&self, instrument: &str, bar_size: Duration, lookback: usize)
        -> Result<Vec<Bar>>;
}

/// Live trade feed
#[async_trait]
pub trait TickSource: Send + Sync {
    /// Push ticks into `sink` in timestamp order until shutdown or failure
    ///
    /// Returning `Ok` means the stream ended cleanly; an error means the
    /// connection was lost and the caller may reconnect.
    async fn subscribe_ticks(
        &self,
        instrument: &str,
        sink: mpsc::Sender<Tick>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()>;
}

/// In-memory feed that replays fixed ticks and bars
#[derive(Debug, Clone, Default)]
pub struct ReplayFeed {
    ticks: Vec<Tick>,
    bars: Vec<Bar>,
    pace: Option<std::time::Duration>,
}

impl ReplayFeed {
    pub fn new(ticks: Vec<Tick>, bars: Vec<Bar>) -> Self {
        Self {
            ticks,
            bars,
            pace: None,
        }
    }

    /// Sleep this long between ticks
    pub fn with_pace(mut self, pace: std::time::Duration) -> Self {
        self.pace = Some(pace);
        self
    }
}

#[async_trait]
impl MarketDataSource for ReplayFeed {
    async fn fetch_bars(
        &self,
        _instrument: &str,
        _bar_size: Duration,
        lookback: usize,
    ) -> Result<Vec<Bar>> {
        let start = self.bars.len().saturating_sub(lookback);
        Ok(self.bars[start..].to_vec())
    }
}

#[async_trait]
impl TickSource for ReplayFeed {
    async fn subscribe_ticks(
        &self,
        _instrument: &str,
        sink: mpsc::Sender<Tick>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        for tick in &self.ticks {
            if *shutdown.borrow() {
                break;
            }
            if sink.send(tick.clone()).await.is_err() {
                break;
            }
            if let Some(pace) = self.pace {
                tokio::time::sleep(pace).await;
            }
        }

        // Exhausted: stay connected until shutdown so the supervisor does not replay
        let mut shutdown = shutdown;
        let _ = shutdown.wait_for(|stop| *stop).await;
        Ok(())
    }
}
