use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

use crate::error::{EngineError, Result};
use crate::models::{Bar, Tick};

/// Align a timestamp down to a multiple of `interval` since the epoch
pub fn floor_timestamp(timestamp: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let interval_ms = interval.num_milliseconds();
    if interval_ms <= 0 {
        return timestamp;
    }
    let ms = timestamp.timestamp_millis();
    DateTime::from_timestamp_millis(ms - ms.rem_euclid(interval_ms)).unwrap_or(timestamp)
}

/// Aggregate raw ticks directly into bars of `interval`
///
/// Ticks must be in non-decreasing timestamp order. Windows without ticks
/// produce no bar.
pub fn aggregate_ticks(ticks: &[Tick], interval: Duration) -> Vec<Bar> {
    let mut buckets: BTreeMap<DateTime<Utc>, Bar> = BTreeMap::new();

    for tick in ticks {
        let start = floor_timestamp(tick.timestamp, interval);
        buckets
            .entry(start)
            .and_modify(|bar| bar.absorb(&Bar::from_tick(start, tick)))
            .or_insert_with(|| Bar::from_tick(start, tick));
    }

    buckets.into_values().collect()
}

/// Incremental tick → second bar → interval bar aggregation
///
/// Completed second bars are committed into the in-progress window; the
/// second currently receiving ticks is folded in only when the live bar is
/// read. A window is finalized as soon as a tick lands past its boundary or
/// when [`advance_clock`](Self::advance_clock) passes its end.
#[derive(Debug, Clone)]
pub struct KlineAggregator {
    symbol: String,
    bar_duration: Duration,
    stale_after: Duration,
    second: Option<Bar>,
    window: Option<Bar>,
    last_tick: Option<DateTime<Utc>>,
    /// Range of the ticks applied since the last [`take_sweep`](Self::take_sweep)
    sweep: Option<Bar>,
    /// First clock reading, used as the gap start before any tick arrives
    watching_since: Option<DateTime<Utc>>,
    /// Ticks before this instant belong to a window that is already final
    finalized_until: Option<DateTime<Utc>>,
}

impl KlineAggregator {
    pub fn new(symbol: impl Into<String>, bar_duration: Duration, stale_after: Duration) -> Self {
        Self {
            symbol: symbol.into(),
            bar_duration,
            stale_after,
            second: None,
            window: None,
            last_tick: None,
            sweep: None,
            watching_since: None,
            finalized_until: None,
        }
    }

    /// 5-minute bars with a 10 second staleness threshold
    pub fn five_minute(symbol: impl Into<String>) -> Self {
        Self::new(symbol, Duration::minutes(5), Duration::seconds(10))
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn bar_duration(&self) -> Duration {
        self.bar_duration
    }

    pub fn last_tick_time(&self) -> Option<DateTime<Utc>> {
        self.last_tick
    }

    /// Apply one tick, returning any bars it finalized
    ///
    /// A tick earlier than the previous one, or inside an already finalized
    /// window, is rejected without changing state.
    pub fn push_tick(&mut self, tick: &Tick) -> Result<Vec<Bar>> {
        if let Some(last) = self.last_tick {
            if tick.timestamp < last {
                return Err(EngineError::OutOfOrderTick {
                    symbol: self.symbol.clone(),
                    tick: tick.timestamp,
                    last,
                });
            }
        }
        if let Some(boundary) = self.finalized_until {
            if tick.timestamp < boundary {
                return Err(EngineError::OutOfOrderTick {
                    symbol: self.symbol.clone(),
                    tick: tick.timestamp,
                    last: boundary,
                });
            }
        }

        self.last_tick = Some(tick.timestamp);
        let second_start = floor_timestamp(tick.timestamp, Duration::seconds(1));
        let traded = Bar::from_tick(second_start, tick);
        match self.sweep.as_mut() {
            Some(sweep) => sweep.absorb(&traded),
            None => self.sweep = Some(traded),
        }

        let mut finalized = Vec::new();
        let same_second = self
            .second
            .as_ref()
            .is_some_and(|s| s.timestamp == second_start);

        if same_second {
            if let Some(second) = self.second.as_mut() {
                second.absorb(&Bar::from_tick(second_start, tick));
            }
        } else {
            if let Some(completed) = self.second.take() {
                finalized.extend(self.commit_second(completed));
            }
            let window_start = floor_timestamp(second_start, self.bar_duration);
            if self
                .window
                .as_ref()
                .is_some_and(|w| w.timestamp != window_start)
            {
                finalized.extend(self.finalize_window());
            }
            self.second = Some(Bar::from_tick(second_start, tick));
        }

        Ok(finalized)
    }

    /// Apply a batch of ticks, logging and skipping rejected ones
    pub fn push_ticks(&mut self, ticks: &[Tick]) -> Vec<Bar> {
        let mut finalized = Vec::new();
        for tick in ticks {
            match self.push_tick(tick) {
                Ok(bars) => finalized.extend(bars),
                Err(e) => tracing::warn!("Dropping tick: {}", e),
            }
        }
        finalized
    }

    /// Close out the current second and window once wall-clock time passes them
    pub fn advance_clock(&mut self, now: DateTime<Utc>) -> Vec<Bar> {
        self.watching_since.get_or_insert(now);
        let mut finalized = Vec::new();

        let second_done = self
            .second
            .as_ref()
            .is_some_and(|s| now >= s.timestamp + Duration::seconds(1));
        if second_done {
            if let Some(completed) = self.second.take() {
                finalized.extend(self.commit_second(completed));
            }
        }

        let window_done = self
            .window
            .as_ref()
            .is_some_and(|w| now >= w.timestamp + self.bar_duration);
        if window_done {
            if let Some(bar) = self.finalize_window() {
                finalized.push(bar);
            }
        }

        finalized
    }

    /// In-progress interval bar including the current second
    pub fn live_bar(&self) -> Option<Bar> {
        match (&self.window, &self.second) {
            (Some(window), Some(second))
                if floor_timestamp(second.timestamp, self.bar_duration) == window.timestamp =>
            {
                let mut live = window.clone();
                live.absorb(second);
                Some(live)
            }
            (Some(window), _) => Some(window.clone()),
            (None, Some(second)) => {
                let mut live = second.clone();
                live.timestamp = floor_timestamp(second.timestamp, self.bar_duration);
                Some(live)
            }
            (None, None) => None,
        }
    }

    /// Second bar currently receiving ticks
    pub fn live_second(&self) -> Option<Bar> {
        self.second.clone()
    }

    /// Every price traded since the previous call, as one bar
    ///
    /// Unlike [`live_second`](Self::live_second) this includes ticks that
    /// landed in a second after it was last read.
    pub fn take_sweep(&mut self) -> Option<Bar> {
        self.sweep.take()
    }

    /// True when no tick arrived within the staleness threshold
    ///
    /// A stream that has not delivered any tick yet is stale.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.check_gap(now).is_err()
    }

    /// Surface a data gap instead of extrapolating prices
    pub fn check_gap(&self, now: DateTime<Utc>) -> Result<()> {
        let since = match self.last_tick {
            Some(last) if now - last <= self.stale_after => return Ok(()),
            Some(last) => last,
            None => self.watching_since.unwrap_or(now),
        };
        Err(EngineError::DataGap {
            symbol: self.symbol.clone(),
            since,
        })
    }

    fn commit_second(&mut self, second: Bar) -> Option<Bar> {
        let window_start = floor_timestamp(second.timestamp, self.bar_duration);

        let finalized = match &self.window {
            Some(window) if window.timestamp != window_start => self.finalize_window(),
            _ => None,
        };

        match self.window.as_mut() {
            Some(window) => window.absorb(&second),
            None => {
                let mut seeded = second;
                seeded.timestamp = window_start;
                self.window = Some(seeded);
            }
        }

        finalized
    }

    fn finalize_window(&mut self) -> Option<Bar> {
        let bar = self.window.take()?;
        self.finalized_until = Some(bar.timestamp + self.bar_duration);

        tracing::info!(
            symbol = %self.symbol,
            timestamp = %bar.timestamp,
            open = %bar.open,
            high = %bar.high,
            low = %bar.low,
            close = %bar.close,
            volume = %bar.volume,
            "Finalized bar"
        );

        Some(bar)
    }
}
