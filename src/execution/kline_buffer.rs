use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::models::Bar;

/// One consistent view of the live market state
#[derive(Debug, Clone, PartialEq)]
pub struct BarSnapshot {
    /// Second bar still receiving ticks when published; the execution task
    /// swaps in the range swept since its previous cycle
    pub second_bar: Option<Bar>,
    pub live_bar: Option<Bar>,
    /// Monotonic write counter assigned by the producer
    pub seq: u64,
    /// Set when no ticks arrived within the staleness threshold
    pub stale: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Slots {
    main: Mutex<Option<Arc<BarSnapshot>>>,
    mirror: RwLock<Option<Arc<BarSnapshot>>>,
    history: RwLock<Vec<Bar>>,
    sweep: Mutex<Option<Bar>>,
}

/// Double-buffered live bar plus append-only finalized history
///
/// The producer writes whole snapshots into `main` and publishes them with
/// [`swap`](Self::swap); consumers only ever read `mirror`. Snapshots are
/// immutable `Arc`s, so a reader gets either the previous or the current
/// write and never a mix. History sits behind its own lock.
#[derive(Debug, Clone, Default)]
pub struct KlineBuffer {
    slots: Arc<Slots>,
}

impl KlineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pending snapshot in `main`
    pub fn write(&self, snapshot: BarSnapshot) {
        let mut main = self.slots.main.lock().unwrap_or_else(PoisonError::into_inner);
        *main = Some(Arc::new(snapshot));
    }

    /// Publish the latest `main` snapshot to readers
    pub fn swap(&self) {
        let pending = self
            .slots
            .main
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if let Some(snapshot) = pending {
            let mut mirror = self
                .slots
                .mirror
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *mirror = Some(snapshot);
        }
    }

    /// Write then swap
    pub fn publish(&self, snapshot: BarSnapshot) {
        self.write(snapshot);
        self.swap();
    }

    /// Merge traded prices into the range awaiting the consumer
    pub fn accumulate_sweep(&self, bar: Bar) {
        let mut sweep = self.slots.sweep.lock().unwrap_or_else(PoisonError::into_inner);
        match sweep.as_mut() {
            Some(pending) => pending.absorb(&bar),
            None => *sweep = Some(bar),
        }
    }

    /// Take every traded price accumulated since the previous take
    pub fn take_sweep(&self) -> Option<Bar> {
        self.slots
            .sweep
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Most recently swapped snapshot
    pub fn latest(&self) -> Option<Arc<BarSnapshot>> {
        self.slots
            .mirror
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Append a finalized bar
    ///
    /// Bars not strictly later than the last history entry are ignored and
    /// `false` is returned.
    pub fn push_history(&self, bar: Bar) -> bool {
        let mut history = self
            .slots
            .history
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(last) = history.last() {
            if bar.timestamp <= last.timestamp {
                tracing::debug!(
                    timestamp = %bar.timestamp,
                    last = %last.timestamp,
                    "Ignoring bar that does not extend history"
                );
                return false;
            }
        }
        history.push(bar);
        true
    }

    /// Append bars in order, returning how many were accepted
    pub fn extend_history(&self, bars: impl IntoIterator<Item = Bar>) -> usize {
        bars.into_iter()
            .map(|bar| self.push_history(bar))
            .filter(|accepted| *accepted)
            .count()
    }

    pub fn history(&self) -> Vec<Bar> {
        self.slots
            .history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The `n` most recent finalized bars, oldest first
    pub fn recent_history(&self, n: usize) -> Vec<Bar> {
        let history = self
            .slots
            .history
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let start = history.len().saturating_sub(n);
        history[start..].to_vec()
    }

    pub fn last_history(&self) -> Option<Bar> {
        self.slots
            .history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    pub fn history_len(&self) -> usize {
        self.slots
            .history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
