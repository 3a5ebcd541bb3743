//! Per-bar export ledger
//!
//! Tracks every bar index the pipeline has touched:
//!
//! ```text
//! Pending → Processing → Exported          (terminal, index enters the exported set)
//!                      → Skipped(reason)   (retryable, e.g. by the shutdown backtrack)
//! ```
//!
//! Only `Exported` is final. A skipped bar stays out of the exported set so a later
//! pass can still succeed.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    DimensionError,
    ZeroTrades,
    BelowMinVolume,
    MissingCandle,
    Serialization,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::DimensionError => "dimension_error",
            SkipReason::ZeroTrades => "zero_trades",
            SkipReason::BelowMinVolume => "below_min_volume",
            SkipReason::MissingCandle => "missing_candle",
            SkipReason::Serialization => "serialization",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarState {
    Pending,
    Processing,
    Exported,
    Skipped(SkipReason),
}

pub struct BarStateTracker {
    states: HashMap<usize, BarState>,
    exported: BTreeSet<usize>,
    debounce: Duration,
    duplicates: u64,
}

impl BarStateTracker {
    pub fn new(debounce: Duration) -> Self {
        Self {
            states: HashMap::new(),
            exported: BTreeSet::new(),
            debounce,
            duplicates: 0,
        }
    }

    pub fn state(&self, bar: usize) -> BarState {
        self.states.get(&bar).copied().unwrap_or(BarState::Pending)
    }

    pub fn is_exported(&self, bar: usize) -> bool {
        self.exported.contains(&bar)
    }

    /// Claim `bar` for processing. Returns `false` (and counts a duplicate) when
    /// the bar was already exported; its state is left untouched.
    pub fn begin(&mut self, bar: usize) -> bool {
        if self.exported.contains(&bar) {
            self.duplicates += 1;
            return false;
        }
        self.states.insert(bar, BarState::Processing);
        true
    }

    /// Give back a claimed bar that was not ready; it returns to `Pending`
    pub fn release(&mut self, bar: usize) {
        if self.state(bar) == BarState::Processing {
            self.states.remove(&bar);
        }
    }

    pub fn mark_exported(&mut self, bar: usize) {
        self.states.insert(bar, BarState::Exported);
        self.exported.insert(bar);
    }

    pub fn mark_skipped(&mut self, bar: usize, reason: SkipReason) {
        if !self.exported.contains(&bar) {
            self.states.insert(bar, BarState::Skipped(reason));
        }
    }

    /// Whether a bar may be finalized now.
    ///
    /// Closed bars and historical bars always qualify. The live bar only qualifies
    /// once `debounce` has passed since its nominal close, because the host fires
    /// the update hook on every tick while it is still forming.
    pub fn is_eligible(
        &self,
        closed: bool,
        is_live: bool,
        close_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        closed || !is_live || now >= close_time + self.debounce
    }

    /// Every index in `0..=current_bar` not yet exported, ascending
    pub fn backtrack_candidates(&self, current_bar: usize) -> Vec<usize> {
        (0..=current_bar)
            .filter(|bar| !self.exported.contains(bar))
            .collect()
    }

    pub fn exported_count(&self) -> usize {
        self.exported.len()
    }

    pub fn exported_bars(&self) -> impl Iterator<Item = usize> + '_ {
        self.exported.iter().copied()
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn clear(&mut self) {
        self.states.clear();
        self.exported.clear();
        self.duplicates = 0;
    }
}
