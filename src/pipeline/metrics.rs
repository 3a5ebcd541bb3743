//! Export health counters
//!
//! Counters are per pipeline instance. The engine keeps its own `ExportCounters`
//! for heartbeat and shutdown summaries and forwards every increment to an
//! injected `MetricsSink`, so a host can aggregate across instances without any
//! process-wide state.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    /// Update callbacks received
    UpdatesSeen,
    /// Callbacks for a still-forming bar inside the debounce window
    Deferred,
    Exported,
    Skipped,
    Duplicates,
    DimensionErrors,
    DomCaptured,
    DomUnavailable,
    DomStale,
    ClusterMissing,
    SerializationErrors,
    WriteErrors,
    Flushes,
    BacktrackRecovered,
}

pub trait MetricsSink: Send + Sync {
    fn incr(&self, counter: Counter);
}

/// Discards everything
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr(&self, _counter: Counter) {}
}

#[derive(Debug, Default)]
pub struct ExportCounters {
    updates_seen: AtomicU64,
    deferred: AtomicU64,
    exported: AtomicU64,
    skipped: AtomicU64,
    duplicates: AtomicU64,
    dimension_errors: AtomicU64,
    dom_captured: AtomicU64,
    dom_unavailable: AtomicU64,
    dom_stale: AtomicU64,
    cluster_missing: AtomicU64,
    serialization_errors: AtomicU64,
    write_errors: AtomicU64,
    flushes: AtomicU64,
    backtrack_recovered: AtomicU64,
}

impl ExportCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::UpdatesSeen => &self.updates_seen,
            Counter::Deferred => &self.deferred,
            Counter::Exported => &self.exported,
            Counter::Skipped => &self.skipped,
            Counter::Duplicates => &self.duplicates,
            Counter::DimensionErrors => &self.dimension_errors,
            Counter::DomCaptured => &self.dom_captured,
            Counter::DomUnavailable => &self.dom_unavailable,
            Counter::DomStale => &self.dom_stale,
            Counter::ClusterMissing => &self.cluster_missing,
            Counter::SerializationErrors => &self.serialization_errors,
            Counter::WriteErrors => &self.write_errors,
            Counter::Flushes => &self.flushes,
            Counter::BacktrackRecovered => &self.backtrack_recovered,
        }
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.slot(counter).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            updates_seen: self.get(Counter::UpdatesSeen),
            deferred: self.get(Counter::Deferred),
            exported: self.get(Counter::Exported),
            skipped: self.get(Counter::Skipped),
            duplicates: self.get(Counter::Duplicates),
            dimension_errors: self.get(Counter::DimensionErrors),
            dom_captured: self.get(Counter::DomCaptured),
            dom_unavailable: self.get(Counter::DomUnavailable),
            dom_stale: self.get(Counter::DomStale),
            cluster_missing: self.get(Counter::ClusterMissing),
            serialization_errors: self.get(Counter::SerializationErrors),
            write_errors: self.get(Counter::WriteErrors),
            flushes: self.get(Counter::Flushes),
            backtrack_recovered: self.get(Counter::BacktrackRecovered),
        }
    }
}

impl MetricsSink for ExportCounters {
    fn incr(&self, counter: Counter) {
        self.slot(counter).fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CounterSnapshot {
    pub updates_seen: u64,
    pub deferred: u64,
    pub exported: u64,
    pub skipped: u64,
    pub duplicates: u64,
    pub dimension_errors: u64,
    pub dom_captured: u64,
    pub dom_unavailable: u64,
    pub dom_stale: u64,
    pub cluster_missing: u64,
    pub serialization_errors: u64,
    pub write_errors: u64,
    pub flushes: u64,
    pub backtrack_recovered: u64,
}

impl fmt::Display for CounterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "updates={} exported={} skipped={} dup={} dim_err={} dom_ok={} dom_unavail={} dom_stale={} \
             cluster_missing={} ser_err={} write_err={} flushes={} recovered={}",
            self.updates_seen,
            self.exported,
            self.skipped,
            self.duplicates,
            self.dimension_errors,
            self.dom_captured,
            self.dom_unavailable,
            self.dom_stale,
            self.cluster_missing,
            self.serialization_errors,
            self.write_errors,
            self.flushes,
            self.backtrack_recovered
        )
    }
}
