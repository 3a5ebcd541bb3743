//! # Bar Export Pipeline
//!
//! Host-facing half of the exporter. The host fires an update callback for a bar
//! many times (every tick of the forming bar, again during backfill), may hand
//! back identical depth when its feed is frozen, and never says when a bar is
//! truly final. This module turns that stream into exactly one record per bar.
//!
//! ## Module Organization
//!
//! - `config` - `PipelineConfig`, env loading and validation
//! - `source` - `BarSource` adapter trait, replay and synthetic sources
//! - `state` - per-bar ledger (dedup, debounce eligibility, backtrack candidates)
//! - `metrics` - injected counter sink
//! - `engine` - `PipelineEngine`, the per-update orchestrator

pub mod config;
pub mod engine;
pub mod metrics;
pub mod source;
pub mod state;

// Re-export commonly used types
pub use config::{ConfigError, PipelineConfig, Timeframe};
pub use engine::{PipelineEngine, ShutdownSummary, UpdateOutcome};
pub use metrics::{Counter, CounterSnapshot, ExportCounters, MetricsSink, NoopMetrics};
pub use source::{
    BarSource, BarUpdate, Candle, ClusterLevel, HostBarCapture, ReplayClock, ReplayError,
    ReplaySource, SyntheticSource,
};
pub use state::{BarState, BarStateTracker, SkipReason};
