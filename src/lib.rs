//! Bar-level market microstructure exporter
//!
//! Turns per-bar order-book depth and trade clusters from a market-data host into
//! one normalized, price-independent analytics record per completed bar, written
//! to date-partitioned JSONL files.
//!
//! - [`export_core`] holds the record model, calculators and writer
//! - [`pipeline`] holds the per-bar state machine that drives them

pub mod export_core;
pub mod pipeline;

pub use export_core::{BarRecord, BufferedJsonlWriter, RecordWriterBackend};
pub use pipeline::{PipelineConfig, PipelineEngine, UpdateOutcome};
