//! Pipeline Engine - per-bar export orchestration
//!
//! Composes the export core into the host-facing state machine: every update
//! callback yields zero or one `BarRecord`, each bar index is written at most
//! once, and `shutdown` backtracks over every bar that never made it out.
//!
//! ## Per-bar flow
//!
//! ```text
//! BarUpdate
//!     ↓ already exported? → Duplicate
//!     ↓ live bar inside debounce window? → Deferred
//! depth_snapshot → split_book → DimensionNormalizer
//!     ↓ best level below min volume? → Skipped
//! cluster_levels → TradeFlow
//!     ↓ no trades (policy)? → Skipped
//! StalenessDetector (frozen depth → unavailable)
//! UrgencyScorer / liquidity / EnergyValidator → BarRecord
//!     ↓
//! RecordWriterBackend::append → mark exported → flush at threshold
//! ```
//!
//! Per-bar failures stop at this boundary. Nothing here returns an error to the
//! host; outcomes and counters are the health signal.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::config::PipelineConfig;
use super::metrics::{Counter, CounterSnapshot, ExportCounters, MetricsSink};
use super::source::{BarSource, BarUpdate, Candle, ClusterLevel};
use super::state::{BarStateTracker, SkipReason};
use crate::export_core::{
    liquidity, split_book, BarRecord, ClusterSnapshot, DimensionNormalizer, EnergyCluster,
    EnergyValidator, Freshness, Header, NormalizedLevels, Ohlcv, RecordWriterBackend,
    StalenessDetector, TradeFlow, UrgencyScorer, ValidationView, WriterError, SCHEMA_VERSION,
    WINDOW_CONVENTION,
};

/// Warnings for a recurring condition are only logged on every 64th bar
const WARN_EVERY_BARS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Exported,
    /// Bar already exported; nothing recomputed
    Duplicate,
    /// Live bar still inside the debounce window
    Deferred,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShutdownSummary {
    /// Bars the backtrack pass attempted
    pub attempted: usize,
    /// Of those, bars that were exported
    pub recovered: usize,
    /// Lines written by the final flush
    pub flushed: usize,
    /// Lines still buffered after the final flush (non-zero only on write failure)
    pub unflushed: usize,
    pub counters: CounterSnapshot,
}

/// Normalized depth for one bar plus the raw top-of-book it came from
struct DepthCapture {
    levels: NormalizedLevels,
    effective_levels: usize,
    best_ask: (f64, f64),
    best_bid: (f64, f64),
}

/// Bar export engine for one instrument/timeframe
///
/// Single-writer: the host delivers updates sequentially, so no locking.
pub struct PipelineEngine<S, W> {
    config: PipelineConfig,
    source: S,
    writer: W,

    normalizer: DimensionNormalizer,
    staleness: StalenessDetector,
    scorer: UrgencyScorer,
    validator: EnergyValidator,
    tracker: BarStateTracker,

    counters: ExportCounters,
    sink: Arc<dyn MetricsSink>,
    events: u64,

    /// Clock (for testing with mock time)
    now_fn: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl<S: BarSource, W: RecordWriterBackend> PipelineEngine<S, W> {
    /// Create an engine on the system clock
    pub fn new(config: PipelineConfig, source: S, writer: W, sink: Arc<dyn MetricsSink>) -> Self {
        Self::new_with_clock(config, source, writer, sink, Box::new(Utc::now))
    }

    /// Create an engine with a custom clock
    ///
    /// # Arguments
    /// * `now_fn` - Function returning the current UTC time (for testing)
    pub fn new_with_clock(
        config: PipelineConfig,
        source: S,
        writer: W,
        sink: Arc<dyn MetricsSink>,
        now_fn: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    ) -> Self {
        let normalizer = DimensionNormalizer::new(config.fixed_width, config.compression());
        let staleness = StalenessDetector::new(config.stale_threshold);
        let scorer = UrgencyScorer::new(config.combine_mode)
            .with_class_edges(config.urgency_class_edges.clone());
        let validator = EnergyValidator::new(config.conservation_epsilon);
        let tracker = BarStateTracker::new(config.debounce());

        log::info!(
            "🚀 Bar export pipeline: {} {} W={} mode={} K={} writer={}",
            config.symbol,
            config.timeframe,
            config.fixed_width,
            config.combine_mode,
            config.stale_threshold,
            writer.backend_type()
        );

        Self {
            config,
            source,
            writer,
            normalizer,
            staleness,
            scorer,
            validator,
            tracker,
            counters: ExportCounters::new(),
            sink,
            events: 0,
            now_fn,
        }
    }

    /// Handle one host callback for `update.bar_index`
    pub fn on_bar_update(&mut self, update: BarUpdate) -> UpdateOutcome {
        let bar = update.bar_index;
        self.events += 1;
        self.record(Counter::UpdatesSeen);
        if self.events % self.config.heartbeat_every.max(1) == 0 {
            log::info!("💓 Heartbeat after {} events: {}", self.events, self.counters.snapshot());
        }

        if !self.tracker.begin(bar) {
            self.record(Counter::Duplicates);
            return UpdateOutcome::Duplicate;
        }

        let Some(candle) = self.source.candle(bar) else {
            return self.skip(bar, SkipReason::MissingCandle);
        };

        let close_time = candle.open_time + self.config.timeframe.as_duration();
        let is_live = self.source.current_bar().map_or(true, |current| bar >= current);
        let now = (self.now_fn)();
        if !self.tracker.is_eligible(update.closed, is_live, close_time, now) {
            self.tracker.release(bar);
            self.record(Counter::Deferred);
            return UpdateOutcome::Deferred;
        }

        self.process_bar(bar, &candle)
    }

    /// Re-drive every bar never exported, then flush whatever is buffered
    pub fn shutdown(&mut self) -> ShutdownSummary {
        let candidates = self
            .source
            .current_bar()
            .map(|current| self.tracker.backtrack_candidates(current))
            .unwrap_or_default();

        log::info!("🔁 Backtrack: {} bars not yet exported", candidates.len());

        let mut recovered = 0;
        for &bar in &candidates {
            self.tracker.begin(bar);
            let Some(candle) = self.source.candle(bar) else {
                self.skip(bar, SkipReason::MissingCandle);
                continue;
            };

            match self.process_bar(bar, &candle) {
                UpdateOutcome::Exported => {
                    recovered += 1;
                    self.record(Counter::BacktrackRecovered);
                }
                outcome => log::debug!("Backtrack bar {} not recovered: {:?}", bar, outcome),
            }
        }

        let flushed = match self.flush_writer() {
            Ok(n) => n,
            Err(e) => {
                log::error!(
                    "❌ Final flush failed, {} records still buffered: {}",
                    self.writer.pending(),
                    e
                );
                0
            }
        };

        let summary = ShutdownSummary {
            attempted: candidates.len(),
            recovered,
            flushed,
            unflushed: self.writer.pending(),
            counters: self.counters.snapshot(),
        };

        log::info!(
            "✅ Shutdown: recovered {}/{} missing bars, {} exported in total | {}",
            summary.recovered,
            summary.attempted,
            self.tracker.exported_count(),
            summary.counters
        );

        self.tracker.clear();
        self.staleness.reset();
        summary
    }

    /// Flush the writer now, counting the result
    pub fn flush_writer(&mut self) -> Result<usize, WriterError> {
        match self.writer.flush() {
            Ok(n) => {
                if n > 0 {
                    self.record(Counter::Flushes);
                }
                Ok(n)
            }
            Err(e) => {
                self.record(Counter::WriteErrors);
                log::warn!(
                    "⚠️  Flush failed, keeping {} buffered records: {}",
                    self.writer.pending(),
                    e
                );
                Err(e)
            }
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn writer_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn tracker(&self) -> &BarStateTracker {
        &self.tracker
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Full processing of a bar already claimed by the tracker
    fn process_bar(&mut self, bar: usize, candle: &Candle) -> UpdateOutcome {
        let record = match self.build_record(bar, candle) {
            Ok(record) => record,
            Err(reason) => return self.skip(bar, reason),
        };

        if let Err(e) = self.writer.append(&record) {
            self.record(Counter::SerializationErrors);
            log::warn!("⚠️  Bar {} could not be encoded: {}", bar, e);
            return self.skip(bar, SkipReason::Serialization);
        }

        self.tracker.mark_exported(bar);
        self.record(Counter::Exported);
        log::debug!(
            "Exported bar {} ({}, {})",
            bar,
            record.cluster_stats.source.as_str(),
            record.header.open_time
        );

        if self.writer.should_flush() {
            // A failed flush keeps the lines buffered; the bar stays exported
            let _ = self.flush_writer();
        }

        UpdateOutcome::Exported
    }

    fn build_record(&mut self, bar: usize, candle: &Candle) -> Result<BarRecord, SkipReason> {
        let captured = if self.config.export_dom {
            self.capture_depth(bar)?
        } else {
            None
        };

        // Frozen depth is dropped below, so the volume floor only applies to fresh depth
        if let Some(d) = captured
            .as_ref()
            .filter(|d| !self.staleness.peek(&d.levels.ask).is_stale())
        {
            if d.best_ask.1 < self.config.min_dom_volume || d.best_bid.1 < self.config.min_dom_volume {
                log::debug!("Bar {} below minimum DOM volume", bar);
                return Err(SkipReason::BelowMinVolume);
            }
        }

        let clusters = match self.source.cluster_levels(bar) {
            Some(levels) => levels,
            None => {
                self.record(Counter::ClusterMissing);
                Vec::new()
            }
        };
        let trades = TradeFlow::new(
            clusters.iter().map(|c| c.ask_volume).sum(),
            clusters.iter().map(|c| c.bid_volume).sum(),
        );

        if self.config.skip_zero_trades && trades.is_empty() {
            return Err(SkipReason::ZeroTrades);
        }

        // Only bars that survive the skip policies move the staleness baseline
        let depth = captured.and_then(|d| self.accept_depth(bar, d));

        let width = self.config.fixed_width;
        let (cluster_stats, validation_metrics) = match &depth {
            Some(d) => (
                EnergyCluster::new(0, 0, d.levels.ask.clone(), d.levels.bid.clone())
                    .with_effective_levels(d.effective_levels),
                self.config.include_price_labels.then(|| validation_view(d)),
            ),
            None => (EnergyCluster::unavailable(width), None),
        };

        let (urgency_metrics, liquidity_metrics) = if cluster_stats.is_available() {
            (
                Some(self.scorer.urgency(&cluster_stats, &trades)),
                Some(liquidity(&cluster_stats)),
            )
        } else {
            (None, None)
        };

        let (signatures, check) = self.validator.signatures(&cluster_stats, &trades);
        log::trace!(
            "Bar {} conservation ok={} d_ask={:.4} d_bid={:.4}",
            bar,
            check.ok,
            check.delta_ask,
            check.delta_bid
        );

        let cluster = (self.config.export_cluster && !clusters.is_empty())
            .then(|| cluster_snapshot(&clusters, width, self.config.include_price_labels));

        Ok(BarRecord {
            header: Header {
                symbol: self.config.symbol.clone(),
                timeframe: self.config.timeframe.to_string(),
                open_time: candle.open_time,
                close_time: candle.open_time + self.config.timeframe.as_duration(),
                schema_version: SCHEMA_VERSION.to_string(),
                exporter_id: self.config.exporter_id.clone(),
                window_convention: WINDOW_CONVENTION.to_string(),
                bar_index: bar,
            },
            cluster_stats,
            trades,
            urgency_metrics,
            liquidity_metrics,
            validation_metrics,
            ohlcv: Some(Ohlcv {
                open: candle.open,
                high: candle.high,
                low: candle.low,
                close: candle.close,
                volume: candle.volume,
                ticks: candle.ticks,
            }),
            cluster,
            signatures,
        })
    }

    /// `Ok(None)` means the capture failed for this bar
    fn capture_depth(&mut self, bar: usize) -> Result<Option<DepthCapture>, SkipReason> {
        let width = self.config.fixed_width;
        let Some(book) = self
            .source
            .depth_snapshot(bar)
            .and_then(|raw| split_book(&raw, width))
        else {
            self.staleness.reset();
            self.record(Counter::DomUnavailable);
            log::debug!("Bar {} depth unavailable", bar);
            return Ok(None);
        };

        let levels = match self.normalizer.normalize(&book) {
            Ok(levels) => levels,
            Err(e) => {
                self.record(Counter::DimensionErrors);
                if bar % WARN_EVERY_BARS == 0 {
                    log::warn!("⚠️  Bar {} dimension error: {}", bar, e);
                } else {
                    log::debug!("Bar {} dimension error: {}", bar, e);
                }
                return Err(SkipReason::DimensionError);
            }
        };

        Ok(Some(DepthCapture {
            effective_levels: book.effective_levels(),
            best_ask: top_of_book(&book.ask_prices, &book.ask_volumes),
            best_bid: top_of_book(&book.bid_prices, &book.bid_volumes),
            levels,
        }))
    }

    /// Record the depth as the new baseline; `None` when it repeats for too long
    fn accept_depth(&mut self, bar: usize, depth: DepthCapture) -> Option<DepthCapture> {
        if let Freshness::Stale(run) = self.staleness.observe(&depth.levels.ask) {
            self.record(Counter::DomStale);
            self.record(Counter::DomUnavailable);
            if bar % WARN_EVERY_BARS == 0 {
                log::warn!(
                    "⚠️  Bar {}: identical depth for {} consecutive bars, degrading to unavailable",
                    bar,
                    run
                );
            } else {
                log::debug!("Bar {} stale depth (run {})", bar, run);
            }
            return None;
        }

        self.record(Counter::DomCaptured);
        Some(depth)
    }

    fn skip(&mut self, bar: usize, reason: SkipReason) -> UpdateOutcome {
        self.tracker.mark_skipped(bar, reason);
        self.record(Counter::Skipped);
        log::debug!("Skipped bar {}: {}", bar, reason);
        UpdateOutcome::Skipped(reason)
    }

    fn record(&self, counter: Counter) {
        self.counters.incr(counter);
        self.sink.incr(counter);
    }
}

/// `(price, volume)` at rank 0
fn top_of_book(prices: &[f64], volumes: &[f64]) -> (f64, f64) {
    (
        prices.first().copied().unwrap_or(0.0),
        volumes.first().copied().unwrap_or(0.0),
    )
}

fn validation_view(depth: &DepthCapture) -> ValidationView {
    let best_ask = depth.best_ask.0;
    let best_bid = depth.best_bid.0;
    ValidationView {
        best_ask: Some(best_ask),
        best_bid: Some(best_bid),
        mid_price: Some(0.5 * (best_ask + best_bid)),
        price_levels: Some(depth.levels.ask_labels.clone()),
        bid_price_levels: Some(depth.levels.bid_labels.clone()),
    }
}

fn cluster_snapshot(clusters: &[ClusterLevel], width: usize, with_prices: bool) -> ClusterSnapshot {
    let top = &clusters[..clusters.len().min(width)];
    ClusterSnapshot {
        ask_vol: top.iter().map(|c| c.ask_volume).collect(),
        bid_vol: top.iter().map(|c| c.bid_volume).collect(),
        prices: with_prices.then(|| {
            top.iter()
                .map(|c| c.price.filter(|p| p.is_finite()))
                .collect()
        }),
        effective_levels: top.len(),
    }
}
