//! Host adapter boundary
//!
//! The pipeline never discovers host data dynamically. Whatever feeds it (a live
//! platform binding, a captured session, a simulator) implements `BarSource` and
//! answers three questions per bar index: depth, candle, trade clusters. `None`
//! means "unavailable right now"; the pipeline decides what that costs the bar.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::export_core::{BookSide, LevelEntry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub ticks: u64,
}

/// Traded volume at one price bucket, split by aggressor side
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterLevel {
    #[serde(default)]
    pub price: Option<f64>,
    pub ask_volume: f64,
    pub bid_volume: f64,
}

/// One host callback: bar `bar_index` changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarUpdate {
    pub bar_index: usize,
    /// Host reports the bar as final
    pub closed: bool,
}

impl BarUpdate {
    pub fn live(bar_index: usize) -> Self {
        Self { bar_index, closed: false }
    }

    pub fn closed(bar_index: usize) -> Self {
        Self { bar_index, closed: true }
    }
}

pub trait BarSource {
    /// Current depth for `bar`; queried fresh on every call
    fn depth_snapshot(&self, bar: usize) -> Option<Vec<LevelEntry>>;

    fn candle(&self, bar: usize) -> Option<Candle>;

    fn cluster_levels(&self, bar: usize) -> Option<Vec<ClusterLevel>>;

    /// Index of the most recent (possibly still forming) bar
    fn current_bar(&self) -> Option<usize>;
}

/// One line of a captured host session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostBarCapture {
    pub bar_index: usize,
    #[serde(default)]
    pub closed: bool,
    pub candle: Candle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<Vec<LevelEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clusters: Option<Vec<ClusterLevel>>,
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Session time of a replay: the open of the newest captured bar
///
/// Clones share one reading, so the engine's clock follows the source as
/// captures are pushed.
#[derive(Debug, Clone, Default)]
pub struct ReplayClock {
    millis: Arc<AtomicI64>,
}

impl ReplayClock {
    pub fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
    }

    /// Move forward to `time`; an older time leaves the clock where it is
    pub fn advance_to(&self, time: DateTime<Utc>) {
        self.millis.fetch_max(time.timestamp_millis(), Ordering::SeqCst);
    }

    /// Clock function for `PipelineEngine::new_with_clock`
    pub fn now_fn(&self) -> Box<dyn Fn() -> DateTime<Utc> + Send + Sync> {
        let clock = self.clone();
        Box::new(move || clock.now())
    }
}

/// In-memory host state rebuilt from captured callbacks
///
/// Later captures of the same bar replace earlier ones, the way the host's
/// forming bar keeps changing until it closes.
#[derive(Debug, Default)]
pub struct ReplaySource {
    bars: BTreeMap<usize, HostBarCapture>,
    clock: ReplayClock,
}

impl ReplaySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a capture file, one JSON object per line. Blank lines are skipped.
    pub fn read_captures(path: impl AsRef<Path>) -> Result<Vec<HostBarCapture>, ReplayError> {
        let reader = BufReader::new(File::open(path)?);
        let mut captures = Vec::new();

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let capture = serde_json::from_str(&line).map_err(|source| ReplayError::Parse {
                line: idx + 1,
                source,
            })?;
            captures.push(capture);
        }

        Ok(captures)
    }

    /// Apply a capture and return the callback the host would have fired
    pub fn push(&mut self, capture: HostBarCapture) -> BarUpdate {
        let update = BarUpdate {
            bar_index: capture.bar_index,
            closed: capture.closed,
        };
        self.clock.advance_to(capture.candle.open_time);
        self.bars.insert(capture.bar_index, capture);
        update
    }

    /// Handle on the session time implied by the captures pushed so far
    pub fn clock(&self) -> ReplayClock {
        self.clock.clone()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }
}

impl BarSource for ReplaySource {
    fn depth_snapshot(&self, bar: usize) -> Option<Vec<LevelEntry>> {
        self.bars.get(&bar).and_then(|b| b.depth.clone())
    }

    fn candle(&self, bar: usize) -> Option<Candle> {
        self.bars.get(&bar).map(|b| b.candle.clone())
    }

    fn cluster_levels(&self, bar: usize) -> Option<Vec<ClusterLevel>> {
        self.bars.get(&bar).and_then(|b| b.clusters.clone())
    }

    fn current_bar(&self) -> Option<usize> {
        self.bars.keys().next_back().copied()
    }
}

/// Seeded market simulator
///
/// Depth is concentrated at the top of book with a few empty ranks; realized flow
/// is a fraction of the best level so urgency stays in a sane range. With
/// `freeze_depth` every bar after the first reuses the same book, reproducing a
/// dead depth subscription.
pub struct SyntheticSource {
    rng: StdRng,
    levels: usize,
    tick_size: f64,
    mid: f64,
    cursor: DateTime<Utc>,
    timeframe: Duration,
    freeze_depth: bool,
    bars: ReplaySource,
    next_index: usize,
}

impl SyntheticSource {
    pub fn new(seed: u64, levels: usize, start: DateTime<Utc>, timeframe: Duration) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            levels: levels.max(1),
            tick_size: 0.5,
            mid: 70_000.0,
            cursor: start,
            timeframe,
            freeze_depth: false,
            bars: ReplaySource::new(),
            next_index: 0,
        }
    }

    pub fn with_frozen_depth(mut self, freeze: bool) -> Self {
        self.freeze_depth = freeze;
        self
    }

    /// Open a new bar. Returns the close callback for the previous bar (if any)
    /// followed by the first tick of the new one.
    pub fn advance(&mut self) -> Vec<BarUpdate> {
        let bar_index = self.next_index;
        self.next_index += 1;

        let depth = match (self.freeze_depth, bar_index.checked_sub(1)) {
            (true, Some(prev)) => self.bars.depth_snapshot(prev),
            _ => Some(self.ladder()),
        };
        let clusters = self.trade_clusters(depth.as_deref().unwrap_or(&[]));
        let candle = self.next_candle(&clusters);

        self.cursor += self.timeframe;
        self.bars.push(HostBarCapture {
            bar_index,
            closed: false,
            candle,
            depth,
            clusters: Some(clusters),
        });

        let mut updates = Vec::with_capacity(2);
        if let Some(prev) = bar_index.checked_sub(1) {
            updates.push(BarUpdate::closed(prev));
        }
        updates.push(BarUpdate::live(bar_index));
        updates
    }

    fn ladder(&mut self) -> Vec<LevelEntry> {
        let mut levels = Vec::with_capacity(self.levels * 2);
        let best_ask = self.mid + self.tick_size / 2.0;
        let best_bid = self.mid - self.tick_size / 2.0;

        for i in 0..self.levels {
            let decay = 1.0 - i as f64 / self.levels as f64;
            let offset = i as f64 * self.tick_size;

            let ask = self.resting_volume(decay);
            let bid = self.resting_volume(decay);
            levels.push(LevelEntry::ask(best_ask + offset, ask));
            levels.push(LevelEntry::bid(best_bid - offset, bid));
        }
        levels
    }

    fn resting_volume(&mut self, decay: f64) -> f64 {
        // Roughly one rank in five is empty
        if self.rng.gen_bool(0.2) {
            return 0.0;
        }
        5.0 * decay * self.rng.gen_range(0.9..1.1)
    }

    fn trade_clusters(&mut self, depth: &[LevelEntry]) -> Vec<ClusterLevel> {
        let best = |side: BookSide| {
            depth
                .iter()
                .filter(|l| l.side == side && l.volume > 0.0)
                .map(|l| l.volume)
                .next()
                .unwrap_or(1.0)
        };
        let buy = (best(BookSide::Ask) * self.rng.gen_range(0.2..0.8)).max(0.1);
        let sell = (best(BookSide::Bid) * self.rng.gen_range(0.2..0.8)).max(0.1);

        let buckets = self.rng.gen_range(1..=4usize);
        (0..buckets)
            .map(|i| {
                let share = 1.0 / buckets as f64;
                ClusterLevel {
                    price: Some(self.mid + (i as f64 - buckets as f64 / 2.0) * self.tick_size),
                    ask_volume: buy * share,
                    bid_volume: sell * share,
                }
            })
            .collect()
    }

    fn next_candle(&mut self, clusters: &[ClusterLevel]) -> Candle {
        let open = self.mid;
        let drift = self.rng.gen_range(-4..=4) as f64 * self.tick_size;
        self.mid = (self.mid + drift).max(self.tick_size);
        let close = self.mid;
        let volume: f64 = clusters.iter().map(|c| c.ask_volume + c.bid_volume).sum();

        Candle {
            open_time: self.cursor,
            open,
            high: open.max(close) + self.tick_size,
            low: open.min(close) - self.tick_size,
            close,
            volume,
            ticks: self.rng.gen_range(1..200),
        }
    }
}

impl BarSource for SyntheticSource {
    fn depth_snapshot(&self, bar: usize) -> Option<Vec<LevelEntry>> {
        self.bars.depth_snapshot(bar)
    }

    fn candle(&self, bar: usize) -> Option<Candle> {
        self.bars.candle(bar)
    }

    fn cluster_levels(&self, bar: usize) -> Option<Vec<ClusterLevel>> {
        self.bars.cluster_levels(bar)
    }

    fn current_bar(&self) -> Option<usize> {
        self.bars.current_bar()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_read_captures() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"bar_index":0,"closed":true,"candle":{{"open_time":"2024-01-01T00:00:00Z","open":1.0,"high":2.0,"low":0.5,"close":1.5,"volume":3.0}},"depth":[{{"price":1.6,"volume":2.0,"side":"ask"}},{{"price":1.4,"volume":1.0,"side":"bid"}}]}}"#
        )
        .unwrap();
        writeln!(file).unwrap();
        writeln!(
            file,
            r#"{{"bar_index":1,"candle":{{"open_time":"2024-01-01T00:01:00Z","open":1.5,"high":1.5,"low":1.5,"close":1.5,"volume":0.0,"ticks":1}},"clusters":[{{"price":null,"ask_volume":0.2,"bid_volume":0.1}}]}}"#
        )
        .unwrap();

        let captures = ReplaySource::read_captures(file.path()).unwrap();
        assert_eq!(captures.len(), 2);
        assert!(captures[0].closed);
        assert_eq!(captures[0].depth.as_ref().unwrap().len(), 2);
        assert!(!captures[1].closed);
        assert!(captures[1].depth.is_none());
        assert_eq!(captures[1].clusters.as_ref().unwrap()[0].price, None);
    }

    #[test]
    fn test_bad_capture_line_reports_line_number() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{{\"bar_index\":0}}").unwrap();

        match ReplaySource::read_captures(file.path()) {
            Err(ReplayError::Parse { line, .. }) => assert_eq!(line, 1),
            other => panic!("expected parse error, got {:?}", other.map(|c| c.len())),
        }
    }

    #[test]
    fn test_replay_latest_capture_wins() {
        let mut source = ReplaySource::new();
        let candle = Candle {
            open_time: start(),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
            ticks: 1,
        };

        let first = source.push(HostBarCapture {
            bar_index: 4,
            closed: false,
            candle: candle.clone(),
            depth: None,
            clusters: None,
        });
        assert_eq!(first, BarUpdate::live(4));

        let second = source.push(HostBarCapture {
            bar_index: 4,
            closed: true,
            candle: Candle { volume: 7.0, ..candle },
            depth: Some(vec![LevelEntry::ask(2.0, 1.0)]),
            clusters: None,
        });
        assert_eq!(second, BarUpdate::closed(4));
        assert_eq!(source.len(), 1);
        assert_eq!(source.candle(4).unwrap().volume, 7.0);
        assert!(source.depth_snapshot(4).is_some());
        assert_eq!(source.current_bar(), Some(4));
    }

    #[test]
    fn test_replay_clock_follows_newest_capture() {
        let mut source = ReplaySource::new();
        let clock = source.clock();
        let at = |bar: usize, minute: i64| HostBarCapture {
            bar_index: bar,
            closed: false,
            candle: Candle {
                open_time: start() + Duration::minutes(minute),
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 1.0,
                ticks: 1,
            },
            depth: None,
            clusters: None,
        };

        source.push(at(3, 3));
        assert_eq!(clock.now(), start() + Duration::minutes(3));

        // Backfill of an older bar does not wind the clock back
        source.push(at(1, 1));
        assert_eq!(clock.now(), start() + Duration::minutes(3));
        assert_eq!((clock.now_fn())(), start() + Duration::minutes(3));
    }

    #[test]
    fn test_synthetic_is_deterministic() {
        let mut a = SyntheticSource::new(7, 10, start(), Duration::minutes(1));
        let mut b = SyntheticSource::new(7, 10, start(), Duration::minutes(1));
        a.advance();
        b.advance();

        assert_eq!(a.depth_snapshot(0), b.depth_snapshot(0));
        assert_eq!(a.cluster_levels(0), b.cluster_levels(0));
    }

    #[test]
    fn test_synthetic_advance_closes_previous_bar() {
        let mut source = SyntheticSource::new(1, 10, start(), Duration::minutes(1));

        assert_eq!(source.advance(), vec![BarUpdate::live(0)]);
        assert_eq!(source.advance(), vec![BarUpdate::closed(0), BarUpdate::live(1)]);
        assert_eq!(source.current_bar(), Some(1));
        assert_eq!(source.candle(1).unwrap().open_time, start() + Duration::minutes(1));

        let depth = source.depth_snapshot(1).unwrap();
        assert_eq!(depth.len(), 20);
        let clusters = source.cluster_levels(1).unwrap();
        assert!(clusters.iter().all(|c| c.ask_volume > 0.0 && c.bid_volume > 0.0));
    }

    #[test]
    fn test_synthetic_frozen_depth_repeats() {
        let mut source = SyntheticSource::new(3, 10, start(), Duration::minutes(1)).with_frozen_depth(true);
        source.advance();
        source.advance();
        source.advance();

        assert_eq!(source.depth_snapshot(0), source.depth_snapshot(2));
    }
}
