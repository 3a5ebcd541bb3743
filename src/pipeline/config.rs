//! Pipeline configuration from environment variables
//!
//! One pipeline instance serves one instrument/timeframe; every policy knob that
//! differed between exporter generations is a field here rather than a variant type.

use std::env;
use std::fmt;
use std::str::FromStr;

use chrono::Duration;
use thiserror::Error;

use crate::export_core::CombineMode;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
    #[error("{key}={value} is out of range (expected {expected})")]
    OutOfRange {
        key: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Bar length, written as `<n><unit>` with unit `s`, `m`, `h` or `d`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeframe {
    seconds: i64,
}

impl Timeframe {
    pub fn from_seconds(seconds: i64) -> Self {
        Self { seconds }
    }

    pub fn as_duration(&self) -> Duration {
        Duration::seconds(self.seconds)
    }

    pub fn seconds(&self) -> i64 {
        self.seconds
    }
}

impl Default for Timeframe {
    fn default() -> Self {
        Self::from_seconds(60)
    }
}

impl FromStr for Timeframe {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidValue {
            key: "MIF_TIMEFRAME",
            value: s.to_string(),
        };

        let s = s.trim();
        let split = s.len().checked_sub(1).ok_or_else(invalid)?;
        if !s.is_char_boundary(split) {
            return Err(invalid());
        }
        let (count, unit) = s.split_at(split);
        let count: i64 = count.parse().map_err(|_| invalid())?;
        if count <= 0 {
            return Err(invalid());
        }

        let unit_secs = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 3_600,
            "d" => 86_400,
            _ => return Err(invalid()),
        };
        Ok(Self::from_seconds(count * unit_secs))
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.seconds;
        if s % 86_400 == 0 {
            write!(f, "{}d", s / 86_400)
        } else if s % 3_600 == 0 {
            write!(f, "{}h", s / 3_600)
        } else if s % 60 == 0 {
            write!(f, "{}m", s / 60)
        } else {
            write!(f, "{}s", s)
        }
    }
}

/// Configuration for the bar export pipeline
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub symbol: String,
    pub timeframe: Timeframe,

    /// Ranks per side in every exported vector (W)
    pub fixed_width: usize,

    pub combine_mode: CombineMode,
    pub conservation_epsilon: f64,

    /// Consecutive identical ask vectors before depth is degraded (K)
    pub stale_threshold: u32,

    pub compress_output: bool,
    /// Compress when the occupied-rank fraction is below this
    pub compression_threshold: f64,

    /// Skip the bar when best ask or best bid volume is below this
    pub min_dom_volume: f64,
    pub skip_zero_trades: bool,

    /// Grace period after the live bar's close before it is finalized
    pub debounce_ms: u64,

    /// Writer flush threshold (records)
    pub buffer_size: usize,
    pub output_dir: String,
    pub file_prefix: String,
    pub exporter_id: String,

    pub export_dom: bool,
    pub export_cluster: bool,
    pub include_price_labels: bool,

    /// Ascending urgency-ratio edges; empty disables `class`
    pub urgency_class_edges: Vec<f64>,

    /// Log a counter summary every N update events
    pub heartbeat_every: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::default(),
            fixed_width: 20,
            combine_mode: CombineMode::Max,
            conservation_epsilon: 1e-2,
            stale_threshold: 5,
            compress_output: true,
            compression_threshold: 0.7,
            min_dom_volume: 0.001,
            skip_zero_trades: true,
            debounce_ms: 5_000,
            buffer_size: 100,
            output_dir: "atas_export".to_string(),
            file_prefix: "bars".to_string(),
            exporter_id: "core".to_string(),
            export_dom: true,
            export_cluster: true,
            include_price_labels: true,
            urgency_class_edges: Vec::new(),
            heartbeat_every: 1_024,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables (all optional, see `Default` for values):
    /// - `MIF_SYMBOL`, `MIF_TIMEFRAME`, `MIF_EXPORTER_ID`
    /// - `MIF_FIXED_WIDTH`, `MIF_COMBINE_MODE`, `MIF_CONSERVATION_EPS`
    /// - `MIF_STALE_THRESHOLD`, `MIF_COMPRESS_OUTPUT`, `MIF_COMPRESSION_THRESHOLD`
    /// - `MIF_MIN_DOM_VOLUME`, `MIF_SKIP_ZERO_TRADES`, `MIF_DEBOUNCE_MS`
    /// - `MIF_BUFFER_SIZE`, `MIF_OUTPUT_DIR`, `MIF_FILE_PREFIX`
    /// - `MIF_EXPORT_DOM`, `MIF_EXPORT_CLUSTER`, `MIF_INCLUDE_PRICE_LABELS`
    /// - `MIF_URGENCY_CLASS_EDGES` (comma separated), `MIF_HEARTBEAT_EVERY`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env`, reading values through `lookup`.
    /// Unparseable values keep the default and log a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();

        Self {
            symbol: lookup("MIF_SYMBOL").unwrap_or(d.symbol),
            timeframe: parse_or(&lookup, "MIF_TIMEFRAME", d.timeframe),
            fixed_width: parse_or(&lookup, "MIF_FIXED_WIDTH", d.fixed_width),
            combine_mode: parse_or(&lookup, "MIF_COMBINE_MODE", d.combine_mode),
            conservation_epsilon: parse_or(&lookup, "MIF_CONSERVATION_EPS", d.conservation_epsilon),
            stale_threshold: parse_or(&lookup, "MIF_STALE_THRESHOLD", d.stale_threshold),
            compress_output: flag_or(&lookup, "MIF_COMPRESS_OUTPUT", d.compress_output),
            compression_threshold: parse_or(
                &lookup,
                "MIF_COMPRESSION_THRESHOLD",
                d.compression_threshold,
            ),
            min_dom_volume: parse_or(&lookup, "MIF_MIN_DOM_VOLUME", d.min_dom_volume),
            skip_zero_trades: flag_or(&lookup, "MIF_SKIP_ZERO_TRADES", d.skip_zero_trades),
            debounce_ms: parse_or(&lookup, "MIF_DEBOUNCE_MS", d.debounce_ms),
            buffer_size: parse_or(&lookup, "MIF_BUFFER_SIZE", d.buffer_size),
            output_dir: lookup("MIF_OUTPUT_DIR").unwrap_or(d.output_dir),
            file_prefix: lookup("MIF_FILE_PREFIX").unwrap_or(d.file_prefix),
            exporter_id: lookup("MIF_EXPORTER_ID").unwrap_or(d.exporter_id),
            export_dom: flag_or(&lookup, "MIF_EXPORT_DOM", d.export_dom),
            export_cluster: flag_or(&lookup, "MIF_EXPORT_CLUSTER", d.export_cluster),
            include_price_labels: flag_or(
                &lookup,
                "MIF_INCLUDE_PRICE_LABELS",
                d.include_price_labels,
            ),
            urgency_class_edges: lookup("MIF_URGENCY_CLASS_EDGES")
                .map(|raw| parse_edges(&raw))
                .unwrap_or(d.urgency_class_edges),
            heartbeat_every: parse_or(&lookup, "MIF_HEARTBEAT_EVERY", d.heartbeat_every),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(5..=50).contains(&self.fixed_width) {
            return Err(out_of_range("MIF_FIXED_WIDTH", self.fixed_width, "5..=50"));
        }
        if !(1..=1000).contains(&self.buffer_size) {
            return Err(out_of_range("MIF_BUFFER_SIZE", self.buffer_size, "1..=1000"));
        }
        if self.stale_threshold == 0 {
            return Err(out_of_range("MIF_STALE_THRESHOLD", self.stale_threshold, ">= 1"));
        }
        if !(self.compression_threshold > 0.0 && self.compression_threshold <= 1.0) {
            return Err(out_of_range(
                "MIF_COMPRESSION_THRESHOLD",
                self.compression_threshold,
                "(0, 1]",
            ));
        }
        if !(self.conservation_epsilon.is_finite() && self.conservation_epsilon >= 0.0) {
            return Err(out_of_range(
                "MIF_CONSERVATION_EPS",
                self.conservation_epsilon,
                "finite, >= 0",
            ));
        }
        if !(self.min_dom_volume.is_finite() && self.min_dom_volume >= 0.0) {
            return Err(out_of_range("MIF_MIN_DOM_VOLUME", self.min_dom_volume, "finite, >= 0"));
        }
        if self.heartbeat_every == 0 {
            return Err(out_of_range("MIF_HEARTBEAT_EVERY", self.heartbeat_every, ">= 1"));
        }
        if self.timeframe.seconds() <= 0 {
            return Err(out_of_range("MIF_TIMEFRAME", self.timeframe, "positive"));
        }
        if self.urgency_class_edges.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::InvalidValue {
                key: "MIF_URGENCY_CLASS_EDGES",
                value: format!("{:?}", self.urgency_class_edges),
            });
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::milliseconds(self.debounce_ms as i64)
    }

    /// `None` when compression is switched off
    pub fn compression(&self) -> Option<f64> {
        self.compress_output.then_some(self.compression_threshold)
    }
}

fn out_of_range(key: &'static str, value: impl fmt::Display, expected: &'static str) -> ConfigError {
    ConfigError::OutOfRange {
        key,
        value: value.to_string(),
        expected,
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("⚠️  Ignoring unparseable {}='{}', using default", key, raw);
                default
            }
        },
        None => default,
    }
}

fn flag_or<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|raw| raw.trim().to_ascii_lowercase()) {
        Some(raw) => match raw.as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                log::warn!("⚠️  Ignoring unparseable {}='{}', using default", key, raw);
                default
            }
        },
        None => default,
    }
}

fn parse_edges(raw: &str) -> Vec<f64> {
    let parsed: Result<Vec<f64>, _> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse::<f64>)
        .collect();

    parsed.unwrap_or_else(|_| {
        log::warn!("⚠️  Ignoring unparseable MIF_URGENCY_CLASS_EDGES='{}'", raw);
        Vec::new()
    })
}
