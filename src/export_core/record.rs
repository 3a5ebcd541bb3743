//! Bar record model - one immutable analytics record per exported bar
//!
//! Everything under `cluster_stats`, `trades`, `urgency_metrics` and
//! `liquidity_metrics` lives in the epsilon domain (volumes and level indices).
//! Price values only appear in `validation_metrics` and the `cluster` block,
//! both of which are audit labels and are never read by a calculator.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Schema tag written to `header.version`
pub const SCHEMA_VERSION: &str = "mif.v1.1";

/// Bars cover the right-closed UTC window `(t_open, t_close]`
pub const WINDOW_CONVENTION: &str = "UTC-right-closed";

/// Where the depth vectors of a bar came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpsilonSource {
    /// Fresh depth-of-market snapshot
    DomLevels,
    /// No usable snapshot (capture failed, disabled, or degraded as stale)
    Unavailable,
}

impl EpsilonSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpsilonSource::DomLevels => "dom_levels",
            EpsilonSource::Unavailable => "unavailable",
        }
    }
}

/// Per-bar volume snapshot of the book, addressed by depth rank
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyCluster {
    #[serde(rename = "best_ask_idx")]
    pub best_ask_index: usize,
    #[serde(rename = "best_bid_idx")]
    pub best_bid_index: usize,
    pub ask_per_level: Vec<f64>,
    pub bid_per_level: Vec<f64>,
    pub num_levels: usize,
    pub source: EpsilonSource,
    /// Levels actually present on both sides before zero padding
    pub effective_levels: usize,
}

impl EnergyCluster {
    pub fn new(
        best_ask_index: usize,
        best_bid_index: usize,
        ask_per_level: Vec<f64>,
        bid_per_level: Vec<f64>,
    ) -> Self {
        let num_levels = ask_per_level.len();
        Self {
            best_ask_index,
            best_bid_index,
            ask_per_level,
            bid_per_level,
            num_levels,
            source: EpsilonSource::DomLevels,
            effective_levels: num_levels,
        }
    }

    /// Zero-filled cluster of the configured width, tagged `unavailable`
    pub fn unavailable(width: usize) -> Self {
        Self {
            best_ask_index: 0,
            best_bid_index: 0,
            ask_per_level: vec![0.0; width],
            bid_per_level: vec![0.0; width],
            num_levels: width,
            source: EpsilonSource::Unavailable,
            effective_levels: 0,
        }
    }

    pub fn with_effective_levels(mut self, effective_levels: usize) -> Self {
        self.effective_levels = effective_levels;
        self
    }

    pub fn is_available(&self) -> bool {
        self.source == EpsilonSource::DomLevels
    }

    pub fn ask_total(&self) -> f64 {
        self.ask_per_level.iter().sum()
    }

    pub fn bid_total(&self) -> f64 {
        self.bid_per_level.iter().sum()
    }
}

/// Executed volume of the bar, classified by aggressor side
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TradeFlow {
    pub realized_buy: f64,
    pub realized_sell: f64,
}

impl TradeFlow {
    pub fn new(realized_buy: f64, realized_sell: f64) -> Self {
        Self {
            realized_buy: realized_buy.max(0.0),
            realized_sell: realized_sell.max(0.0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.realized_buy == 0.0 && self.realized_sell == 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrgencyOut {
    pub u_buy: f64,
    pub u_sell: f64,
    #[serde(rename = "urgency_ratio")]
    pub ratio: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Liquidity {
    pub book_imbalance: f64,
    pub depth: usize,
}

/// Audit-only price labels. No calculator may read this.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValidationView {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_ask: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_bid: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid_price: Option<f64>,
    /// Ask ladder labels, aligned with `ask_per_level`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_levels: Option<Vec<f64>>,
    /// Bid ladder labels, aligned with `bid_per_level`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid_price_levels: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MifCompliance {
    Full,
    Partial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signatures {
    pub energy_conservation_ok: bool,
    pub levels_sorted_ok: bool,
    pub mif_compliance: MifCompliance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub symbol: String,
    pub timeframe: String,
    #[serde(rename = "t_open", with = "utc_ticks")]
    pub open_time: DateTime<Utc>,
    #[serde(rename = "t_close", with = "utc_ticks")]
    pub close_time: DateTime<Utc>,
    #[serde(rename = "version")]
    pub schema_version: String,
    #[serde(rename = "exporter")]
    pub exporter_id: String,
    pub window_convention: String,
    pub bar_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ohlcv {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub ticks: u64,
}

/// Price-level trade clusters of the bar, first `W` levels as delivered by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub ask_vol: Vec<f64>,
    pub bid_vol: Vec<f64>,
    /// Labels only; a level without a price is written as null
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prices: Option<Vec<Option<f64>>>,
    pub effective_levels: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarRecord {
    pub header: Header,
    pub cluster_stats: EnergyCluster,
    pub trades: TradeFlow,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency_metrics: Option<UrgencyOut>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liquidity_metrics: Option<Liquidity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_metrics: Option<ValidationView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ohlcv: Option<Ohlcv>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterSnapshot>,
    pub signatures: Signatures,
}

impl BarRecord {
    /// UTC calendar day used for file partitioning
    pub fn open_date(&self) -> NaiveDate {
        self.header.open_time.date_naive()
    }

    pub fn bar_index(&self) -> usize {
        self.header.bar_index
    }

    /// Serialize to a single JSON line (no trailing newline)
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// `2024-01-01T00:00:00.0000000Z` - seven fractional digits (100ns ticks)
pub mod utc_ticks {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(ts: &DateTime<Utc>) -> String {
        format!(
            "{}.{:07}Z",
            ts.format("%Y-%m-%dT%H:%M:%S"),
            ts.timestamp_subsec_nanos() / 100
        )
    }

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
