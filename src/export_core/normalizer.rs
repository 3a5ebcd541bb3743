//! Fixed-dimension normalization of raw depth levels
//!
//! Raw depth arrives as a flat list of `{price, volume, side}` entries. It is split
//! by side (asks by ascending price, bids by descending price, so rank 0 is always
//! the best level), forced to exactly `W` ranks, and optionally compressed so that
//! non-empty ranks come first. Price labels travel alongside the volumes and are
//! permuted identically; nothing here reads a price except to order the ladder.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    Ask,
    Bid,
}

impl fmt::Display for BookSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookSide::Ask => write!(f, "ask"),
            BookSide::Bid => write!(f, "bid"),
        }
    }
}

/// One raw depth level as delivered by the host
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelEntry {
    pub price: f64,
    pub volume: f64,
    pub side: BookSide,
}

impl LevelEntry {
    pub fn ask(price: f64, volume: f64) -> Self {
        Self { price, volume, side: BookSide::Ask }
    }

    pub fn bid(price: f64, volume: f64) -> Self {
        Self { price, volume, side: BookSide::Bid }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{side} levels have width {actual}, expected {expected}")]
pub struct DimensionError {
    pub side: BookSide,
    pub expected: usize,
    pub actual: usize,
}

/// Depth split by side, best level first, at most `W` ranks per side
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SplitBook {
    pub ask_volumes: Vec<f64>,
    pub bid_volumes: Vec<f64>,
    pub ask_prices: Vec<f64>,
    pub bid_prices: Vec<f64>,
}

impl SplitBook {
    /// Ranks populated on both sides before padding
    pub fn effective_levels(&self) -> usize {
        self.ask_volumes.len().min(self.bid_volumes.len())
    }
}

/// Split a raw snapshot into ranked sides.
///
/// Returns `None` when either side is empty: a one-sided book is treated as a
/// failed capture. Entries with a non-finite price or volume are dropped.
pub fn split_book(levels: &[LevelEntry], width: usize) -> Option<SplitBook> {
    let mut asks: Vec<(f64, f64)> = Vec::new();
    let mut bids: Vec<(f64, f64)> = Vec::new();

    for level in levels {
        if !level.price.is_finite() || !level.volume.is_finite() {
            continue;
        }
        match level.side {
            BookSide::Ask => asks.push((level.price, level.volume)),
            BookSide::Bid => bids.push((level.price, level.volume)),
        }
    }

    if asks.is_empty() || bids.is_empty() {
        return None;
    }

    asks.sort_by(|a, b| a.0.total_cmp(&b.0));
    bids.sort_by(|a, b| b.0.total_cmp(&a.0));
    asks.truncate(width);
    bids.truncate(width);

    Some(SplitBook {
        ask_volumes: asks.iter().map(|(_, v)| *v).collect(),
        bid_volumes: bids.iter().map(|(_, v)| *v).collect(),
        ask_prices: asks.iter().map(|(p, _)| *p).collect(),
        bid_prices: bids.iter().map(|(p, _)| *p).collect(),
    })
}

/// Zero-pad at the tail or truncate to exactly `width` entries
pub fn fit_width(values: &[f64], width: usize) -> Vec<f64> {
    let mut out: Vec<f64> = values.iter().take(width).copied().collect();
    out.resize(width, 0.0);
    out
}

/// Fixed-width ask/bid vectors plus their aligned price labels
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedLevels {
    pub ask: Vec<f64>,
    pub bid: Vec<f64>,
    pub ask_labels: Vec<f64>,
    pub bid_labels: Vec<f64>,
    pub compressed: bool,
}

impl NormalizedLevels {
    pub fn width(&self) -> usize {
        self.ask.len()
    }

    /// Fraction of ranks where either side carries volume
    pub fn occupancy(&self) -> f64 {
        if self.ask.is_empty() {
            return 0.0;
        }
        let occupied = self
            .ask
            .iter()
            .zip(&self.bid)
            .filter(|(a, b)| **a > 0.0 || **b > 0.0)
            .count();
        occupied as f64 / self.ask.len() as f64
    }

    /// Move occupied ranks to the front, preserving their relative order.
    ///
    /// The same permutation is applied to all four vectors, so every
    /// `(volume, label)` pair survives; only empty ranks move to the tail.
    pub fn compress(&mut self) {
        let (occupied, empty): (Vec<usize>, Vec<usize>) = (0..self.ask.len())
            .partition(|&i| self.ask[i] > 0.0 || self.bid[i] > 0.0);
        let order: Vec<usize> = occupied.into_iter().chain(empty).collect();

        let permute = |v: &[f64]| -> Vec<f64> { order.iter().map(|&i| v[i]).collect() };
        self.ask = permute(&self.ask);
        self.bid = permute(&self.bid);
        self.ask_labels = permute(&self.ask_labels);
        self.bid_labels = permute(&self.bid_labels);
        self.compressed = true;
    }

    pub fn ensure_width(&self, expected: usize) -> Result<(), DimensionError> {
        if self.ask.len() != expected {
            return Err(DimensionError {
                side: BookSide::Ask,
                expected,
                actual: self.ask.len(),
            });
        }
        if self.bid.len() != expected {
            return Err(DimensionError {
                side: BookSide::Bid,
                expected,
                actual: self.bid.len(),
            });
        }
        Ok(())
    }
}

pub struct DimensionNormalizer {
    width: usize,
    compression_threshold: Option<f64>,
}

impl DimensionNormalizer {
    /// `compression_threshold: None` disables compression
    pub fn new(width: usize, compression_threshold: Option<f64>) -> Self {
        Self {
            width,
            compression_threshold,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(20, Some(0.7))
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn normalize(&self, book: &SplitBook) -> Result<NormalizedLevels, DimensionError> {
        let mut levels = NormalizedLevels {
            ask: fit_width(&book.ask_volumes, self.width),
            bid: fit_width(&book.bid_volumes, self.width),
            ask_labels: fit_width(&book.ask_prices, self.width),
            bid_labels: fit_width(&book.bid_prices, self.width),
            compressed: false,
        };

        if let Some(threshold) = self.compression_threshold {
            if levels.occupancy() < threshold {
                levels.compress();
            }
        }

        levels.ensure_width(self.width)?;
        Ok(levels)
    }
}
