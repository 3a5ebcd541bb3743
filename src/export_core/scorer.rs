//! Urgency and liquidity calculators
//!
//! Pure functions over the epsilon domain. Inputs are volume vectors addressed by
//! depth rank; no price is read here.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::record::{EnergyCluster, Liquidity, TradeFlow, UrgencyOut};

/// Lower bound on passive volume so an empty best level never divides by zero
pub const POTENTIAL_FLOOR: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombineMode {
    #[default]
    Max,
    Mean,
    Geomean,
}

impl CombineMode {
    pub fn combine(&self, u_buy: f64, u_sell: f64) -> f64 {
        match self {
            CombineMode::Max => u_buy.max(u_sell),
            CombineMode::Mean => 0.5 * (u_buy + u_sell),
            CombineMode::Geomean => (u_buy * u_sell).sqrt(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown combine mode '{0}' (expected max, mean or geomean)")]
pub struct ParseCombineModeError(pub String);

impl FromStr for CombineMode {
    type Err = ParseCombineModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "max" => Ok(CombineMode::Max),
            "mean" => Ok(CombineMode::Mean),
            "geomean" => Ok(CombineMode::Geomean),
            other => Err(ParseCombineModeError(other.to_string())),
        }
    }
}

impl fmt::Display for CombineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CombineMode::Max => write!(f, "max"),
            CombineMode::Mean => write!(f, "mean"),
            CombineMode::Geomean => write!(f, "geomean"),
        }
    }
}

pub struct UrgencyScorer {
    mode: CombineMode,
    class_edges: Vec<f64>,
}

impl UrgencyScorer {
    pub fn new(mode: CombineMode) -> Self {
        Self {
            mode,
            class_edges: Vec::new(),
        }
    }

    /// Bucket the ratio against ascending edges; empty edges leave `class` unset
    pub fn with_class_edges(mut self, edges: Vec<f64>) -> Self {
        self.class_edges = edges;
        self
    }

    pub fn mode(&self) -> CombineMode {
        self.mode
    }

    /// Compute urgency of realized flow against passive volume at the best rank
    ///
    /// # Returns
    /// `u_buy`/`u_sell` unbounded, `ratio` combined per mode and clamped to [0, 1]
    pub fn urgency(&self, cluster: &EnergyCluster, trades: &TradeFlow) -> UrgencyOut {
        let pot_buy = level_at(&cluster.ask_per_level, cluster.best_ask_index).max(POTENTIAL_FLOOR);
        let pot_sell = level_at(&cluster.bid_per_level, cluster.best_bid_index).max(POTENTIAL_FLOOR);

        let u_buy = trades.realized_buy.max(0.0) / pot_buy;
        let u_sell = trades.realized_sell.max(0.0) / pot_sell;
        let ratio = self.mode.combine(u_buy, u_sell).clamp(0.0, 1.0);

        UrgencyOut {
            u_buy,
            u_sell,
            ratio,
            class: self.classify(ratio),
        }
    }

    pub fn classify(&self, ratio: f64) -> Option<usize> {
        if self.class_edges.is_empty() {
            return None;
        }
        Some(self.class_edges.iter().take_while(|edge| ratio >= **edge).count())
    }
}

/// Book imbalance in [-1, 1], positive when bids outweigh asks
pub fn liquidity(cluster: &EnergyCluster) -> Liquidity {
    let sum_ask = cluster.ask_total();
    let sum_bid = cluster.bid_total();
    let denom = sum_bid + sum_ask;

    let book_imbalance = if denom > 0.0 {
        (sum_bid - sum_ask) / denom
    } else {
        0.0
    };

    Liquidity {
        book_imbalance,
        depth: cluster.num_levels,
    }
}

/// Volume at `index`, clamped into the vector; empty vectors read as zero
fn level_at(levels: &[f64], index: usize) -> f64 {
    let clamped = index.min(levels.len().saturating_sub(1));
    levels.get(clamped).copied().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ladder() -> EnergyCluster {
        EnergyCluster::new(0, 3, vec![1.0, 2.0, 3.0, 4.0], vec![4.0, 3.0, 2.0, 1.0])
    }

    #[test]
    fn test_concrete_scenario() {
        let scorer = UrgencyScorer::new(CombineMode::Max);
        let out = scorer.urgency(&ladder(), &TradeFlow::new(0.5, 0.5));

        assert_eq!(out.u_buy, 0.5);
        assert_eq!(out.u_sell, 0.5);
        assert_eq!(out.ratio, 0.5);
        assert_eq!(out.class, None);
    }

    #[test]
    fn test_combine_modes() {
        assert_eq!(CombineMode::Max.combine(0.2, 0.8), 0.8);
        assert_eq!(CombineMode::Mean.combine(0.2, 0.8), 0.5);
        assert!((CombineMode::Geomean.combine(0.2, 0.8) - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_ratio_clamped_to_unit_interval() {
        let scorer = UrgencyScorer::new(CombineMode::Max);
        let out = scorer.urgency(&ladder(), &TradeFlow::new(50.0, 0.0));

        assert_eq!(out.u_buy, 50.0);
        assert_eq!(out.ratio, 1.0);
    }

    #[test]
    fn test_empty_best_level_uses_floor() {
        let cluster = EnergyCluster::new(0, 0, vec![0.0, 1.0], vec![0.0, 1.0]);
        let scorer = UrgencyScorer::new(CombineMode::Mean);
        let out = scorer.urgency(&cluster, &TradeFlow::new(0.0, 0.0));

        assert_eq!(out.u_buy, 0.0);
        assert!(out.u_buy.is_finite());
        assert!(scorer.urgency(&cluster, &TradeFlow::new(1.0, 0.0)).u_buy.is_finite());
    }

    #[test]
    fn test_out_of_range_index_clamped() {
        let cluster = EnergyCluster::new(9, 9, vec![1.0, 2.0], vec![1.0, 4.0]);
        let out = UrgencyScorer::new(CombineMode::Max).urgency(&cluster, &TradeFlow::new(1.0, 1.0));

        assert_eq!(out.u_buy, 0.5);
        assert_eq!(out.u_sell, 0.25);
    }

    #[test]
    fn test_class_buckets() {
        let scorer = UrgencyScorer::new(CombineMode::Max).with_class_edges(vec![0.25, 0.5, 0.75]);

        assert_eq!(scorer.classify(0.1), Some(0));
        assert_eq!(scorer.classify(0.25), Some(1));
        assert_eq!(scorer.classify(0.6), Some(2));
        assert_eq!(scorer.classify(1.0), Some(3));
    }

    #[test]
    fn test_parse_combine_mode() {
        assert_eq!("GeoMean".parse::<CombineMode>().unwrap(), CombineMode::Geomean);
        assert_eq!(" max ".parse::<CombineMode>().unwrap(), CombineMode::Max);
        assert!("median".parse::<CombineMode>().is_err());
    }

    #[test]
    fn test_liquidity_imbalance() {
        let cluster = EnergyCluster::new(0, 0, vec![1.0, 1.0], vec![3.0, 3.0]);
        let liq = liquidity(&cluster);

        assert_eq!(liq.book_imbalance, 0.5);
        assert_eq!(liq.depth, 2);
    }

    #[test]
    fn test_liquidity_empty_book() {
        let liq = liquidity(&EnergyCluster::unavailable(20));
        assert_eq!(liq.book_imbalance, 0.0);
        assert_eq!(liq.depth, 20);
    }

    proptest! {
        #[test]
        fn prop_more_buying_never_lowers_u_buy(
            ask in prop::collection::vec(0.0f64..100.0, 1..20),
            base in 0.0f64..50.0,
            extra in 0.0f64..50.0,
        ) {
            let cluster = EnergyCluster::new(0, 0, ask.clone(), ask);
            let scorer = UrgencyScorer::new(CombineMode::Max);
            let low = scorer.urgency(&cluster, &TradeFlow::new(base, 1.0));
            let high = scorer.urgency(&cluster, &TradeFlow::new(base + extra, 1.0));
            prop_assert!(high.u_buy >= low.u_buy);
        }

        #[test]
        fn prop_imbalance_bounded(
            ask in prop::collection::vec(0.0f64..100.0, 1..20),
            bid in prop::collection::vec(0.0f64..100.0, 1..20),
        ) {
            let width = ask.len().min(bid.len());
            let cluster = EnergyCluster::new(0, 0, ask[..width].to_vec(), bid[..width].to_vec());
            let liq = liquidity(&cluster);
            prop_assert!((-1.0..=1.0).contains(&liq.book_imbalance));
        }
    }
}
