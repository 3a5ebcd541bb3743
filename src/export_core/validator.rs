//! Conservation and shape checks, folded into record signatures

use super::record::{EnergyCluster, MifCompliance, Signatures, TradeFlow};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConservationCheck {
    pub ok: bool,
    pub delta_ask: f64,
    pub delta_bid: f64,
}

pub struct EnergyValidator {
    epsilon: f64,
}

impl EnergyValidator {
    pub fn new(epsilon: f64) -> Self {
        Self { epsilon }
    }

    pub fn with_defaults() -> Self {
        Self::new(1e-2)
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Realized flow against total resting volume on each side, within epsilon
    pub fn conservation(&self, cluster: &EnergyCluster, trades: &TradeFlow) -> ConservationCheck {
        let delta_ask = (cluster.ask_total() - trades.realized_buy).abs();
        let delta_bid = (cluster.bid_total() - trades.realized_sell).abs();

        ConservationCheck {
            ok: delta_ask <= self.epsilon && delta_bid <= self.epsilon,
            delta_ask,
            delta_bid,
        }
    }

    /// Structural only: both vectors have `num_levels` entries
    pub fn levels_consistent(cluster: &EnergyCluster) -> bool {
        cluster.ask_per_level.len() == cluster.num_levels
            && cluster.bid_per_level.len() == cluster.num_levels
    }

    /// Build signatures for a record. Never a gate: `partial` bars are still emitted.
    pub fn signatures(&self, cluster: &EnergyCluster, trades: &TradeFlow) -> (Signatures, ConservationCheck) {
        let check = self.conservation(cluster, trades);
        let mif_compliance = if check.ok && cluster.is_available() {
            MifCompliance::Full
        } else {
            MifCompliance::Partial
        };

        let signatures = Signatures {
            energy_conservation_ok: check.ok,
            levels_sorted_ok: Self::levels_consistent(cluster),
            mif_compliance,
        };
        (signatures, check)
    }
}
