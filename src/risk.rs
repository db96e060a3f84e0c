//! Contention risk and acquisition ordering
//!
//! A [`RiskAdvisor`] turns a feature vector into a probability that a request
//! will run into contention. The score only ever changes the order in which a
//! multi-resource transaction asks for its locks; grant/deny stays with the
//! lock table.

use serde::{Deserialize, Serialize};

use crate::core_types::ResourceKey;

/// Score at or above which the canonical order is reversed
pub const DEFAULT_REORDER_THRESHOLD: f64 = 0.8;

/// Balance below which a source account counts as a hotspot
pub const HOTSPOT_BALANCE: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskFeatures {
    /// Overall system load in [0, 1]
    pub system_load: f64,
    /// Outgoing wait edges of the requesting transaction
    pub wait_depth: usize,
    /// Transfer amount
    pub amount: f64,
    /// Source account is running low
    pub hotspot: bool,
}

impl RiskFeatures {
    pub fn new(system_load: f64, wait_depth: usize, amount: f64, hotspot: bool) -> Self {
        Self {
            system_load,
            wait_depth,
            amount,
            hotspot,
        }
    }

    /// Features for a transfer out of an account holding `source_balance`
    pub fn for_transfer(
        system_load: f64,
        wait_depth: usize,
        amount: f64,
        source_balance: f64,
    ) -> Self {
        Self::new(
            system_load,
            wait_depth,
            amount,
            source_balance < HOTSPOT_BALANCE,
        )
    }
}

/// Pure scoring function, no state retained between calls
pub trait RiskAdvisor: Send + Sync {
    /// Contention probability in [0, 1]
    fn score(&self, features: &RiskFeatures) -> f64;
}

/// Fixed-weight logistic model over the four features.
///
/// Amount enters as `ln(1 + amount)` so large transfers saturate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogisticRiskAdvisor {
    pub bias: f64,
    pub w_load: f64,
    pub w_wait_depth: f64,
    pub w_log_amount: f64,
    pub w_hotspot: f64,
}

impl Default for LogisticRiskAdvisor {
    fn default() -> Self {
        // Separates low-load small transfers (~0.1) from loaded hot ones (>0.95)
        Self {
            bias: -6.0,
            w_load: 2.0,
            w_wait_depth: 0.5,
            w_log_amount: 0.6,
            w_hotspot: 1.5,
        }
    }
}

impl RiskAdvisor for LogisticRiskAdvisor {
    fn score(&self, features: &RiskFeatures) -> f64 {
        let z = self.bias
            + self.w_load * features.system_load
            + self.w_wait_depth * features.wait_depth as f64
            + self.w_log_amount * features.amount.max(0.0).ln_1p()
            + self.w_hotspot * if features.hotspot { 1.0 } else { 0.0 };
        clamp_probability(1.0 / (1.0 + (-z).exp()))
    }
}

/// Always returns the same score
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedRiskAdvisor(pub f64);

impl RiskAdvisor for FixedRiskAdvisor {
    fn score(&self, _features: &RiskFeatures) -> f64 {
        clamp_probability(self.0)
    }
}

#[inline]
fn clamp_probability(p: f64) -> f64 {
    if p.is_nan() { 0.0 } else { p.clamp(0.0, 1.0) }
}

/// Order in which a transaction will request its resources
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcquisitionPlan {
    pub order: Vec<ResourceKey>,
    pub risk: f64,
    /// `reorder` mitigation applied
    pub reordered: bool,
}

impl AcquisitionPlan {
    /// Ascending `(resource_type, resource_id)` order, duplicates removed
    pub fn canonical(keys: impl IntoIterator<Item = ResourceKey>) -> Vec<ResourceKey> {
        let mut order: Vec<ResourceKey> = keys.into_iter().collect();
        order.sort();
        order.dedup();
        order
    }

    /// Canonical order, reversed when `risk >= threshold`
    pub fn new(keys: impl IntoIterator<Item = ResourceKey>, risk: f64, threshold: f64) -> Self {
        let mut order = Self::canonical(keys);
        let reordered = risk >= threshold;
        if reordered {
            order.reverse();
        }
        Self {
            order,
            risk,
            reordered,
        }
    }

    /// Score `features` with `advisor` and plan accordingly
    pub fn advise(
        keys: impl IntoIterator<Item = ResourceKey>,
        advisor: &dyn RiskAdvisor,
        features: &RiskFeatures,
        threshold: f64,
    ) -> Self {
        Self::new(keys, advisor.score(features), threshold)
    }

    pub fn mitigation(&self) -> Option<&'static str> {
        self.reordered.then_some("reorder")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accounts() -> Vec<ResourceKey> {
        vec![ResourceKey::account("2"), ResourceKey::account("1")]
    }

    #[test]
    fn test_low_risk_keeps_canonical_order() {
        let plan = AcquisitionPlan::new(accounts(), 0.79, DEFAULT_REORDER_THRESHOLD);
        assert_eq!(
            plan.order,
            vec![ResourceKey::account("1"), ResourceKey::account("2")]
        );
        assert!(!plan.reordered);
        assert_eq!(plan.mitigation(), None);
    }

    #[test]
    fn test_high_risk_reverses_order() {
        let plan = AcquisitionPlan::new(accounts(), 0.8, DEFAULT_REORDER_THRESHOLD);
        assert_eq!(
            plan.order,
            vec![ResourceKey::account("2"), ResourceKey::account("1")]
        );
        assert_eq!(plan.mitigation(), Some("reorder"));
    }

    #[test]
    fn test_canonical_dedupes() {
        let order = AcquisitionPlan::canonical(vec![
            ResourceKey::account("b"),
            ResourceKey::account("a"),
            ResourceKey::account("b"),
        ]);
        assert_eq!(
            order,
            vec![ResourceKey::account("a"), ResourceKey::account("b")]
        );
    }

    #[test]
    fn test_logistic_separates_training_points() {
        let advisor = LogisticRiskAdvisor::default();
        let safe = [
            RiskFeatures::new(0.1, 1, 100.0, false),
            RiskFeatures::new(0.2, 1, 200.0, false),
        ];
        let risky = [
            RiskFeatures::new(0.9, 3, 5000.0, true),
            RiskFeatures::new(0.8, 4, 10000.0, true),
        ];

        for f in &safe {
            assert!(advisor.score(f) < 0.5, "{:?} scored {}", f, advisor.score(f));
        }
        for f in &risky {
            assert!(advisor.score(f) >= DEFAULT_REORDER_THRESHOLD);
        }
    }

    #[test]
    fn test_scores_stay_in_unit_interval() {
        let advisor = LogisticRiskAdvisor::default();
        let extreme = RiskFeatures::new(1e9, usize::MAX, f64::MAX, true);
        let score = advisor.score(&extreme);
        assert!((0.0..=1.0).contains(&score));

        assert_eq!(FixedRiskAdvisor(1.7).score(&extreme), 1.0);
        assert_eq!(FixedRiskAdvisor(f64::NAN).score(&extreme), 0.0);
    }

    #[test]
    fn test_hotspot_from_balance() {
        assert!(RiskFeatures::for_transfer(0.6, 0, 10.0, 999.0).hotspot);
        assert!(!RiskFeatures::for_transfer(0.6, 0, 10.0, 1000.0).hotspot);
    }

    #[test]
    fn test_advise_uses_advisor_score() {
        let features = RiskFeatures::new(0.6, 0, 100.0, false);
        let plan = AcquisitionPlan::advise(
            accounts(),
            &FixedRiskAdvisor(0.95),
            &features,
            DEFAULT_REORDER_THRESHOLD,
        );
        assert!(plan.reordered);
        assert_eq!(plan.risk, 0.95);
    }
}
