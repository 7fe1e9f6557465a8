//! Budget policy and cost table configuration.

use serde::{Deserialize, Serialize};

use super::strategy::RejectionStrategy;
use crate::backend::{Complexity, MediaKind};

/// Base cost of one operation of each media kind, in the session currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostTable {
    pub text: f64,
    pub image: f64,
    pub video: f64,
    pub audio: f64,
}

impl Default for CostTable {
    fn default() -> Self {
        Self {
            text: 0.01,
            image: 0.04,
            video: 0.50,
            audio: 0.015,
        }
    }
}

impl CostTable {
    pub fn base_cost(&self, kind: MediaKind) -> f64 {
        match kind {
            MediaKind::Text => self.text,
            MediaKind::Image => self.image,
            MediaKind::Video => self.video,
            MediaKind::Audio => self.audio,
        }
    }

    /// Set the base cost for one kind.
    pub fn with_cost(mut self, kind: MediaKind, cost: f64) -> Self {
        let slot = match kind {
            MediaKind::Text => &mut self.text,
            MediaKind::Image => &mut self.image,
            MediaKind::Video => &mut self.video,
            MediaKind::Audio => &mut self.audio,
        };
        *slot = cost.max(0.0);
        self
    }
}

/// Cost multiplier for each complexity tier.
pub fn complexity_multiplier(complexity: Complexity) -> f64 {
    match complexity {
        Complexity::Low => 0.5,
        Complexity::Medium => 1.0,
        Complexity::High => 2.0,
    }
}

/// Session budget policy. Read-only once the session starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetPolicy {
    /// Spend ceiling that may only be crossed with approval.
    pub limit: f64,

    /// Fraction of `limit` at which a warning is emitted (0.0 - 1.0)
    pub warning_threshold: f64,

    /// Fraction of `limit` reported as critical (0.0 - 1.0)
    pub critical_threshold: f64,

    /// Backend request quota for the session, if the provider imposes one.
    pub request_quota: Option<u64>,

    /// What to do with an operation whose overrun was not approved.
    pub on_rejection: RejectionStrategy,

    pub costs: CostTable,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            limit: 10.0,
            warning_threshold: 0.7,  // Warn at 70%
            critical_threshold: 0.9, // Critical at 90%
            request_quota: None,
            on_rejection: RejectionStrategy::Skip,
            costs: CostTable::default(),
        }
    }
}

impl BudgetPolicy {
    pub fn new(limit: f64) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// Set the warning threshold.
    pub fn with_warning_threshold(mut self, threshold: f64) -> Self {
        self.warning_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Set the critical threshold.
    pub fn with_critical_threshold(mut self, threshold: f64) -> Self {
        self.critical_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_request_quota(mut self, quota: u64) -> Self {
        self.request_quota = Some(quota);
        self
    }

    pub fn with_rejection_strategy(mut self, strategy: RejectionStrategy) -> Self {
        self.on_rejection = strategy;
        self
    }

    pub fn with_costs(mut self, costs: CostTable) -> Self {
        self.costs = costs;
        self
    }

    /// Spend at which the warning threshold is crossed.
    pub fn warning_amount(&self) -> f64 {
        self.limit * self.warning_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = BudgetPolicy::default();
        assert_eq!(policy.limit, 10.0);
        assert_eq!(policy.warning_threshold, 0.7);
        assert_eq!(policy.on_rejection, RejectionStrategy::Skip);
        assert!((policy.warning_amount() - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_builder_clamps_thresholds() {
        let policy = BudgetPolicy::new(50.0)
            .with_warning_threshold(1.4)
            .with_critical_threshold(-0.2);
        assert_eq!(policy.warning_threshold, 1.0);
        assert_eq!(policy.critical_threshold, 0.0);
    }

    #[test]
    fn test_cost_table_lookup() {
        let table = CostTable::default().with_cost(MediaKind::Image, 0.08);
        assert_eq!(table.base_cost(MediaKind::Image), 0.08);
        assert_eq!(table.base_cost(MediaKind::Video), 0.50);
    }

    #[test]
    fn test_multipliers() {
        assert_eq!(complexity_multiplier(Complexity::Low), 0.5);
        assert_eq!(complexity_multiplier(Complexity::Medium), 1.0);
        assert_eq!(complexity_multiplier(Complexity::High), 2.0);
    }

    #[test]
    fn test_policy_deserializes_partial_toml() {
        let policy: BudgetPolicy = toml::from_str("limit = 25.0\non_rejection = \"degrade\"").unwrap();
        assert_eq!(policy.limit, 25.0);
        assert_eq!(policy.on_rejection, RejectionStrategy::Degrade);
        assert_eq!(policy.critical_threshold, 0.9);
    }
}
