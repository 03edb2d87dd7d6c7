//! Adaptive budget recalculation
//!
//! The effective ceiling moves away from the configured amount according to
//! a pressure signal in [-1, 1]:
//!
//! - utilization below target pushes up, above target pushes down
//! - a best-known experiment variant that is cheaper than its peers, or
//!   faster than the latency threshold, amplifies loosening and damps
//!   tightening; an expensive or slow variant does the opposite
//!
//! Experiment signals only scale the utilization signal, they never flip its
//! sign. That keeps the ceiling monotonically non-increasing in usage and
//! guarantees an unused budget never shrinks.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use super::types::{FinOpsABExperiment, FinOpsAdaptiveBudget, FinOpsBudget, FinOpsVariant};
use crate::routing::Lane;

/// Cost and latency signals distilled from one lane's experiments
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExperimentSignal {
    /// Best variant's cost per request
    pub best_cost: f64,
    /// Mean cost per request across the experiment's variants
    pub mean_cost: f64,
    /// Best variant's p95 latency
    pub best_latency_ms: f64,
}

impl ExperimentSignal {
    /// Positive when the best variant undercuts its peers
    pub fn cost_signal(&self) -> f64 {
        if self.mean_cost <= 0.0 {
            return 0.0;
        }
        ((self.mean_cost - self.best_cost) / self.mean_cost).clamp(-1.0, 1.0)
    }

    /// Positive when the best variant is under the latency threshold
    pub fn latency_signal(&self, threshold_ms: f64) -> f64 {
        if threshold_ms <= 0.0 {
            return 0.0;
        }
        ((threshold_ms - self.best_latency_ms) / threshold_ms).clamp(-1.0, 1.0)
    }
}

/// Experiments indexed by lane, filtered to a lookback window on demand
#[derive(Debug, Clone, Default)]
pub struct ExperimentIndex {
    by_lane: HashMap<Lane, Vec<FinOpsABExperiment>>,
    as_of: DateTime<Utc>,
}

impl ExperimentIndex {
    /// Index experiments, preserving declaration order within each lane
    pub fn new(experiments: &[FinOpsABExperiment], as_of: DateTime<Utc>) -> Self {
        let mut by_lane: HashMap<Lane, Vec<FinOpsABExperiment>> = HashMap::new();
        for experiment in experiments {
            by_lane
                .entry(experiment.lane)
                .or_default()
                .push(experiment.clone());
        }
        Self { by_lane, as_of }
    }

    /// Best-known variant and its experiment's mean cost for a lane
    ///
    /// Experiments concluded before the lookback window are ignored. The
    /// last experiment in declaration order that yields a variant wins.
    pub fn signal(&self, lane: Lane, lookback_days: u32) -> Option<ExperimentSignal> {
        let cutoff = self.as_of - Duration::days(i64::from(lookback_days));
        self.by_lane
            .get(&lane)?
            .iter()
            .filter(|e| e.concluded_at.is_none_or(|at| at >= cutoff))
            .filter_map(|e| {
                let best = best_variant(&e.variants)?;
                let mean_cost =
                    e.variants.iter().map(|v| v.cost_per_request).sum::<f64>() / e.variants.len() as f64;
                Some(ExperimentSignal {
                    best_cost: best.cost_per_request,
                    mean_cost,
                    best_latency_ms: best.latency_p95_ms,
                })
            })
            .last()
    }

    /// Best variant's cost per request for a lane, used as a call estimate
    pub fn best_cost(&self, lane: Lane, lookback_days: u32) -> Option<f64> {
        self.signal(lane, lookback_days).map(|s| s.best_cost)
    }
}

/// The winning variant, or the cheapest (then fastest) when none won
///
/// With several winners the last declared one is used.
pub fn best_variant(variants: &[FinOpsVariant]) -> Option<&FinOpsVariant> {
    if let Some(winner) = variants.iter().rev().find(|v| v.is_winner) {
        return Some(winner);
    }
    variants.iter().reduce(|best, v| {
        let cheaper = v.cost_per_request < best.cost_per_request;
        let same_cost_faster =
            v.cost_per_request == best.cost_per_request && v.latency_p95_ms < best.latency_p95_ms;
        if cheaper || same_cost_faster { v } else { best }
    })
}

/// Effective ceiling for a budget given the usage already recorded
pub fn effective_amount(budget: &FinOpsBudget, usage: f64, signal: Option<ExperimentSignal>) -> f64 {
    match &budget.adaptive {
        Some(policy) if policy.enabled => adjust(budget.amount, policy, usage, signal),
        _ => budget.amount,
    }
}

fn adjust(
    amount: f64,
    policy: &FinOpsAdaptiveBudget,
    usage: f64,
    signal: Option<ExperimentSignal>,
) -> f64 {
    let utilization = if amount > 0.0 { usage.max(0.0) / amount } else { 1.0 };
    let target = policy.target_utilization;
    let utilization_signal = ((target - utilization) / target).clamp(-1.0, 1.0);

    let experiment_signal = signal
        .map(|s| {
            policy.cost_weight * s.cost_signal()
                + policy.latency_weight * s.latency_signal(policy.latency_threshold_ms)
        })
        .unwrap_or(0.0);

    let pressure = if utilization_signal >= 0.0 {
        utilization_signal * (1.0 + experiment_signal).clamp(0.0, 2.0)
    } else {
        utilization_signal * (1.0 - experiment_signal).clamp(0.0, 2.0)
    };

    let max_increase = policy.max_increase_pct / 100.0;
    let max_decrease = policy.max_decrease_pct / 100.0;
    let adjustment = if pressure >= 0.0 {
        pressure * max_increase
    } else {
        pressure * max_decrease
    }
    .max(-max_decrease)
    .min(max_increase);

    let lower = policy.min_amount;
    let upper = policy.max_amount.max(lower);
    let adjusted = amount * (1.0 + adjustment);
    if !(lower.is_finite() && upper.is_finite() && adjusted.is_finite()) {
        return amount;
    }
    adjusted.clamp(lower, upper)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget() -> FinOpsBudget {
        FinOpsBudget::new(100.0).with_adaptive(FinOpsAdaptiveBudget::new(0.6, 50.0, 150.0))
    }

    #[test]
    fn test_non_finite_policy_falls_back_to_amount() {
        let mut budget = budget();
        if let Some(policy) = budget.adaptive.as_mut() {
            policy.min_amount = f64::NAN;
        }
        assert_eq!(effective_amount(&budget, 0.0, None), 100.0);
        assert_eq!(effective_amount(&budget, 90.0, None), 100.0);

        if let Some(policy) = budget.adaptive.as_mut() {
            policy.min_amount = 50.0;
            policy.target_utilization = f64::NAN;
        }
        assert_eq!(effective_amount(&budget, 10.0, None), 100.0);
    }

    #[test]
    fn test_static_budget_unchanged() {
        let budget = FinOpsBudget::new(42.0);
        assert_eq!(effective_amount(&budget, 0.0, None), 42.0);
        assert_eq!(effective_amount(&budget, 1000.0, None), 42.0);
    }

    #[test]
    fn test_disabled_policy_unchanged() {
        let mut budget = budget();
        if let Some(policy) = budget.adaptive.as_mut() {
            policy.enabled = false;
        }
        assert_eq!(effective_amount(&budget, 0.0, None), 100.0);
    }

    #[test]
    fn test_low_usage_loosens_high_usage_tightens() {
        let budget = budget();
        assert!(effective_amount(&budget, 0.0, None) >= 100.0);
        assert!(effective_amount(&budget, 90.0, None) <= 100.0);
        assert_eq!(effective_amount(&budget, 60.0, None), 100.0);
    }

    #[test]
    fn test_monotone_and_bounded() {
        let budget = budget().with_adaptive(
            FinOpsAdaptiveBudget::new(0.6, 50.0, 150.0)
                .with_steps(100.0, 100.0)
                .with_weights(0.7, 0.4),
        );
        let signal = Some(ExperimentSignal {
            best_cost: 0.01,
            mean_cost: 0.02,
            best_latency_ms: 3000.0,
        });

        let mut previous = f64::INFINITY;
        for step in 0..=400 {
            let usage = step as f64 * 0.5;
            let amount = effective_amount(&budget, usage, signal);
            assert!(amount <= previous + 1e-12, "not monotone at usage {}", usage);
            assert!((50.0..=150.0).contains(&amount), "out of bounds: {}", amount);
            previous = amount;
        }
    }

    #[test]
    fn test_cheap_winner_amplifies_loosening() {
        let budget = FinOpsBudget::new(100.0).with_adaptive(
            FinOpsAdaptiveBudget::new(0.6, 50.0, 150.0)
                .with_steps(20.0, 20.0)
                .with_weights(1.0, 0.0),
        );
        let cheap = Some(ExperimentSignal {
            best_cost: 0.01,
            mean_cost: 0.02,
            best_latency_ms: 500.0,
        });

        let plain = effective_amount(&budget, 30.0, None);
        let boosted = effective_amount(&budget, 30.0, cheap);
        assert!(boosted > plain);
    }

    #[test]
    fn test_best_variant_prefers_last_winner() {
        let variants = vec![
            FinOpsVariant::new("a", 0.4, 0.01, 900.0).winner(),
            FinOpsVariant::new("b", 0.3, 0.05, 800.0).winner(),
            FinOpsVariant::new("c", 0.3, 0.001, 100.0),
        ];
        assert_eq!(best_variant(&variants).map(|v| v.name.as_str()), Some("b"));
    }

    #[test]
    fn test_best_variant_cheapest_then_fastest() {
        let variants = vec![
            FinOpsVariant::new("a", 0.4, 0.02, 900.0),
            FinOpsVariant::new("b", 0.3, 0.01, 800.0),
            FinOpsVariant::new("c", 0.3, 0.01, 600.0),
        ];
        assert_eq!(best_variant(&variants).map(|v| v.name.as_str()), Some("c"));
    }

    #[test]
    fn test_index_respects_lookback() {
        let now = Utc::now();
        let old = FinOpsABExperiment {
            id: "old".to_string(),
            lane: Lane::Balanced,
            concluded_at: Some(now - Duration::days(90)),
            variants: vec![FinOpsVariant::new("x", 1.0, 0.5, 100.0)],
        };
        let recent = FinOpsABExperiment {
            id: "recent".to_string(),
            lane: Lane::Balanced,
            concluded_at: Some(now - Duration::days(2)),
            variants: vec![FinOpsVariant::new("y", 1.0, 0.2, 100.0)],
        };

        let index = ExperimentIndex::new(&[recent.clone(), old.clone()], now);
        assert_eq!(index.best_cost(Lane::Balanced, 30), Some(0.2));
        assert_eq!(index.best_cost(Lane::Balanced, 365), Some(0.5));
        assert_eq!(index.best_cost(Lane::Economy, 365), None);
    }
}
