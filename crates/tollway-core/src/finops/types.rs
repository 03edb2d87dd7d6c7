//! FinOps data model: budgets, experiments, requests and decisions

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::routing::{Lane, RouteCandidate};

/// Session id used when a request carries none
pub const GLOBAL_SESSION: &str = "global";

/// Static budget ceiling for a tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinOpsBudget {
    /// Configured ceiling for one budget period
    pub amount: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    /// Recalculation policy; the ceiling is static when absent or disabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptive: Option<FinOpsAdaptiveBudget>,
    /// Per-call estimate used when a request does not carry one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_estimate: Option<f64>,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl FinOpsBudget {
    /// Create a static budget in USD
    pub fn new(amount: f64) -> Self {
        Self {
            amount,
            currency: default_currency(),
            adaptive: None,
            default_estimate: None,
        }
    }

    /// Attach an adaptive policy
    pub fn with_adaptive(mut self, adaptive: FinOpsAdaptiveBudget) -> Self {
        self.adaptive = Some(adaptive);
        self
    }

    /// Set the per-call default estimate
    pub fn with_default_estimate(mut self, estimate: f64) -> Self {
        self.default_estimate = Some(estimate);
        self
    }

    /// Whether the ceiling is recalculated from usage
    pub fn is_adaptive(&self) -> bool {
        self.adaptive.as_ref().is_some_and(|a| a.enabled)
    }

    pub fn validate(&self, tier: Lane) -> Result<()> {
        if !(self.amount.is_finite() && self.amount > 0.0) {
            return Err(Error::ValidationError(format!(
                "budget for tier '{}' must have a positive amount (got {})",
                tier, self.amount
            )));
        }
        if let Some(estimate) = self.default_estimate
            && !(estimate.is_finite() && estimate >= 0.0)
        {
            return Err(Error::ValidationError(format!(
                "default_estimate for tier '{}' must be >= 0",
                tier
            )));
        }
        if let Some(adaptive) = &self.adaptive {
            adaptive.validate(tier)?;
        }
        Ok(())
    }
}

/// Policy for recalculating a tier's ceiling
///
/// Step sizes are percentages (`20.0` means at most 20% per recalculation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinOpsAdaptiveBudget {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub target_utilization: f64,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    pub max_increase_pct: f64,
    pub max_decrease_pct: f64,
    #[serde(default)]
    pub cost_weight: f64,
    #[serde(default)]
    pub latency_weight: f64,
    #[serde(default = "default_latency_threshold")]
    pub latency_threshold_ms: f64,
    pub min_amount: f64,
    pub max_amount: f64,
}

fn default_true() -> bool {
    true
}

fn default_lookback_days() -> u32 {
    30
}

fn default_latency_threshold() -> f64 {
    2000.0
}

impl FinOpsAdaptiveBudget {
    /// Enabled policy with no experiment weighting
    pub fn new(target_utilization: f64, min_amount: f64, max_amount: f64) -> Self {
        Self {
            enabled: true,
            target_utilization,
            lookback_days: default_lookback_days(),
            max_increase_pct: 50.0,
            max_decrease_pct: 50.0,
            cost_weight: 0.0,
            latency_weight: 0.0,
            latency_threshold_ms: default_latency_threshold(),
            min_amount,
            max_amount,
        }
    }

    pub fn with_steps(mut self, max_increase_pct: f64, max_decrease_pct: f64) -> Self {
        self.max_increase_pct = max_increase_pct;
        self.max_decrease_pct = max_decrease_pct;
        self
    }

    pub fn with_weights(mut self, cost_weight: f64, latency_weight: f64) -> Self {
        self.cost_weight = cost_weight;
        self.latency_weight = latency_weight;
        self
    }

    pub fn with_latency_threshold(mut self, latency_threshold_ms: f64) -> Self {
        self.latency_threshold_ms = latency_threshold_ms;
        self
    }

    pub fn validate(&self, tier: Lane) -> Result<()> {
        let fail = |msg: String| Err(Error::ValidationError(format!("tier '{}': {}", tier, msg)));

        if !(self.target_utilization > 0.0 && self.target_utilization < 1.0) {
            return fail(format!(
                "target_utilization must be in (0, 1), got {}",
                self.target_utilization
            ));
        }
        if !(self.min_amount.is_finite() && self.max_amount.is_finite())
            || self.min_amount < 0.0
            || self.min_amount > self.max_amount
        {
            return fail(format!(
                "adaptive bounds must satisfy 0 <= min_amount <= max_amount, got [{}, {}]",
                self.min_amount, self.max_amount
            ));
        }
        for (name, pct) in [
            ("max_increase_pct", self.max_increase_pct),
            ("max_decrease_pct", self.max_decrease_pct),
        ] {
            if !(0.0..=100.0).contains(&pct) {
                return fail(format!("{} must be in [0, 100], got {}", name, pct));
            }
        }
        if !(self.cost_weight.is_finite() && self.cost_weight >= 0.0)
            || !(self.latency_weight.is_finite() && self.latency_weight >= 0.0)
        {
            return fail("cost_weight and latency_weight must be finite and >= 0".to_string());
        }
        if !(self.latency_threshold_ms.is_finite() && self.latency_threshold_ms > 0.0) {
            return fail("latency_threshold_ms must be > 0".to_string());
        }
        Ok(())
    }
}

/// One arm of an A/B experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinOpsVariant {
    pub name: String,
    /// Fraction of experiment traffic (0.0 to 1.0)
    pub traffic_pct: f64,
    pub cost_per_request: f64,
    pub latency_p95_ms: f64,
    #[serde(default)]
    pub is_winner: bool,
}

impl FinOpsVariant {
    pub fn new(name: impl Into<String>, traffic_pct: f64, cost_per_request: f64, latency_p95_ms: f64) -> Self {
        Self {
            name: name.into(),
            traffic_pct,
            cost_per_request,
            latency_p95_ms,
            is_winner: false,
        }
    }

    pub fn winner(mut self) -> Self {
        self.is_winner = true;
        self
    }
}

/// Historical A/B comparison for a lane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinOpsABExperiment {
    pub id: String,
    pub lane: Lane,
    /// Completion time; experiments without one are always in the lookback window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concluded_at: Option<DateTime<Utc>>,
    pub variants: Vec<FinOpsVariant>,
}

impl FinOpsABExperiment {
    pub fn validate(&self) -> Result<()> {
        if self.variants.is_empty() {
            return Err(Error::ValidationError(format!(
                "experiment '{}' has no variants",
                self.id
            )));
        }
        let total: f64 = self.variants.iter().map(|v| v.traffic_pct).sum();
        if !((total - 1.0).abs() <= 0.01) {
            return Err(Error::ValidationError(format!(
                "experiment '{}' traffic sums to {:.3}, expected 1.0",
                self.id, total
            )));
        }
        if self
            .variants
            .iter()
            .any(|v| !valid_measure(v.cost_per_request) || !valid_measure(v.latency_p95_ms))
        {
            return Err(Error::ValidationError(format!(
                "experiment '{}' has a variant with a negative or non-finite cost or latency",
                self.id
            )));
        }
        Ok(())
    }
}

fn valid_measure(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

/// Utilization alert emitted when a tier crosses a threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    /// Fraction of the effective budget, in (0, 1]
    pub threshold: f64,
    /// Tiers the rule watches; empty means every tier
    #[serde(default)]
    pub tiers: Vec<Lane>,
}

impl AlertRule {
    pub fn applies_to(&self, tier: Lane) -> bool {
        self.tiers.is_empty() || self.tiers.contains(&tier)
    }
}

/// What to do when every candidate tier is over budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DegradationPolicy {
    /// Admit on an alternate tier instead of failing
    Fallback { tier: Lane },
    /// Fail with retry-after guidance
    Throttle { retry_after_secs: u64 },
}

/// Per-call parameters that influence admission
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<f64>,
}

/// A tool execution asking for admission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub tool_name: String,
    /// Tool arguments; must be a JSON object
    pub payload: Value,
    /// Tiers to try, in order of preference
    pub candidate_tiers: Vec<Lane>,
    /// Per-request budgets that take precedence over configured ones
    #[serde(default)]
    pub overrides: BTreeMap<Lane, FinOpsBudget>,
    #[serde(default)]
    pub parameters: ExecutionParameters,
    /// Free-form request metadata; must be a JSON object
    #[serde(default = "empty_object")]
    pub metadata: Value,
    /// Failover route for the routing step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failover_route: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl ExecutionRequest {
    pub fn new(tool_name: impl Into<String>, candidate_tiers: Vec<Lane>) -> Self {
        Self {
            tool_name: tool_name.into(),
            payload: empty_object(),
            candidate_tiers,
            overrides: BTreeMap::new(),
            parameters: ExecutionParameters::default(),
            metadata: empty_object(),
            failover_route: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_estimated_cost(mut self, cost: f64) -> Self {
        self.parameters.estimated_cost = Some(cost);
        self
    }

    pub fn with_override(mut self, tier: Lane, budget: FinOpsBudget) -> Self {
        self.overrides.insert(tier, budget);
        self
    }

    /// Set `metadata.session_id`
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        if let Value::Object(map) = &mut self.metadata {
            map.insert("session_id".to_string(), Value::String(session_id.into()));
        }
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_failover(mut self, route_id: impl Into<String>) -> Self {
        self.failover_route = Some(route_id.into());
        self
    }

    /// Session this request is charged to
    pub fn session_id(&self) -> &str {
        self.metadata
            .get("session_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(GLOBAL_SESSION)
    }

    /// Check the request shape before any budget is touched
    pub fn validate(&self) -> Result<()> {
        if self.tool_name.trim().is_empty() {
            return Err(Error::ValidationError("tool_name must not be empty".to_string()));
        }
        if !self.payload.is_object() {
            return Err(Error::ValidationError(format!(
                "payload for '{}' must be a mapping",
                self.tool_name
            )));
        }
        if !self.metadata.is_object() {
            return Err(Error::ValidationError("metadata must be a mapping".to_string()));
        }
        if self.candidate_tiers.is_empty() {
            return Err(Error::ValidationError(
                "at least one candidate tier is required".to_string(),
            ));
        }
        if let Some(cost) = self.parameters.estimated_cost
            && !(cost.is_finite() && cost >= 0.0)
        {
            return Err(Error::ValidationError(format!(
                "estimated_cost must be a non-negative number, got {}",
                cost
            )));
        }
        for (tier, budget) in &self.overrides {
            budget.validate(*tier)?;
        }
        Ok(())
    }
}

/// Outcome of one admission (and, through the dispatcher, routing) cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionDecision {
    pub tier: Lane,
    pub effective_budget: f64,
    /// Concrete route, filled in by the dispatcher
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteCandidate>,
    pub estimated_cost: f64,
    pub session_id: String,
    /// Admitted through the fallback degradation policy
    #[serde(default)]
    pub degraded: bool,
}

/// Usage and cached ceiling for one session on a tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionBudgetSnapshot {
    pub session_id: String,
    pub usage: f64,
    /// Cached effective ceiling, when one has been evaluated
    pub effective_amount: Option<f64>,
}

/// Budget state for one tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierSnapshot {
    pub tier: Lane,
    pub configured_amount: f64,
    pub currency: String,
    pub adaptive_enabled: bool,
    /// Effective ceiling for a session with no recorded usage
    pub effective_amount: f64,
    pub sessions: Vec<SessionBudgetSnapshot>,
}

/// Point-in-time export of the controller for dashboards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinOpsSnapshot {
    pub tiers: Vec<TierSnapshot>,
    /// Number of (session, tier) pairs with a cached effective ceiling
    pub cache_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_defaults_to_global() {
        let request = ExecutionRequest::new("search", vec![Lane::Economy]);
        assert_eq!(request.session_id(), GLOBAL_SESSION);

        let request = request.with_session("s-1");
        assert_eq!(request.session_id(), "s-1");
    }

    #[test]
    fn test_validate_rejects_non_mapping_payload() {
        let request =
            ExecutionRequest::new("search", vec![Lane::Economy]).with_payload(json!(["a", "b"]));
        assert!(matches!(request.validate(), Err(Error::ValidationError(_))));
    }

    #[test]
    fn test_validate_rejects_empty_tiers() {
        let request = ExecutionRequest::new("search", vec![]);
        assert!(matches!(request.validate(), Err(Error::ValidationError(_))));
    }

    #[test]
    fn test_budget_validation() {
        assert!(FinOpsBudget::new(0.0).validate(Lane::Economy).is_err());
        assert!(FinOpsBudget::new(10.0).validate(Lane::Economy).is_ok());

        let bad_target = FinOpsBudget::new(10.0).with_adaptive(FinOpsAdaptiveBudget::new(1.0, 5.0, 20.0));
        assert!(bad_target.validate(Lane::Economy).is_err());

        let bad_bounds = FinOpsBudget::new(10.0).with_adaptive(FinOpsAdaptiveBudget::new(0.5, 30.0, 20.0));
        assert!(bad_bounds.validate(Lane::Economy).is_err());
    }

    #[test]
    fn test_adaptive_validation_rejects_non_finite_values() {
        let policies = [
            FinOpsAdaptiveBudget::new(0.5, f64::NAN, 20.0),
            FinOpsAdaptiveBudget::new(0.5, 5.0, f64::NAN),
            FinOpsAdaptiveBudget::new(0.5, 5.0, f64::INFINITY),
            FinOpsAdaptiveBudget::new(0.5, 5.0, 20.0).with_weights(f64::NAN, 0.0),
            FinOpsAdaptiveBudget::new(0.5, 5.0, 20.0).with_weights(0.0, f64::INFINITY),
            FinOpsAdaptiveBudget::new(0.5, 5.0, 20.0).with_latency_threshold(f64::NAN),
        ];
        for policy in policies {
            let budget = FinOpsBudget::new(10.0).with_adaptive(policy.clone());
            assert!(
                matches!(budget.validate(Lane::Economy), Err(Error::ValidationError(_))),
                "accepted {:?}",
                policy
            );
        }
    }

    #[test]
    fn test_override_with_nan_bound_fails_request_validation() {
        let budget = FinOpsBudget::new(10.0).with_adaptive(FinOpsAdaptiveBudget::new(0.5, f64::NAN, 20.0));
        let request = ExecutionRequest::new("search", vec![Lane::Economy]).with_override(Lane::Economy, budget);
        assert!(matches!(request.validate(), Err(Error::ValidationError(_))));
    }

    #[test]
    fn test_experiment_rejects_non_finite_variants() {
        let experiment = |variant: FinOpsVariant| FinOpsABExperiment {
            id: "exp".to_string(),
            lane: Lane::Balanced,
            concluded_at: None,
            variants: vec![FinOpsVariant::new("a", 0.5, 0.01, 800.0), variant],
        };
        assert!(experiment(FinOpsVariant::new("b", 0.5, f64::NAN, 700.0)).validate().is_err());
        assert!(experiment(FinOpsVariant::new("b", 0.5, 0.02, f64::INFINITY)).validate().is_err());
        assert!(experiment(FinOpsVariant::new("b", f64::NAN, 0.02, 700.0)).validate().is_err());
        assert!(experiment(FinOpsVariant::new("b", 0.5, 0.02, 700.0)).validate().is_ok());
    }

    #[test]
    fn test_experiment_traffic_must_sum_to_one() {
        let experiment = FinOpsABExperiment {
            id: "exp".to_string(),
            lane: Lane::Balanced,
            concluded_at: None,
            variants: vec![
                FinOpsVariant::new("a", 0.5, 0.01, 800.0),
                FinOpsVariant::new("b", 0.3, 0.02, 700.0),
            ],
        };
        assert!(experiment.validate().is_err());
    }

    #[test]
    fn test_degradation_policy_toml_shape() {
        let policy: DegradationPolicy = toml::from_str("mode = \"fallback\"\ntier = \"economy\"").unwrap();
        assert_eq!(policy, DegradationPolicy::Fallback { tier: Lane::Economy });

        let policy: DegradationPolicy =
            toml::from_str("mode = \"throttle\"\nretry_after_secs = 60").unwrap();
        assert_eq!(policy, DegradationPolicy::Throttle { retry_after_secs: 60 });
    }
}
