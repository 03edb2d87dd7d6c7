//! Routing planner - turns candidate weights into a traffic distribution
//!
//! The planner combines:
//! - strategy resolution (named registry first, then built-in ids)
//! - weight computation (bandit engine over telemetry, or a static heuristic)
//! - capacity-capped normalization with proportional redistribution
//! - a guaranteed reserve share for an optional failover route
//!
//! Output is deterministic for identical inputs. The only randomness is
//! seeded Thompson sampling, which is itself reproducible.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::bandit::{BanditWeightEngine, WeightEngine};
use super::store::TelemetrySource;
use super::types::{
    DistributionEntry, Lane, RouteCandidate, RoutingPlan, RoutingStrategy, TelemetryBreakdown,
};
use crate::config::{RoutingConfig, StrategyDefinition};
use crate::error::Result;

/// Tolerance used when comparing shares against caps
const SHARE_EPSILON: f64 = 1e-9;

/// Routing planner over a shared telemetry source
pub struct RoutingPlanner {
    config: RoutingConfig,
    engine: Arc<dyn WeightEngine>,
    telemetry: Arc<dyn TelemetrySource>,
}

impl std::fmt::Debug for RoutingPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingPlanner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RoutingPlanner {
    /// Create a planner whose bandit engine follows the routing config
    pub fn new(config: RoutingConfig, telemetry: Arc<dyn TelemetrySource>) -> Self {
        let engine = engine_for(&config, None);
        Self {
            config,
            engine: Arc::new(engine),
            telemetry,
        }
    }

    /// Replace the weight engine (e.g. with a fixed-weight engine in tests)
    pub fn with_weight_engine(mut self, engine: Arc<dyn WeightEngine>) -> Self {
        self.engine = engine;
        self
    }

    /// Get the routing configuration
    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Resolve a strategy id against the named registry, then the built-ins
    ///
    /// An empty id selects the configured default strategy.
    pub fn resolve_strategy(
        &self,
        strategy_id: &str,
    ) -> Result<(RoutingStrategy, Option<&StrategyDefinition>)> {
        let id = if strategy_id.trim().is_empty() {
            self.config.default_strategy.as_str()
        } else {
            strategy_id
        };

        if let Some(definition) = self.config.strategies.get(id) {
            return Ok((definition.kind, Some(definition)));
        }
        Ok((id.parse()?, None))
    }

    /// Compute a plan, fetching telemetry when the strategy is a bandit
    pub async fn compute_plan(
        &self,
        candidates: &[RouteCandidate],
        strategy_id: &str,
        failover_id: Option<&str>,
        volume_millions: f64,
    ) -> Result<RoutingPlan> {
        let (strategy, _) = self.resolve_strategy(strategy_id)?;

        let metrics = if strategy.is_bandit() && candidates.len() > 1 {
            let ids: Vec<String> = candidates.iter().map(|c| c.id.clone()).collect();
            self.telemetry.breakdowns(&ids).await?
        } else {
            Vec::new()
        };

        self.compute_plan_with_telemetry(candidates, strategy_id, failover_id, volume_millions, &metrics)
    }

    /// Compute a plan from an explicit telemetry snapshot
    pub fn compute_plan_with_telemetry(
        &self,
        candidates: &[RouteCandidate],
        strategy_id: &str,
        failover_id: Option<&str>,
        volume_millions: f64,
        metrics: &[TelemetryBreakdown],
    ) -> Result<RoutingPlan> {
        let (strategy, definition) = self.resolve_strategy(strategy_id)?;
        let strategy_id = if strategy_id.trim().is_empty() {
            self.config.default_strategy.clone()
        } else {
            strategy_id.to_string()
        };

        // Sort by id once so ties and iteration order are deterministic
        let mut ordered: Vec<&RouteCandidate> = candidates.iter().collect();
        ordered.sort_by(|a, b| a.id.cmp(&b.id));

        let failover_id = failover_id
            .filter(|id| ordered.iter().any(|c| c.id == *id))
            .map(str::to_string);

        let mut plan = RoutingPlan {
            strategy_id,
            strategy,
            failover_id,
            distribution: Vec::new(),
            volume_millions,
        };

        match ordered.len() {
            0 => return Ok(plan),
            1 => {
                plan.distribution.push(DistributionEntry {
                    route: ordered[0].clone(),
                    share: 1.0,
                });
                return Ok(plan);
            }
            _ => {}
        }

        let weights = if strategy.is_bandit() {
            let owned: Vec<RouteCandidate> = ordered.iter().map(|c| (*c).clone()).collect();
            let raw = match definition.filter(|d| d.has_overrides()) {
                Some(d) => engine_for(&self.config, Some(d)).compute_weights(
                    &owned, None, strategy, metrics,
                )?,
                None => self.engine.compute_weights(&owned, None, strategy, metrics)?,
            };
            ordered
                .iter()
                .map(|c| raw.get(&c.id).copied().unwrap_or(0.0))
                .collect()
        } else {
            static_weights(strategy, &ordered)
        };

        let caps: Vec<f64> = ordered
            .iter()
            .map(|c| capacity_ceiling(c, volume_millions))
            .collect();

        let mut shares = distribute(&weights, &caps);

        if let Some(failover) = plan.failover_id.as_deref() {
            let reserve = self.config.failover_reserve;
            if let Some(idx) = ordered.iter().position(|c| c.id == failover)
                && shares[idx] + SHARE_EPSILON < reserve
            {
                shares = apply_failover_reserve(&weights, &caps, idx, reserve);
            }
        }

        let mut distribution: Vec<DistributionEntry> = ordered
            .into_iter()
            .zip(shares)
            .map(|(route, share)| DistributionEntry {
                route: route.clone(),
                share,
            })
            .collect();

        // Highest share first; the sort is stable so equal shares stay in id order
        distribution.sort_by(|a, b| b.share.total_cmp(&a.share));

        debug!(
            strategy = %plan.strategy,
            routes = distribution.len(),
            failover = plan.failover_id.as_deref().unwrap_or("-"),
            volume_millions = volume_millions,
            "Computed routing plan"
        );

        plan.distribution = distribution;
        Ok(plan)
    }
}

/// Build a bandit engine from the routing config and optional per-strategy overrides
fn engine_for(config: &RoutingConfig, definition: Option<&StrategyDefinition>) -> BanditWeightEngine {
    let exploration = definition
        .and_then(|d| d.exploration_constant)
        .unwrap_or(config.exploration_constant);
    let seed = definition
        .and_then(|d| d.thompson_seed)
        .or(config.thompson_seed);

    let engine = match seed {
        Some(seed) => BanditWeightEngine::with_seed(seed),
        None => BanditWeightEngine::new(),
    };
    engine.with_exploration_constant(exploration)
}

/// Largest share a route may take for the planned volume
fn capacity_ceiling(candidate: &RouteCandidate, volume_millions: f64) -> f64 {
    if volume_millions <= 0.0 {
        return f64::INFINITY;
    }
    (candidate.capacity_score / volume_millions).max(0.0)
}

/// Deterministic weights for the static heuristics
fn static_weights(strategy: RoutingStrategy, candidates: &[&RouteCandidate]) -> Vec<f64> {
    let n = candidates.len().max(1) as f64;
    let inverse = |values: Vec<f64>| -> Vec<f64> {
        let mean = values.iter().sum::<f64>() / n;
        values
            .into_iter()
            .map(|v| if mean <= 0.0 { 1.0 } else { mean / (mean + v.max(0.0)) })
            .collect()
    };

    match strategy {
        RoutingStrategy::CostOptimized => {
            inverse(candidates.iter().map(|c| c.cost_per_million).collect())
        }
        RoutingStrategy::LatencyOptimized => {
            inverse(candidates.iter().map(|c| c.latency_p95_ms).collect())
        }
        RoutingStrategy::CapacityWeighted => {
            candidates.iter().map(|c| c.capacity_score.max(0.0)).collect()
        }
        RoutingStrategy::ReliabilityWeighted => {
            candidates.iter().map(|c| c.reliability.max(0.0)).collect()
        }
        // Bandit strategies never reach here; fall back to an even split
        RoutingStrategy::Thompson | RoutingStrategy::Ucb => vec![1.0; candidates.len()],
    }
}

/// Normalize weights to shares summing to 1, honouring per-route caps
fn distribute(weights: &[f64], caps: &[f64]) -> Vec<f64> {
    let (mut shares, remaining) = water_fill(weights, caps, 1.0);
    if remaining > SHARE_EPSILON {
        warn!(
            unallocated = remaining,
            "Combined route capacity is below the planned volume; scaling shares to capacity"
        );
        renormalize(&mut shares);
    }
    shares
}

/// Give the failover route its reserve, then spread the rest over the others
fn apply_failover_reserve(weights: &[f64], caps: &[f64], failover: usize, reserve: f64) -> Vec<f64> {
    let failover_share = reserve.min(caps[failover]).clamp(0.0, 1.0);

    let other_weights: Vec<f64> = weights
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != failover)
        .map(|(_, w)| *w)
        .collect();
    let other_caps: Vec<f64> = caps
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != failover)
        .map(|(_, c)| *c)
        .collect();

    let (other_shares, remaining) = water_fill(&other_weights, &other_caps, 1.0 - failover_share);

    let mut shares = Vec::with_capacity(weights.len());
    let mut others = other_shares.into_iter();
    for i in 0..weights.len() {
        if i == failover {
            shares.push(failover_share);
        } else {
            shares.push(others.next().unwrap_or(0.0));
        }
    }

    if remaining > SHARE_EPSILON {
        // The others cannot absorb the rest; the failover takes what it can
        let headroom = (caps[failover] - failover_share).max(0.0);
        shares[failover] += remaining.min(headroom);
        renormalize(&mut shares);
    }
    shares
}

/// Capacity-capped proportional allocation of `total`
///
/// Routes whose proportional share would exceed their cap are pinned at the
/// cap; the excess is redistributed over the remaining routes in proportion
/// to their weights. Returns the shares and any amount no route could take.
fn water_fill(weights: &[f64], caps: &[f64], total: f64) -> (Vec<f64>, f64) {
    let sanitized: Vec<f64> = weights
        .iter()
        .map(|w| if w.is_finite() && *w > 0.0 { *w } else { 0.0 })
        .collect();

    let mut shares = vec![0.0; sanitized.len()];
    let mut active: Vec<usize> = (0..sanitized.len()).collect();
    let mut remaining = total.max(0.0);

    while !active.is_empty() && remaining > SHARE_EPSILON {
        let weight_sum: f64 = active.iter().map(|&i| sanitized[i]).sum();
        let proposal = |i: usize| {
            if weight_sum > 0.0 {
                remaining * sanitized[i] / weight_sum
            } else {
                remaining / active.len() as f64
            }
        };

        let saturated: Vec<usize> = active
            .iter()
            .copied()
            .filter(|&i| proposal(i) >= caps[i] - SHARE_EPSILON)
            .collect();

        if saturated.is_empty() {
            for &i in &active {
                shares[i] = proposal(i);
            }
            remaining = 0.0;
            break;
        }

        for &i in &saturated {
            shares[i] = caps[i];
            remaining -= caps[i];
        }
        active.retain(|i| !saturated.contains(i));
    }

    (shares, remaining.max(0.0))
}

fn renormalize(shares: &mut [f64]) {
    let sum: f64 = shares.iter().sum();
    if sum > 0.0 {
        for share in shares.iter_mut() {
            *share /= sum;
        }
    } else if !shares.is_empty() {
        let even = 1.0 / shares.len() as f64;
        shares.iter_mut().for_each(|s| *s = even);
    }
}

/// Weight engine returning fixed weights, keyed by route id
#[derive(Debug, Clone, Default)]
pub struct FixedWeightEngine {
    weights: BTreeMap<String, f64>,
}

impl FixedWeightEngine {
    pub fn new(weights: impl IntoIterator<Item = (String, f64)>) -> Self {
        Self {
            weights: weights.into_iter().collect(),
        }
    }
}

impl WeightEngine for FixedWeightEngine {
    fn compute_weights(
        &self,
        candidates: &[RouteCandidate],
        lane: Option<Lane>,
        _strategy: RoutingStrategy,
        _metrics: &[TelemetryBreakdown],
    ) -> Result<BTreeMap<String, f64>> {
        Ok(candidates
            .iter()
            .filter(|c| lane.is_none_or(|l| c.lane == l))
            .map(|c| (c.id.clone(), self.weights.get(&c.id).copied().unwrap_or(0.0)))
            .collect())
    }
}
