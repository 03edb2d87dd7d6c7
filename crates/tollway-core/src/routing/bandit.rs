//! Bandit weight engine for route planning
//!
//! Turns route candidates plus telemetry into non-negative traffic weights.
//! Two policies are supported:
//!
//! - **Thompson sampling**: each route keeps a Beta(α, β) posterior where
//!   α = 1 + successes and β = 1 + failures. The engine either samples from
//!   it with a seeded RNG or, by default, uses the posterior mean so that
//!   plans are reproducible.
//! - **UCB**: mean success plus an exploration bonus `c / sqrt(n + 1)`, so
//!   sparsely sampled routes can outrank well-known ones.
//!
//! Both scale the success estimate by reliability and by how cheap and fast
//! the route is relative to the mean of its peers. Weights are not
//! normalized here; that is the planner's job.

use std::collections::{BTreeMap, HashMap};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Beta, Distribution};

use super::types::{Lane, RouteCandidate, RoutingStrategy, TelemetryBreakdown};
use crate::error::{Error, Result};

/// Default UCB exploration constant
pub const DEFAULT_EXPLORATION_CONSTANT: f64 = std::f64::consts::SQRT_2;

/// Anything that can produce per-route weights for a bandit strategy
pub trait WeightEngine: Send + Sync {
    /// Compute a weight ≥ 0 for every candidate in `lane` (all candidates when `None`)
    fn compute_weights(
        &self,
        candidates: &[RouteCandidate],
        lane: Option<Lane>,
        strategy: RoutingStrategy,
        metrics: &[TelemetryBreakdown],
    ) -> Result<BTreeMap<String, f64>>;
}

/// How Thompson sampling resolves the posterior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThompsonMode {
    /// Use the posterior mean α / (α + β)
    #[default]
    PosteriorMean,
    /// Draw from the posterior with a per-route RNG derived from this seed
    Sampled { seed: u64 },
}

/// Stateless bandit weight engine
#[derive(Debug, Clone)]
pub struct BanditWeightEngine {
    exploration_constant: f64,
    thompson_mode: ThompsonMode,
}

impl Default for BanditWeightEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-route inputs after telemetry has been folded in
struct ArmView<'a> {
    candidate: &'a RouteCandidate,
    telemetry: Option<&'a TelemetryBreakdown>,
    cost: f64,
    latency: f64,
}

impl BanditWeightEngine {
    /// Create an engine using posterior means and the default exploration constant
    pub fn new() -> Self {
        Self {
            exploration_constant: DEFAULT_EXPLORATION_CONSTANT,
            thompson_mode: ThompsonMode::PosteriorMean,
        }
    }

    /// Create an engine that samples Thompson posteriors from a fixed seed
    pub fn with_seed(seed: u64) -> Self {
        Self {
            thompson_mode: ThompsonMode::Sampled { seed },
            ..Self::new()
        }
    }

    /// Set the UCB exploration constant
    pub fn with_exploration_constant(mut self, c: f64) -> Self {
        self.exploration_constant = c.max(0.0);
        self
    }

    pub fn exploration_constant(&self) -> f64 {
        self.exploration_constant
    }

    pub fn thompson_mode(&self) -> ThompsonMode {
        self.thompson_mode
    }

    fn arms<'a>(
        candidates: &'a [RouteCandidate],
        lane: Option<Lane>,
        metrics: &'a [TelemetryBreakdown],
    ) -> Vec<ArmView<'a>> {
        let by_route: HashMap<&str, &TelemetryBreakdown> =
            metrics.iter().map(|m| (m.route_id.as_str(), m)).collect();

        candidates
            .iter()
            .filter(|c| lane.is_none_or(|l| c.lane == l))
            .map(|candidate| {
                let telemetry = by_route.get(candidate.id.as_str()).copied();
                let observed = telemetry.filter(|t| t.run_count > 0);

                // Prefer observed figures once the route has actually served traffic
                let cost = observed
                    .and_then(|t| {
                        let tokens = (t.tokens_in + t.tokens_out) as f64;
                        (tokens > 0.0).then(|| t.cost_usd / (tokens / 1_000_000.0))
                    })
                    .unwrap_or(candidate.cost_per_million);
                let latency = observed
                    .map(|t| t.avg_latency_ms)
                    .filter(|l| *l > 0.0)
                    .unwrap_or(candidate.latency_p95_ms);

                ArmView {
                    candidate,
                    telemetry,
                    cost,
                    latency,
                }
            })
            .collect()
    }

    /// 2·mean / (mean + x): 1.0 at the mean, approaching 2.0 as x → 0
    fn relative_efficiency(value: f64, mean: f64) -> f64 {
        if mean <= 0.0 {
            return 1.0;
        }
        2.0 * mean / (mean + value.max(0.0))
    }

    fn efficiency_factors(arms: &[ArmView<'_>]) -> Vec<f64> {
        let n = arms.len().max(1) as f64;
        let mean_cost = arms.iter().map(|a| a.cost).sum::<f64>() / n;
        let mean_latency = arms.iter().map(|a| a.latency).sum::<f64>() / n;

        arms.iter()
            .map(|a| {
                Self::relative_efficiency(a.cost, mean_cost)
                    * Self::relative_efficiency(a.latency, mean_latency)
                    * a.candidate.reliability
            })
            .collect()
    }

    fn sample_beta(&self, route_id: &str, alpha: f64, beta: f64) -> f64 {
        let mean = alpha / (alpha + beta);
        match self.thompson_mode {
            ThompsonMode::PosteriorMean => mean,
            ThompsonMode::Sampled { seed } => {
                let mut rng = ChaCha8Rng::seed_from_u64(seed ^ fnv1a(route_id));
                match Beta::new(alpha, beta) {
                    Ok(dist) => dist.sample(&mut rng),
                    Err(_) => mean,
                }
            }
        }
    }

    fn thompson(&self, arms: &[ArmView<'_>]) -> BTreeMap<String, f64> {
        let efficiency = Self::efficiency_factors(arms);

        arms.iter()
            .zip(efficiency)
            .map(|(arm, eff)| {
                // Beta(1, 1) prior: unseen routes sit at 0.5 instead of zero
                let (alpha, beta) = arm
                    .telemetry
                    .map(|t| (1.0 + t.successes(), 1.0 + t.failures()))
                    .unwrap_or((1.0, 1.0));
                let p = self.sample_beta(&arm.candidate.id, alpha, beta);
                (arm.candidate.id.clone(), (p * eff).max(0.0))
            })
            .collect()
    }

    fn ucb(&self, arms: &[ArmView<'_>]) -> BTreeMap<String, f64> {
        let efficiency = Self::efficiency_factors(arms);

        arms.iter()
            .zip(efficiency)
            .map(|(arm, eff)| {
                let (mean, runs) = arm
                    .telemetry
                    .filter(|t| t.run_count > 0)
                    .map(|t| (t.success_rate.clamp(0.0, 1.0), t.run_count))
                    .unwrap_or((0.5, 0));
                let bonus = self.exploration_constant / ((runs as f64) + 1.0).sqrt();
                (arm.candidate.id.clone(), (mean * eff + bonus).max(0.0))
            })
            .collect()
    }
}

impl WeightEngine for BanditWeightEngine {
    fn compute_weights(
        &self,
        candidates: &[RouteCandidate],
        lane: Option<Lane>,
        strategy: RoutingStrategy,
        metrics: &[TelemetryBreakdown],
    ) -> Result<BTreeMap<String, f64>> {
        let arms = Self::arms(candidates, lane, metrics);
        match strategy {
            RoutingStrategy::Thompson => Ok(self.thompson(&arms)),
            RoutingStrategy::Ucb => Ok(self.ucb(&arms)),
            other => Err(Error::InvalidStrategy(format!(
                "{} is not a bandit strategy",
                other
            ))),
        }
    }
}

/// FNV-1a, used to derive stable per-route seeds
fn fnv1a(input: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in input.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}
