//! Types for bandit-driven route planning
//!
//! Route candidates and telemetry are read-only snapshots handed to the
//! planner per call. Plans are the planner's only output.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A routing lane, which doubles as a FinOps budget tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Cheapest offers, relaxed latency
    Economy,
    /// Middle of the cost/latency curve
    Balanced,
    /// Fastest, most reliable offers
    Premium,
}

impl Lane {
    /// All lanes in ascending cost order
    pub const ALL: [Lane; 3] = [Lane::Economy, Lane::Balanced, Lane::Premium];

    /// Lane name as used in configuration keys
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Economy => "economy",
            Self::Balanced => "balanced",
            Self::Premium => "premium",
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Lane {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "economy" => Ok(Self::Economy),
            "balanced" => Ok(Self::Balanced),
            "premium" => Ok(Self::Premium),
            _ => Err(format!("Unknown lane: {}", s)),
        }
    }
}

/// Strategy used to turn candidates into traffic weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Beta-posterior Thompson sampling over telemetry
    Thompson,
    /// Upper confidence bound with a 1/sqrt(n+1) exploration bonus
    Ucb,
    /// Inverse cost per million tokens
    CostOptimized,
    /// Inverse p95 latency
    LatencyOptimized,
    /// Proportional to declared capacity
    CapacityWeighted,
    /// Proportional to declared reliability
    ReliabilityWeighted,
}

impl RoutingStrategy {
    /// Every built-in strategy
    pub const ALL: [RoutingStrategy; 6] = [
        Self::Thompson,
        Self::Ucb,
        Self::CostOptimized,
        Self::LatencyOptimized,
        Self::CapacityWeighted,
        Self::ReliabilityWeighted,
    ];

    /// Whether this strategy consumes telemetry through the bandit engine
    pub fn is_bandit(&self) -> bool {
        matches!(self, Self::Thompson | Self::Ucb)
    }

    /// Canonical identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thompson => "thompson",
            Self::Ucb => "ucb",
            Self::CostOptimized => "cost_optimized",
            Self::LatencyOptimized => "latency_optimized",
            Self::CapacityWeighted => "capacity_weighted",
            Self::ReliabilityWeighted => "reliability_weighted",
        }
    }
}

impl std::fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RoutingStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "thompson" | "thompson_sampling" => Ok(Self::Thompson),
            "ucb" => Ok(Self::Ucb),
            "cost_optimized" => Ok(Self::CostOptimized),
            "latency_optimized" => Ok(Self::LatencyOptimized),
            "capacity_weighted" => Ok(Self::CapacityWeighted),
            "reliability_weighted" => Ok(Self::ReliabilityWeighted),
            _ => Err(Error::InvalidStrategy(s.to_string())),
        }
    }
}

/// One provider's offer within a lane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteCandidate {
    /// Route identifier, unique across the registry
    pub id: String,
    /// Provider serving this route
    pub provider: String,
    /// Lane the offer belongs to
    pub lane: Lane,
    /// Blended cost per million tokens in USD
    pub cost_per_million: f64,
    /// Advertised p95 latency
    pub latency_p95_ms: f64,
    /// Advertised reliability (0.0 to 1.0)
    #[serde(default = "default_reliability")]
    pub reliability: f64,
    /// Throughput the route can absorb, in millions of tokens per planning window
    pub capacity_score: f64,
}

fn default_reliability() -> f64 {
    1.0
}

impl RouteCandidate {
    /// Create a new candidate with neutral defaults
    pub fn new(id: impl Into<String>, provider: impl Into<String>, lane: Lane) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            lane,
            cost_per_million: 1.0,
            latency_p95_ms: 1000.0,
            reliability: 1.0,
            capacity_score: 100.0,
        }
    }

    /// Set cost per million tokens
    pub fn with_cost(mut self, cost_per_million: f64) -> Self {
        self.cost_per_million = cost_per_million;
        self
    }

    /// Set p95 latency
    pub fn with_latency(mut self, latency_p95_ms: f64) -> Self {
        self.latency_p95_ms = latency_p95_ms;
        self
    }

    /// Set reliability
    pub fn with_reliability(mut self, reliability: f64) -> Self {
        self.reliability = reliability.clamp(0.0, 1.0);
        self
    }

    /// Set capacity score
    pub fn with_capacity(mut self, capacity_score: f64) -> Self {
        self.capacity_score = capacity_score;
        self
    }

    /// Check the snapshot invariants
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::ValidationError("route id must not be empty".into()));
        }
        let non_negative = [
            ("cost_per_million", self.cost_per_million),
            ("latency_p95_ms", self.latency_p95_ms),
            ("capacity_score", self.capacity_score),
        ];
        for (field, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::ValidationError(format!(
                    "route '{}': {} must be a non-negative number, got {}",
                    self.id, field, value
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.reliability) {
            return Err(Error::ValidationError(format!(
                "route '{}': reliability must be within [0, 1], got {}",
                self.id, self.reliability
            )));
        }
        Ok(())
    }
}

/// Rolling historical performance of a route
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetryBreakdown {
    pub route_id: String,
    pub run_count: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub avg_latency_ms: f64,
    /// Fraction of successful runs (0.0 to 1.0)
    pub success_rate: f64,
}

impl TelemetryBreakdown {
    /// Create an empty breakdown for a route
    pub fn new(route_id: impl Into<String>) -> Self {
        Self {
            route_id: route_id.into(),
            ..Default::default()
        }
    }

    /// Set run count and success rate
    pub fn with_runs(mut self, run_count: u64, success_rate: f64) -> Self {
        self.run_count = run_count;
        self.success_rate = success_rate.clamp(0.0, 1.0);
        self
    }

    /// Set token volume
    pub fn with_tokens(mut self, tokens_in: u64, tokens_out: u64) -> Self {
        self.tokens_in = tokens_in;
        self.tokens_out = tokens_out;
        self
    }

    /// Set total cost
    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = cost_usd;
        self
    }

    /// Set average latency
    pub fn with_latency(mut self, avg_latency_ms: f64) -> Self {
        self.avg_latency_ms = avg_latency_ms;
        self
    }

    /// Estimated successful runs
    pub fn successes(&self) -> f64 {
        self.run_count as f64 * self.success_rate.clamp(0.0, 1.0)
    }

    /// Estimated failed runs
    pub fn failures(&self) -> f64 {
        self.run_count as f64 * (1.0 - self.success_rate.clamp(0.0, 1.0))
    }
}

/// One route's share of a computed plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionEntry {
    pub route: RouteCandidate,
    /// Fraction of traffic (0.0 to 1.0)
    pub share: f64,
}

/// Full routing decision for a lane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingPlan {
    /// Strategy id as requested by the caller
    pub strategy_id: String,
    /// Strategy the id resolved to
    pub strategy: RoutingStrategy,
    /// Failover route, when one was requested and present
    pub failover_id: Option<String>,
    /// Ordered by share descending, then route id ascending
    pub distribution: Vec<DistributionEntry>,
    /// Planned volume in millions of tokens
    pub volume_millions: f64,
}

impl RoutingPlan {
    /// Whether the plan routes nothing
    pub fn is_empty(&self) -> bool {
        self.distribution.is_empty()
    }

    /// Sum of all shares (1.0 for any non-empty plan)
    pub fn total_share(&self) -> f64 {
        self.distribution.iter().map(|e| e.share).sum()
    }

    /// Share assigned to a route, 0.0 when absent
    pub fn share_of(&self, route_id: &str) -> f64 {
        self.distribution
            .iter()
            .find(|e| e.route.id == route_id)
            .map(|e| e.share)
            .unwrap_or(0.0)
    }

    /// Projected spend for the planned volume
    pub fn projected_cost_usd(&self) -> f64 {
        self.distribution
            .iter()
            .map(|e| e.share * self.volume_millions * e.route.cost_per_million)
            .sum()
    }

    /// Choose the route serving one request by walking cumulative shares
    ///
    /// `roll` is expected in [0, 1); values outside are clamped.
    pub fn pick(&self, roll: f64) -> Option<&DistributionEntry> {
        let roll = roll.clamp(0.0, 1.0);
        let mut cumulative = 0.0;
        for entry in &self.distribution {
            cumulative += entry.share;
            if roll < cumulative {
                return Some(entry);
            }
        }
        // Rounding can leave the cumulative sum a hair under 1.0
        self.distribution.iter().rev().find(|e| e.share > 0.0)
    }
}
