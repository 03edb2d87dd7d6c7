//! Simulation responses that double as golden fixtures
//!
//! A simulation is a plan projected onto a volume. Its JSON form is stable
//! (field order follows the struct, routes follow plan order) so it can be
//! checked in and compared by fingerprint.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::types::{Lane, RoutingPlan};
use crate::error::Result;

/// One route in a simulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedRoute {
    pub route_id: String,
    pub provider: String,
    pub lane: Lane,
    pub share: f64,
    pub cost_per_million: f64,
    pub latency_p95_ms: f64,
    pub projected_cost_usd: f64,
}

/// Result of simulating a plan for a lane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingSimulationResponse {
    pub strategy: String,
    pub failover: Option<String>,
    pub lane: Lane,
    pub volume_millions: f64,
    pub routes: Vec<SimulatedRoute>,
    pub total_projected_cost: f64,
    pub blended_latency_ms: f64,
}

impl RoutingSimulationResponse {
    /// Project a plan computed for `lane`
    pub fn from_plan(lane: Lane, plan: &RoutingPlan) -> Self {
        let routes: Vec<SimulatedRoute> = plan
            .distribution
            .iter()
            .map(|entry| SimulatedRoute {
                route_id: entry.route.id.clone(),
                provider: entry.route.provider.clone(),
                lane: entry.route.lane,
                share: entry.share,
                cost_per_million: entry.route.cost_per_million,
                latency_p95_ms: entry.route.latency_p95_ms,
                projected_cost_usd: entry.share
                    * plan.volume_millions
                    * entry.route.cost_per_million,
            })
            .collect();

        let total_projected_cost = routes.iter().map(|r| r.projected_cost_usd).sum();
        let blended_latency_ms = routes.iter().map(|r| r.share * r.latency_p95_ms).sum();

        Self {
            strategy: plan.strategy_id.clone(),
            failover: plan.failover_id.clone(),
            lane,
            volume_millions: plan.volume_millions,
            routes,
            total_projected_cost,
            blended_latency_ms,
        }
    }

    /// Pretty-printed JSON suitable for a checked-in fixture
    pub fn to_fixture_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// SHA-256 of the fixture JSON, hex encoded
    pub fn fingerprint(&self) -> Result<String> {
        let json = self.to_fixture_json()?;
        let digest = Sha256::digest(json.as_bytes());
        Ok(hex::encode(digest))
    }
}
