//! Admission followed by routing
//!
//! A routing decision only counts once the request has passed budget
//! admission, so the dispatcher always runs the controller first and then
//! plans the admitted tier's lane.

use std::sync::{Arc, Mutex};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::error::Result;
use crate::finops::{
    ExecutionDecision, ExecutionRequest, FinOpsController, FinOpsEvent, ObservabilityReporter,
    names,
};
use crate::routing::{ProviderRegistry, RoutingPlanner};

/// Runs admission and routing for one request at a time
pub struct Dispatcher {
    controller: Arc<FinOpsController>,
    planner: Arc<RoutingPlanner>,
    registry: ProviderRegistry,
    volume_millions: f64,
    rng: Option<Mutex<ChaCha8Rng>>,
}

impl Dispatcher {
    /// Create a dispatcher; route rolls are seeded when the routing config sets a seed
    pub fn new(
        controller: Arc<FinOpsController>,
        planner: Arc<RoutingPlanner>,
        registry: ProviderRegistry,
    ) -> Self {
        let rng = planner
            .config()
            .thompson_seed
            .map(|seed| Mutex::new(ChaCha8Rng::seed_from_u64(seed)));
        Self {
            controller,
            planner,
            registry,
            volume_millions: 0.0,
            rng,
        }
    }

    /// Planned volume used for capacity ceilings (0 disables them)
    pub fn with_volume(mut self, volume_millions: f64) -> Self {
        self.volume_millions = volume_millions.max(0.0);
        self
    }

    pub fn controller(&self) -> &Arc<FinOpsController> {
        &self.controller
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Admit the request, then pick the route that serves it
    ///
    /// A planning failure after admission leaves the ledger charged.
    pub async fn dispatch(
        &self,
        request: &ExecutionRequest,
        reporter: &dyn ObservabilityReporter,
    ) -> Result<ExecutionDecision> {
        let mut decision = self.controller.prepare_execution(request, reporter)?;

        let candidates = self.registry.candidates(decision.tier);
        let plan = self
            .planner
            .compute_plan(
                &candidates,
                "",
                request.failover_route.as_deref(),
                self.volume_millions,
            )
            .await?;

        let roll = self.roll();
        decision.route = plan.pick(roll).map(|entry| entry.route.clone());

        let route_ids: Vec<String> = decision.route.iter().map(|r| r.id.clone()).collect();
        debug!(
            tool = %request.tool_name,
            tier = %decision.tier,
            route = route_ids.first().map(String::as_str).unwrap_or("-"),
            roll,
            "Route selected"
        );

        reporter.emit(
            FinOpsEvent::new(names::ROUTE_SELECTED, decision.session_id.clone())
                .with_tier(decision.tier)
                .with_amounts(
                    decision.effective_budget,
                    decision.estimated_cost,
                    self.controller.usage(&decision.session_id, decision.tier)?,
                )
                .with_routes(route_ids),
        );

        Ok(decision)
    }

    fn roll(&self) -> f64 {
        match &self.rng {
            Some(rng) => match rng.lock() {
                Ok(mut rng) => rng.gen_range(0.0..1.0),
                Err(_) => rand::thread_rng().gen_range(0.0..1.0),
            },
            None => rand::thread_rng().gen_range(0.0..1.0),
        }
    }
}
