//! Traffic planning across provider routes
//!
//! The key components are:
//!
//! - **Provider Registry**: route candidates grouped by lane (economy,
//!   balanced, premium) with advertised cost, latency, reliability and
//!   capacity.
//!
//! - **Weight Engine**: Thompson sampling and UCB bandits that score routes
//!   from observed telemetry, discounted for cost and latency.
//!
//! - **Planner**: resolves a strategy id, turns weights into shares that sum
//!   to one, respects per-route capacity and reserves traffic for a failover.
//!
//! - **Telemetry Store**: SQLite persistence for per-route run outcomes.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tollway_core::config::RoutingConfig;
//! use tollway_core::routing::{Lane, ProviderRegistry, RoutingPlanner, TelemetrySnapshot};
//!
//! let registry = ProviderRegistry::with_defaults();
//! let planner = RoutingPlanner::new(RoutingConfig::default(), Arc::new(TelemetrySnapshot::new()));
//!
//! let plan = planner
//!     .compute_plan(&registry.candidates(Lane::Balanced), "thompson", None, 25.0)
//!     .await?;
//!
//! let route = plan.pick(0.42);
//! ```

mod bandit;
mod fixtures;
mod planner;
mod registry;
mod store;
mod types;

pub use bandit::{BanditWeightEngine, DEFAULT_EXPLORATION_CONSTANT, ThompsonMode, WeightEngine};
pub use fixtures::{RoutingSimulationResponse, SimulatedRoute};
pub use planner::{FixedWeightEngine, RoutingPlanner};
pub use registry::{ProviderRegistry, RegistryFile};
pub use store::{
    CREATE_ROUTE_TELEMETRY_TABLE_SQL, RunRecord, SqliteTelemetryStore, TelemetrySnapshot,
    TelemetrySource, TelemetrySummary,
};
pub use types::{
    DistributionEntry, Lane, RouteCandidate, RoutingPlan, RoutingStrategy, TelemetryBreakdown,
};
