//! Tollway Core Library
//!
//! This crate provides the core functionality for Tollway, including:
//! - Bandit-driven traffic planning across provider routes
//! - Per-route telemetry (in-memory snapshots and SQLite)
//! - FinOps admission control with adaptive per-tier budgets
//! - Observability events for admissions, alerts and route selection

pub mod config;
pub mod dispatch;
pub mod error;
pub mod finops;
pub mod routing;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::dispatch::Dispatcher;
    pub use crate::error::{Error, Result};
    pub use crate::finops::{ExecutionDecision, ExecutionRequest, FinOpsController};
    pub use crate::routing::{Lane, ProviderRegistry, RoutingPlanner};
}
