//! FinOps admission control
//!
//! This module provides:
//! - Static and adaptive per-tier budgets
//! - A per-(session, tier) usage ledger with atomic admission
//! - Graceful degradation when every candidate tier is over budget
//! - Utilization alerts and structured observability events

mod adaptive;
mod controller;
mod reporter;
mod types;

pub use adaptive::{ExperimentIndex, ExperimentSignal, best_variant, effective_amount};
pub use controller::FinOpsController;
pub use reporter::{
    ChannelReporter, FinOpsEvent, MemoryReporter, NullReporter, ObservabilityReporter,
    TracingReporter, events_file_path, names, spawn_jsonl_writer,
};
pub use types::{
    AlertRule, DegradationPolicy, ExecutionDecision, ExecutionParameters, ExecutionRequest,
    FinOpsABExperiment, FinOpsAdaptiveBudget, FinOpsBudget, FinOpsSnapshot, FinOpsVariant,
    GLOBAL_SESSION, SessionBudgetSnapshot, TierSnapshot,
};
