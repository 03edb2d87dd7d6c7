//! FinOps admission controller
//!
//! Owns the per-(session, tier) usage ledger and the effective-budget cache.
//! Both live behind one mutex that is held for the whole admission loop, so
//! the check against the ceiling and the ledger increment are a single atomic
//! step: two concurrent requests can never both pass when only one fits.
//!
//! Cache rule: an entry holds the effective ceiling of a configured budget
//! for one (session, tier) pair and is dropped whenever usage for that pair
//! changes. Request overrides are never cached. There is no time-based expiry.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::adaptive::{ExperimentIndex, ExperimentSignal, effective_amount};
use super::reporter::{FinOpsEvent, ObservabilityReporter, names};
use super::types::{
    DegradationPolicy, ExecutionDecision, ExecutionRequest, FinOpsBudget, FinOpsSnapshot,
    SessionBudgetSnapshot, TierSnapshot,
};
use crate::config::FinOpsConfig;
use crate::error::{Error, Result, TierShortfall};
use crate::routing::Lane;

/// Lookback used for call estimates on tiers without an adaptive policy
const DEFAULT_LOOKBACK_DAYS: u32 = 30;

type LedgerKey = (String, Lane);

#[derive(Debug, Default)]
struct LedgerState {
    usage: HashMap<LedgerKey, f64>,
    cache: HashMap<LedgerKey, f64>,
}

/// Shared admission controller; construct once and hand out behind an `Arc`
#[derive(Debug)]
pub struct FinOpsController {
    config: FinOpsConfig,
    experiments: ExperimentIndex,
    state: Mutex<LedgerState>,
}

impl FinOpsController {
    /// Create a controller, validating the configuration
    pub fn new(config: FinOpsConfig) -> Result<Self> {
        Self::with_as_of(config, Utc::now())
    }

    /// Create a controller whose experiment lookback is measured from `as_of`
    pub fn with_as_of(config: FinOpsConfig, as_of: DateTime<Utc>) -> Result<Self> {
        config.validate()?;
        let experiments = ExperimentIndex::new(&config.experiments, as_of);
        Ok(Self {
            config,
            experiments,
            state: Mutex::new(LedgerState::default()),
        })
    }

    pub fn config(&self) -> &FinOpsConfig {
        &self.config
    }

    /// Ledger guard, recovered if a previous holder panicked
    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("FinOps ledger lock was poisoned, recovering");
            self.state.clear_poison();
            poisoned.into_inner()
        })
    }

    /// Effective ceiling for a session on a tier
    ///
    /// Results for the tier's configured budget are cached until usage for
    /// the pair changes; any other budget is evaluated fresh.
    pub fn effective_budget(&self, session_id: &str, tier: Lane, budget: &FinOpsBudget) -> Result<f64> {
        let cacheable = self.config.budgets.get(&tier) == Some(budget);
        let mut state = self.lock();
        Ok(self.effective_locked(&mut state, session_id, tier, budget, cacheable))
    }

    fn effective_locked(
        &self,
        state: &mut LedgerState,
        session_id: &str,
        tier: Lane,
        budget: &FinOpsBudget,
        cacheable: bool,
    ) -> f64 {
        let key = (session_id.to_string(), tier);
        if cacheable && let Some(cached) = state.cache.get(&key) {
            return *cached;
        }

        let usage = state.usage.get(&key).copied().unwrap_or(0.0);
        let amount = effective_amount(budget, usage, self.signal_for(tier, budget));

        if cacheable {
            state.cache.insert(key, amount);
        }
        amount
    }

    fn signal_for(&self, tier: Lane, budget: &FinOpsBudget) -> Option<ExperimentSignal> {
        let lookback = budget.adaptive.as_ref()?.lookback_days;
        self.experiments.signal(tier, lookback)
    }

    /// Estimated cost of one call on a tier
    fn estimate(&self, request: &ExecutionRequest, tier: Lane, budget: &FinOpsBudget) -> f64 {
        let lookback = budget
            .adaptive
            .as_ref()
            .map(|a| a.lookback_days)
            .unwrap_or(DEFAULT_LOOKBACK_DAYS);

        request
            .parameters
            .estimated_cost
            .or(budget.default_estimate)
            .or_else(|| self.experiments.best_cost(tier, lookback))
            .unwrap_or(self.config.default_estimated_cost)
    }

    /// Admit a request on the first affordable candidate tier
    ///
    /// The ledger is charged with the estimated cost on acceptance. When no
    /// tier fits, the configured degradation policy applies, otherwise the
    /// call fails with every attempted tier's shortfall.
    pub fn prepare_execution(
        &self,
        request: &ExecutionRequest,
        reporter: &dyn ObservabilityReporter,
    ) -> Result<ExecutionDecision> {
        request.validate()?;
        let session_id = request.session_id().to_string();

        let mut events = Vec::new();
        let outcome = self.admit_locked(request, &session_id, &mut events);

        // Delivery happens outside the lock
        for event in events {
            reporter.emit(event);
        }
        outcome
    }

    fn admit_locked(
        &self,
        request: &ExecutionRequest,
        session_id: &str,
        events: &mut Vec<FinOpsEvent>,
    ) -> Result<ExecutionDecision> {
        let mut state = self.lock();
        let mut attempts = Vec::new();
        let mut unconfigured = Vec::new();

        for tier in &request.candidate_tiers {
            let tier = *tier;
            let (budget, cacheable) = match request.overrides.get(&tier) {
                Some(budget) => (budget, false),
                None => match self.config.budgets.get(&tier) {
                    Some(budget) => (budget, true),
                    None => {
                        warn!(tier = %tier, "No budget configured for tier, skipping");
                        unconfigured.push(tier);
                        continue;
                    }
                },
            };

            let estimated_cost = self.estimate(request, tier, budget);
            let effective_budget = self.effective_locked(&mut state, session_id, tier, budget, cacheable);
            let key = (session_id.to_string(), tier);
            let current_usage = state.usage.get(&key).copied().unwrap_or(0.0);

            debug!(
                tool = %request.tool_name,
                session_id,
                tier = %tier,
                current_usage,
                estimated_cost,
                effective_budget,
                "Evaluating tier"
            );

            if current_usage + estimated_cost <= effective_budget {
                let usage = charge(&mut state, key, estimated_cost);
                events.push(
                    FinOpsEvent::new(names::ADMITTED, session_id)
                        .with_tier(tier)
                        .with_amounts(effective_budget, estimated_cost, usage)
                        .with_detail(request.tool_name.clone()),
                );
                self.collect_alerts(events, session_id, tier, effective_budget, current_usage, usage);

                return Ok(ExecutionDecision {
                    tier,
                    effective_budget,
                    route: None,
                    estimated_cost,
                    session_id: session_id.to_string(),
                    degraded: false,
                });
            }

            attempts.push(TierShortfall {
                tier,
                effective_budget,
                current_usage,
                estimated_cost,
            });
        }

        if !unconfigured.is_empty() {
            let tiers: Vec<&str> = unconfigured.iter().map(Lane::as_str).collect();
            if attempts.is_empty() {
                return Err(Error::ConfigurationError(format!(
                    "no budget configured for tier(s) {} and no override supplied",
                    tiers.join(", ")
                )));
            }
            warn!(
                tool = %request.tool_name,
                unconfigured = %tiers.join(", "),
                "Configured tiers over budget, unconfigured tiers skipped"
            );
        }

        match &self.config.degradation {
            Some(DegradationPolicy::Fallback { tier }) => {
                let tier = *tier;
                let budget = self.config.budgets.get(&tier).ok_or_else(|| {
                    Error::ConfigurationError(format!("fallback tier '{}' has no budget", tier))
                })?;
                let estimated_cost = self.estimate(request, tier, budget);
                let effective_budget = self.effective_locked(&mut state, session_id, tier, budget, true);
                let key = (session_id.to_string(), tier);
                let previous = state.usage.get(&key).copied().unwrap_or(0.0);
                let usage = charge(&mut state, key, estimated_cost);

                warn!(
                    tool = %request.tool_name,
                    session_id,
                    tier = %tier,
                    "Every candidate tier over budget, degrading to fallback tier"
                );
                events.push(
                    FinOpsEvent::new(names::DEGRADED, session_id)
                        .with_tier(tier)
                        .with_amounts(effective_budget, estimated_cost, usage)
                        .with_detail(request.tool_name.clone()),
                );
                self.collect_alerts(events, session_id, tier, effective_budget, previous, usage);

                Ok(ExecutionDecision {
                    tier,
                    effective_budget,
                    route: None,
                    estimated_cost,
                    session_id: session_id.to_string(),
                    degraded: true,
                })
            }
            policy => {
                let retry_after_secs = match policy {
                    Some(DegradationPolicy::Throttle { retry_after_secs }) => Some(*retry_after_secs),
                    _ => None,
                };
                for attempt in &attempts {
                    events.push(
                        FinOpsEvent::new(names::REJECTED, session_id)
                            .with_tier(attempt.tier)
                            .with_amounts(
                                attempt.effective_budget,
                                attempt.estimated_cost,
                                attempt.current_usage,
                            )
                            .with_detail(request.tool_name.clone()),
                    );
                }
                Err(Error::FinOpsBudgetExceeded {
                    attempts,
                    retry_after_secs,
                })
            }
        }
    }

    fn collect_alerts(
        &self,
        events: &mut Vec<FinOpsEvent>,
        session_id: &str,
        tier: Lane,
        effective_budget: f64,
        before: f64,
        after: f64,
    ) {
        if effective_budget <= 0.0 {
            return;
        }
        let (before_ratio, after_ratio) = (before / effective_budget, after / effective_budget);
        for rule in self.config.alert_rules.iter().filter(|r| r.applies_to(tier)) {
            if before_ratio < rule.threshold && after_ratio >= rule.threshold {
                events.push(
                    FinOpsEvent::new(names::ALERT, session_id)
                        .with_tier(tier)
                        .with_amounts(effective_budget, after - before, after)
                        .with_detail(rule.name.clone()),
                );
            }
        }
    }

    /// Charge usage reported from outside the admission path
    pub fn record_usage(&self, session_id: &str, tier: Lane, amount: f64) -> Result<f64> {
        if !(amount.is_finite() && amount >= 0.0) {
            return Err(Error::ValidationError(format!(
                "usage amount must be a non-negative number, got {}",
                amount
            )));
        }
        let mut state = self.lock();
        Ok(charge(&mut state, (session_id.to_string(), tier), amount))
    }

    /// Start a new budget period for one (session, tier) pair
    pub fn reset_usage(&self, session_id: &str, tier: Lane) -> Result<()> {
        let mut state = self.lock();
        let key = (session_id.to_string(), tier);
        state.usage.remove(&key);
        state.cache.remove(&key);
        Ok(())
    }

    /// Start a new budget period for every tier of a session
    pub fn reset_session(&self, session_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.usage.retain(|(session, _), _| session != session_id);
        state.cache.retain(|(session, _), _| session != session_id);
        Ok(())
    }

    /// Usage recorded for a pair (0 if unseen)
    pub fn usage(&self, session_id: &str, tier: Lane) -> Result<f64> {
        let state = self.lock();
        Ok(state
            .usage
            .get(&(session_id.to_string(), tier))
            .copied()
            .unwrap_or(0.0))
    }

    /// Drop every cached effective ceiling
    pub fn clear_cache(&self) -> Result<()> {
        self.lock().cache.clear();
        Ok(())
    }

    pub fn cache_size(&self) -> Result<usize> {
        Ok(self.lock().cache.len())
    }

    /// Export budget state for dashboards
    ///
    /// Read-only: nothing is evaluated into the cache, so repeated calls
    /// without usage changes return identical values.
    pub fn snapshot(&self) -> Result<FinOpsSnapshot> {
        let state = self.lock();

        let mut sessions: BTreeMap<Lane, BTreeMap<&str, SessionBudgetSnapshot>> = BTreeMap::new();
        for (session, tier) in state.usage.keys().chain(state.cache.keys()) {
            let key = (session.clone(), *tier);
            sessions
                .entry(*tier)
                .or_default()
                .entry(session.as_str())
                .or_insert_with(|| SessionBudgetSnapshot {
                    session_id: session.clone(),
                    usage: state.usage.get(&key).copied().unwrap_or(0.0),
                    effective_amount: state.cache.get(&key).copied(),
                });
        }

        let tiers = self
            .config
            .budgets
            .iter()
            .map(|(tier, budget)| TierSnapshot {
                tier: *tier,
                configured_amount: budget.amount,
                currency: budget.currency.clone(),
                adaptive_enabled: budget.is_adaptive(),
                effective_amount: effective_amount(budget, 0.0, self.signal_for(*tier, budget)),
                sessions: sessions
                    .remove(tier)
                    .map(|s| s.into_values().collect())
                    .unwrap_or_default(),
            })
            .collect();

        Ok(FinOpsSnapshot {
            tiers,
            cache_size: state.cache.len(),
        })
    }
}

/// Add to a pair's usage and invalidate its cached ceiling
fn charge(state: &mut LedgerState, key: LedgerKey, amount: f64) -> f64 {
    state.cache.remove(&key);
    let usage = state.usage.entry(key).or_insert(0.0);
    *usage += amount;
    *usage
}
