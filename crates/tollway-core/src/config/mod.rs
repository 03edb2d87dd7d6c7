//! Configuration management with file persistence

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::finops::{
    AlertRule, DegradationPolicy, FinOpsABExperiment, FinOpsAdaptiveBudget, FinOpsBudget,
};
use crate::routing::{DEFAULT_EXPLORATION_CONSTANT, Lane, RoutingStrategy};

/// Tollway configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub finops: FinOpsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Strategy used when a caller passes an empty id
    #[serde(default = "default_strategy")]
    pub default_strategy: String,
    /// Minimum share guaranteed to a failover route
    #[serde(default = "default_failover_reserve")]
    pub failover_reserve: f64,
    #[serde(default = "default_exploration_constant")]
    pub exploration_constant: f64,
    /// Seed for sampled Thompson draws; posterior means are used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thompson_seed: Option<u64>,
    /// Named strategies resolved before the built-ins
    #[serde(default)]
    pub strategies: BTreeMap<String, StrategyDefinition>,
}

fn default_strategy() -> String {
    RoutingStrategy::Thompson.as_str().to_string()
}

fn default_failover_reserve() -> f64 {
    0.10
}

fn default_exploration_constant() -> f64 {
    DEFAULT_EXPLORATION_CONSTANT
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_strategy: default_strategy(),
            failover_reserve: default_failover_reserve(),
            exploration_constant: default_exploration_constant(),
            thompson_seed: None,
            strategies: BTreeMap::new(),
        }
    }
}

/// A named strategy: a built-in kind plus optional bandit overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDefinition {
    pub kind: RoutingStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exploration_constant: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thompson_seed: Option<u64>,
}

impl StrategyDefinition {
    pub fn new(kind: RoutingStrategy) -> Self {
        Self {
            kind,
            exploration_constant: None,
            thompson_seed: None,
        }
    }

    /// Whether the definition changes bandit parameters
    pub fn has_overrides(&self) -> bool {
        self.exploration_constant.is_some() || self.thompson_seed.is_some()
    }
}

impl RoutingConfig {
    /// Whether an id names a registered or built-in strategy
    pub fn knows_strategy(&self, id: &str) -> bool {
        self.strategies.contains_key(id) || id.parse::<RoutingStrategy>().is_ok()
    }

    pub fn validate(&self) -> Result<()> {
        if !self.knows_strategy(&self.default_strategy) {
            return Err(Error::InvalidStrategy(self.default_strategy.clone()));
        }
        if !(0.0..1.0).contains(&self.failover_reserve) {
            return Err(Error::ValidationError(format!(
                "routing.failover_reserve must be in [0, 1), got {}",
                self.failover_reserve
            )));
        }
        if !(self.exploration_constant.is_finite() && self.exploration_constant >= 0.0) {
            return Err(Error::ValidationError(format!(
                "routing.exploration_constant must be >= 0, got {}",
                self.exploration_constant
            )));
        }
        for (id, definition) in &self.strategies {
            if id.trim().is_empty() {
                return Err(Error::ValidationError(
                    "strategy ids must not be empty".to_string(),
                ));
            }
            if let Some(c) = definition.exploration_constant
                && !(c.is_finite() && c >= 0.0)
            {
                return Err(Error::ValidationError(format!(
                    "strategy '{}' has a negative exploration_constant",
                    id
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinOpsConfig {
    /// Static ceiling per tier
    #[serde(default)]
    pub budgets: BTreeMap<Lane, FinOpsBudget>,
    #[serde(default)]
    pub alert_rules: Vec<AlertRule>,
    /// A/B history informing adaptive budgets and call estimates
    #[serde(default)]
    pub experiments: Vec<FinOpsABExperiment>,
    /// Applied when every candidate tier is over budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degradation: Option<DegradationPolicy>,
    /// Per-call estimate when nothing more specific is known
    #[serde(default = "default_estimated_cost")]
    pub default_estimated_cost: f64,
}

fn default_estimated_cost() -> f64 {
    0.01
}

impl Default for FinOpsConfig {
    fn default() -> Self {
        let mut budgets = BTreeMap::new();
        budgets.insert(Lane::Economy, FinOpsBudget::new(5.0));
        budgets.insert(
            Lane::Balanced,
            FinOpsBudget::new(20.0).with_adaptive(
                FinOpsAdaptiveBudget::new(0.6, 10.0, 30.0).with_steps(25.0, 25.0),
            ),
        );
        budgets.insert(Lane::Premium, FinOpsBudget::new(50.0));

        Self {
            budgets,
            alert_rules: vec![AlertRule {
                name: "utilization-80".to_string(),
                threshold: 0.8,
                tiers: Vec::new(),
            }],
            experiments: Vec::new(),
            degradation: None,
            default_estimated_cost: default_estimated_cost(),
        }
    }
}

impl FinOpsConfig {
    /// Empty config with no budgets, alerts or experiments
    pub fn empty() -> Self {
        Self {
            budgets: BTreeMap::new(),
            alert_rules: Vec::new(),
            experiments: Vec::new(),
            degradation: None,
            default_estimated_cost: default_estimated_cost(),
        }
    }

    pub fn with_budget(mut self, tier: Lane, budget: FinOpsBudget) -> Self {
        self.budgets.insert(tier, budget);
        self
    }

    pub fn validate(&self) -> Result<()> {
        for (tier, budget) in &self.budgets {
            budget.validate(*tier)?;
        }
        for rule in &self.alert_rules {
            if !(rule.threshold > 0.0 && rule.threshold <= 1.0) {
                return Err(Error::ValidationError(format!(
                    "alert rule '{}' threshold must be in (0, 1], got {}",
                    rule.name, rule.threshold
                )));
            }
        }
        for experiment in &self.experiments {
            experiment.validate()?;
        }
        if let Some(DegradationPolicy::Fallback { tier }) = &self.degradation
            && !self.budgets.contains_key(tier)
        {
            return Err(Error::ConfigurationError(format!(
                "degradation fallback tier '{}' has no configured budget",
                tier
            )));
        }
        if !(self.default_estimated_cost.is_finite() && self.default_estimated_cost >= 0.0) {
            return Err(Error::ValidationError(
                "finops.default_estimated_cost must be >= 0".to_string(),
            ));
        }
        Ok(())
    }
}

const BUDGET_FIELDS: [&str; 9] = [
    "amount",
    "default_estimate",
    "adaptive.enabled",
    "adaptive.target_utilization",
    "adaptive.min_amount",
    "adaptive.max_amount",
    "adaptive.max_increase_pct",
    "adaptive.max_decrease_pct",
    "adaptive.lookback_days",
];

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("TOLLWAY_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("tollway")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or the defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load and validate configuration from an explicit path
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.routing.validate()?;
        self.finops.validate()?;
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "routing.default_strategy" => Ok(self.routing.default_strategy.clone()),
            "routing.failover_reserve" => Ok(self.routing.failover_reserve.to_string()),
            "routing.exploration_constant" => Ok(self.routing.exploration_constant.to_string()),
            "routing.thompson_seed" => Ok(self
                .routing
                .thompson_seed
                .map(|s| s.to_string())
                .unwrap_or_else(|| "none".to_string())),

            "finops.default_estimated_cost" => Ok(self.finops.default_estimated_cost.to_string()),
            "finops.degradation" => Ok(match &self.finops.degradation {
                None => "none".to_string(),
                Some(DegradationPolicy::Fallback { tier }) => format!("fallback:{}", tier),
                Some(DegradationPolicy::Throttle { retry_after_secs }) => {
                    format!("throttle:{}", retry_after_secs)
                }
            }),

            _ => match parse_budget_key(key) {
                Some((tier, field)) => self.get_budget_field(tier, field),
                None => Err(unknown_key(key)),
            },
        }
    }

    fn get_budget_field(&self, tier: Lane, field: &str) -> anyhow::Result<String> {
        let budget = self
            .finops
            .budgets
            .get(&tier)
            .ok_or_else(|| anyhow!("No budget configured for tier '{}'", tier))?;

        let adaptive = budget.adaptive.as_ref();
        let adaptive_value = |f: fn(&FinOpsAdaptiveBudget) -> String| {
            adaptive.map(f).unwrap_or_else(|| "none".to_string())
        };

        let value = match field {
            "amount" => budget.amount.to_string(),
            "default_estimate" => budget
                .default_estimate
                .map(|e| e.to_string())
                .unwrap_or_else(|| "none".to_string()),
            "adaptive.enabled" => budget.is_adaptive().to_string(),
            "adaptive.target_utilization" => adaptive_value(|a| a.target_utilization.to_string()),
            "adaptive.min_amount" => adaptive_value(|a| a.min_amount.to_string()),
            "adaptive.max_amount" => adaptive_value(|a| a.max_amount.to_string()),
            "adaptive.max_increase_pct" => adaptive_value(|a| a.max_increase_pct.to_string()),
            "adaptive.max_decrease_pct" => adaptive_value(|a| a.max_decrease_pct.to_string()),
            "adaptive.lookback_days" => adaptive_value(|a| a.lookback_days.to_string()),
            _ => return Err(unknown_key(&format!("finops.budgets.{}.{}", tier, field))),
        };
        Ok(value)
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "routing.default_strategy" => {
                if !self.routing.knows_strategy(value) {
                    return Err(Error::InvalidStrategy(value.to_string()).into());
                }
                self.routing.default_strategy = value.to_string();
            }
            "routing.failover_reserve" => {
                let reserve: f64 = parse_number(key, value)?;
                if !(0.0..1.0).contains(&reserve) {
                    return Err(anyhow!("Failover reserve must be in [0.0, 1.0)"));
                }
                self.routing.failover_reserve = reserve;
            }
            "routing.exploration_constant" => {
                let c: f64 = parse_number(key, value)?;
                if c < 0.0 {
                    return Err(anyhow!("Exploration constant must be non-negative"));
                }
                self.routing.exploration_constant = c;
            }
            "routing.thompson_seed" => {
                self.routing.thompson_seed = if value.eq_ignore_ascii_case("none") {
                    None
                } else {
                    Some(parse_number(key, value)?)
                };
            }

            "finops.default_estimated_cost" => {
                let cost: f64 = parse_number(key, value)?;
                if cost < 0.0 {
                    return Err(anyhow!("Default estimated cost must be non-negative"));
                }
                self.finops.default_estimated_cost = cost;
            }
            "finops.degradation" => {
                self.finops.degradation = parse_degradation(value)?;
            }

            _ => match parse_budget_key(key) {
                Some((tier, field)) => self.set_budget_field(tier, field, value)?,
                None => return Err(unknown_key(key)),
            },
        }
        Ok(())
    }

    fn set_budget_field(&mut self, tier: Lane, field: &str, value: &str) -> anyhow::Result<()> {
        let key = format!("finops.budgets.{}.{}", tier, field);

        if field == "amount" {
            let amount: f64 = parse_number(&key, value)?;
            if !(amount.is_finite() && amount > 0.0) {
                return Err(anyhow!("Budget amount must be a positive number"));
            }
            self.finops
                .budgets
                .entry(tier)
                .and_modify(|b| b.amount = amount)
                .or_insert_with(|| FinOpsBudget::new(amount));
            return Ok(());
        }

        // Edit a copy so a rejected value leaves the stored budget untouched
        let mut budget = self
            .finops
            .budgets
            .get(&tier)
            .cloned()
            .ok_or_else(|| anyhow!("Set finops.budgets.{}.amount first", tier))?;

        if field == "default_estimate" {
            budget.default_estimate = if value.eq_ignore_ascii_case("none") {
                None
            } else {
                Some(parse_number(&key, value)?)
            };
        } else {
            let amount = budget.amount;
            let adaptive = budget
                .adaptive
                .get_or_insert_with(|| FinOpsAdaptiveBudget::new(0.6, amount * 0.5, amount * 1.5));

            match field {
                "adaptive.enabled" => {
                    adaptive.enabled = value
                        .parse()
                        .with_context(|| format!("Invalid boolean for {}: {}", key, value))?;
                }
                "adaptive.target_utilization" => adaptive.target_utilization = parse_number(&key, value)?,
                "adaptive.min_amount" => adaptive.min_amount = parse_number(&key, value)?,
                "adaptive.max_amount" => adaptive.max_amount = parse_number(&key, value)?,
                "adaptive.max_increase_pct" => adaptive.max_increase_pct = parse_number(&key, value)?,
                "adaptive.max_decrease_pct" => adaptive.max_decrease_pct = parse_number(&key, value)?,
                "adaptive.lookback_days" => adaptive.lookback_days = parse_number(&key, value)?,
                _ => return Err(unknown_key(&key)),
            }
        }

        budget.validate(tier)?;
        self.finops.budgets.insert(tier, budget);
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let mut keys: Vec<String> = [
            "routing.default_strategy",
            "routing.failover_reserve",
            "routing.exploration_constant",
            "routing.thompson_seed",
            "finops.default_estimated_cost",
            "finops.degradation",
        ]
        .iter()
        .map(|k| k.to_string())
        .collect();

        for tier in self.finops.budgets.keys() {
            keys.extend(
                BUDGET_FIELDS
                    .iter()
                    .map(|field| format!("finops.budgets.{}.{}", tier, field)),
            );
        }

        keys.into_iter()
            .map(|key| {
                let value = self.get(&key)?;
                Ok((key, value))
            })
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}

fn unknown_key(key: &str) -> anyhow::Error {
    anyhow!(
        "Unknown configuration key: {}. Use `tollway config list` to see available keys.",
        key
    )
}

fn parse_number<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: {}", key, value))
}

/// Split `finops.budgets.<tier>.<field>` into its parts
fn parse_budget_key(key: &str) -> Option<(Lane, &str)> {
    let rest = key.strip_prefix("finops.budgets.")?;
    let (tier, field) = rest.split_once('.')?;
    let tier = tier.parse().ok()?;
    Some((tier, field))
}

fn parse_degradation(value: &str) -> anyhow::Result<Option<DegradationPolicy>> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    match value.split_once(':') {
        Some(("fallback", tier)) => {
            let tier: Lane = tier.parse().map_err(|e: String| anyhow!(e))?;
            Ok(Some(DegradationPolicy::Fallback { tier }))
        }
        Some(("throttle", secs)) => Ok(Some(DegradationPolicy::Throttle {
            retry_after_secs: parse_number("finops.degradation", secs)?,
        })),
        _ => Err(anyhow!(
            "Invalid degradation policy: {}. Use none, fallback:<tier> or throttle:<seconds>",
            value
        )),
    }
}
