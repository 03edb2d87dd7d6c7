//! Error types for Tollway

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::Lane;

/// Result type alias using Tollway's Error
pub type Result<T> = std::result::Result<T, Error>;

/// How far a single tier was from admitting a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierShortfall {
    /// The tier that was attempted
    pub tier: Lane,
    /// Effective budget at the time of the attempt
    pub effective_budget: f64,
    /// Usage already recorded for the (session, tier) pair
    pub current_usage: f64,
    /// Estimated cost of the rejected call
    pub estimated_cost: f64,
}

impl TierShortfall {
    /// Amount by which the call would overrun the effective budget
    pub fn shortfall(&self) -> f64 {
        (self.current_usage + self.estimated_cost - self.effective_budget).max(0.0)
    }
}

fn describe_attempts(attempts: &[TierShortfall]) -> String {
    attempts
        .iter()
        .map(|a| format!("{} short by ${:.4}", a.tier, a.shortfall()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Tollway error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Routing errors (E100-E199)
    #[error("Unknown routing strategy '{0}'. Valid built-ins: thompson, ucb, cost_optimized, latency_optimized, capacity_weighted, reliability_weighted.")]
    InvalidStrategy(String),

    // Configuration errors (E200-E299)
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    // Budget errors (E300-E399)
    #[error("FinOps budget exceeded for every candidate tier ({})", describe_attempts(.attempts))]
    FinOpsBudgetExceeded {
        attempts: Vec<TierShortfall>,
        retry_after_secs: Option<u64>,
    },

    // Input errors (E400-E499)
    #[error("Validation error: {0}")]
    ValidationError(String),

    // Storage errors (E500-E599)
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidStrategy(_) => "E100",
            Self::ConfigurationError(_) => "E200",
            Self::FinOpsBudgetExceeded { .. } => "E300",
            Self::ValidationError(_) => "E400",
            Self::DatabaseError(_) => "E500",
            Self::Serialization(_) => "E501",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Whether the boundary layer should report this as a caller mistake (4xx)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidStrategy(_) | Self::ValidationError(_) | Self::FinOpsBudgetExceeded { .. }
        )
    }

    /// Retry-after guidance attached by the throttle degradation policy
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::FinOpsBudgetExceeded {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::InvalidStrategy(_) => Some("tollway config get routing.default_strategy".to_string()),
            Self::ConfigurationError(_) => Some("tollway config list".to_string()),
            Self::FinOpsBudgetExceeded {
                retry_after_secs: Some(secs),
                ..
            } => Some(format!("Retry after {} seconds", secs)),
            Self::FinOpsBudgetExceeded { attempts, .. } => attempts.first().map(|a| {
                format!(
                    "tollway config set finops.budgets.{}.amount {:.2}",
                    a.tier,
                    a.current_usage + a.estimated_cost
                )
            }),
            _ => None,
        }
    }
}
