//! Observability sinks for FinOps and routing events
//!
//! Reporters are called on the decision path, so `emit` must never block or
//! fail. Sinks that do real I/O sit behind a bounded channel and drop events
//! when it is full.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::routing::Lane;

/// Event names emitted by the core
pub mod names {
    pub const ADMITTED: &str = "finops.admitted";
    pub const DEGRADED: &str = "finops.degraded";
    pub const REJECTED: &str = "finops.rejected";
    pub const ALERT: &str = "finops.alert";
    pub const ROUTE_SELECTED: &str = "routing.selected";
}

/// Structured event handed to a reporter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinOpsEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Lane>,
    pub effective_budget: f64,
    pub estimated_cost: f64,
    /// Usage recorded for (session, tier) after the event
    pub usage: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub route_ids: Vec<String>,
    /// Alert rule name or other free-form detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl FinOpsEvent {
    pub fn new(name: &str, session_id: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            name: name.to_string(),
            session_id: session_id.into(),
            tier: None,
            effective_budget: 0.0,
            estimated_cost: 0.0,
            usage: 0.0,
            route_ids: Vec::new(),
            detail: None,
        }
    }

    pub fn with_tier(mut self, tier: Lane) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn with_amounts(mut self, effective_budget: f64, estimated_cost: f64, usage: f64) -> Self {
        self.effective_budget = effective_budget;
        self.estimated_cost = estimated_cost;
        self.usage = usage;
        self
    }

    pub fn with_routes(mut self, route_ids: Vec<String>) -> Self {
        self.route_ids = route_ids;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Sink for structured events
pub trait ObservabilityReporter: Send + Sync {
    /// Hand off an event; must not block
    fn emit(&self, event: FinOpsEvent);
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullReporter;

impl ObservabilityReporter for NullReporter {
    fn emit(&self, _event: FinOpsEvent) {}
}

/// Writes events as `tracing` records
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ObservabilityReporter for TracingReporter {
    fn emit(&self, event: FinOpsEvent) {
        let tier = event.tier.map(|t| t.as_str()).unwrap_or("-");
        let routes = event.route_ids.join(",");
        if event.name == names::ALERT || event.name == names::REJECTED {
            warn!(
                event = %event.name,
                session_id = %event.session_id,
                tier,
                effective_budget = event.effective_budget,
                estimated_cost = event.estimated_cost,
                usage = event.usage,
                detail = event.detail.as_deref().unwrap_or(""),
                "FinOps event"
            );
        } else {
            info!(
                event = %event.name,
                session_id = %event.session_id,
                tier,
                effective_budget = event.effective_budget,
                estimated_cost = event.estimated_cost,
                usage = event.usage,
                routes = %routes,
                "FinOps event"
            );
        }
    }
}

/// Keeps events in memory; handy for tests and one-shot commands
#[derive(Debug, Default)]
pub struct MemoryReporter {
    events: Mutex<Vec<FinOpsEvent>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything emitted so far
    pub fn events(&self) -> Vec<FinOpsEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Events with a given name
    pub fn named(&self, name: &str) -> Vec<FinOpsEvent> {
        self.events().into_iter().filter(|e| e.name == name).collect()
    }
}

impl ObservabilityReporter for MemoryReporter {
    fn emit(&self, event: FinOpsEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Forwards events over a bounded channel, dropping them when it is full
#[derive(Debug)]
pub struct ChannelReporter {
    tx: mpsc::Sender<FinOpsEvent>,
    dropped: AtomicU64,
}

impl ChannelReporter {
    /// Create a reporter and the receiving end of its channel
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<FinOpsEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events lost because the channel was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ObservabilityReporter for ChannelReporter {
    fn emit(&self, event: FinOpsEvent) {
        if let Err(err) = self.tx.try_send(event) {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(dropped = total, error = %err, "Dropped observability event");
        }
    }
}

/// Default location of the event log
pub fn events_file_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tollway")
        .join("finops-events.jsonl")
}

/// Drain a channel into a JSONL file until every sender is gone
///
/// Resolves to the number of events written.
pub fn spawn_jsonl_writer(
    mut rx: mpsc::Receiver<FinOpsEvent>,
    path: impl AsRef<Path>,
) -> JoinHandle<Result<u64>> {
    let path = path.as_ref().to_path_buf();
    tokio::spawn(async move {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let mut written = 0u64;
        while let Some(event) = rx.recv().await {
            let mut line = serde_json::to_vec(&event)?;
            line.push(b'\n');
            file.write_all(&line).await?;
            written += 1;
        }
        file.flush().await?;

        info!(events = written, path = %path.display(), "Event writer finished");
        Ok(written)
    })
}
