//! Provider registry: route candidates per lane

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::types::{Lane, RouteCandidate};
use crate::error::{Error, Result};

/// On-disk layout of a provider registry file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryFile {
    #[serde(default)]
    pub routes: Vec<RouteCandidate>,
}

/// Catalogue of route candidates, ordered per lane by declaration
///
/// Cloning shares the underlying catalogue; `reload` swaps it atomically.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    lanes: Arc<RwLock<Arc<BTreeMap<Lane, Vec<RouteCandidate>>>>>,
}

impl ProviderRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry from a list of candidates
    pub fn from_candidates(candidates: Vec<RouteCandidate>) -> Result<Self> {
        let registry = Self::new();
        registry.reload(candidates)?;
        Ok(registry)
    }

    /// Create a registry with a small demo catalogue
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        let defaults = vec![
            RouteCandidate::new("economy-mistral-small", "mistral", Lane::Economy)
                .with_cost(0.3)
                .with_latency(1400.0)
                .with_reliability(0.97)
                .with_capacity(400.0),
            RouteCandidate::new("economy-gpt-4o-mini", "openai", Lane::Economy)
                .with_cost(0.45)
                .with_latency(1100.0)
                .with_reliability(0.99)
                .with_capacity(600.0),
            RouteCandidate::new("balanced-claude-haiku", "anthropic", Lane::Balanced)
                .with_cost(2.4)
                .with_latency(900.0)
                .with_reliability(0.99)
                .with_capacity(300.0),
            RouteCandidate::new("balanced-gpt-4o", "openai", Lane::Balanced)
                .with_cost(6.25)
                .with_latency(1200.0)
                .with_reliability(0.98)
                .with_capacity(250.0),
            RouteCandidate::new("premium-claude-sonnet", "anthropic", Lane::Premium)
                .with_cost(9.0)
                .with_latency(1600.0)
                .with_reliability(0.995)
                .with_capacity(150.0),
            RouteCandidate::new("premium-claude-opus", "anthropic", Lane::Premium)
                .with_cost(45.0)
                .with_latency(3200.0)
                .with_reliability(0.995)
                .with_capacity(60.0),
        ];
        // The demo catalogue is valid by construction
        *registry.write() = Arc::new(group_by_lane(defaults));
        registry
    }

    /// Load a registry from a TOML file with `[[routes]]` tables
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let file: RegistryFile = toml::from_str(&contents).map_err(|e| {
            Error::ConfigurationError(format!(
                "Failed to parse provider registry {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_candidates(file.routes)
    }

    /// Replace the whole catalogue
    ///
    /// Rejects invalid candidates and duplicate route ids, leaving the
    /// previous catalogue in place.
    pub fn reload(&self, candidates: Vec<RouteCandidate>) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for candidate in &candidates {
            candidate.validate()?;
            if !seen.insert(candidate.id.clone()) {
                return Err(Error::ValidationError(format!(
                    "duplicate route id '{}' in provider registry",
                    candidate.id
                )));
            }
        }

        let count = candidates.len();
        *self.write() = Arc::new(group_by_lane(candidates));

        info!(routes = count, "Provider registry reloaded");
        Ok(())
    }

    /// Register a single candidate, appended to its lane
    ///
    /// A route with the same id is replaced. The read and the swap happen
    /// under one write guard, so concurrent registrations are not lost.
    pub fn register(&self, candidate: RouteCandidate) -> Result<()> {
        candidate.validate()?;

        let mut guard = self.write();
        let mut lanes = (**guard).clone();
        for routes in lanes.values_mut() {
            routes.retain(|c| c.id != candidate.id);
        }
        lanes.retain(|_, routes| !routes.is_empty());
        info!(route = %candidate.id, lane = %candidate.lane, "Route registered");
        lanes.entry(candidate.lane).or_default().push(candidate);
        *guard = Arc::new(lanes);
        Ok(())
    }

    /// Candidates for a lane, in declaration order
    pub fn candidates(&self, lane: Lane) -> Vec<RouteCandidate> {
        self.current().get(&lane).cloned().unwrap_or_default()
    }

    /// Look up a route by id
    pub fn get(&self, route_id: &str) -> Option<RouteCandidate> {
        self.current()
            .values()
            .flatten()
            .find(|c| c.id == route_id)
            .cloned()
    }

    /// Every candidate, lane by lane
    pub fn all(&self) -> Vec<RouteCandidate> {
        self.current().values().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.current().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn current(&self) -> Arc<BTreeMap<Lane, Vec<RouteCandidate>>> {
        let guard = self.lanes.read().unwrap_or_else(|poisoned| {
            warn!("Provider registry lock was poisoned, recovering");
            poisoned.into_inner()
        });
        Arc::clone(&*guard)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Arc<BTreeMap<Lane, Vec<RouteCandidate>>>> {
        self.lanes.write().unwrap_or_else(|poisoned| {
            warn!("Provider registry lock was poisoned, recovering");
            self.lanes.clear_poison();
            poisoned.into_inner()
        })
    }
}

fn group_by_lane(candidates: Vec<RouteCandidate>) -> BTreeMap<Lane, Vec<RouteCandidate>> {
    let mut lanes: BTreeMap<Lane, Vec<RouteCandidate>> = BTreeMap::new();
    for candidate in candidates {
        lanes.entry(candidate.lane).or_default().push(candidate);
    }
    lanes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_cover_every_lane() {
        let registry = ProviderRegistry::with_defaults();
        for lane in Lane::ALL {
            assert!(!registry.candidates(lane).is_empty(), "lane {} empty", lane);
        }
        assert!(registry.get("premium-claude-opus").is_some());
    }

    #[test]
    fn test_reload_preserves_declaration_order() {
        let registry = ProviderRegistry::from_candidates(vec![
            RouteCandidate::new("z", "p", Lane::Economy),
            RouteCandidate::new("a", "p", Lane::Economy),
        ])
        .unwrap();

        let ids: Vec<String> = registry
            .candidates(Lane::Economy)
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["z", "a"]);
    }

    #[test]
    fn test_reload_rejects_duplicates_and_keeps_previous() {
        let registry =
            ProviderRegistry::from_candidates(vec![RouteCandidate::new("a", "p", Lane::Economy)])
                .unwrap();

        let err = registry
            .reload(vec![
                RouteCandidate::new("b", "p", Lane::Economy),
                RouteCandidate::new("b", "q", Lane::Premium),
            ])
            .unwrap_err();

        assert!(matches!(err, Error::ValidationError(_)));
        assert!(registry.get("a").is_some());
    }

    #[test]
    fn test_register_replaces_same_id() {
        let registry = ProviderRegistry::new();
        registry
            .register(RouteCandidate::new("a", "p", Lane::Economy).with_cost(1.0))
            .unwrap();
        registry
            .register(RouteCandidate::new("a", "p", Lane::Economy).with_cost(2.0))
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a").unwrap().cost_per_million, 2.0);
    }

    #[test]
    fn test_concurrent_register_keeps_every_route() {
        let registry = ProviderRegistry::new();

        std::thread::scope(|scope| {
            for i in 0..16 {
                let registry = registry.clone();
                scope.spawn(move || {
                    registry
                        .register(RouteCandidate::new(format!("route-{i}"), "p", Lane::Balanced))
                        .unwrap();
                });
            }
        });

        assert_eq!(registry.len(), 16);
        assert_eq!(registry.candidates(Lane::Balanced).len(), 16);
    }

    #[test]
    fn test_register_moves_route_between_lanes() {
        let registry = ProviderRegistry::new();
        registry.register(RouteCandidate::new("a", "p", Lane::Economy)).unwrap();
        registry.register(RouteCandidate::new("a", "p", Lane::Premium)).unwrap();

        assert!(registry.candidates(Lane::Economy).is_empty());
        assert_eq!(registry.candidates(Lane::Premium).len(), 1);
    }

    #[test]
    fn test_registry_recovers_from_poisoned_lock() {
        let registry = ProviderRegistry::new();
        registry.register(RouteCandidate::new("a", "p", Lane::Economy)).unwrap();

        let lanes = Arc::clone(&registry.lanes);
        let result = std::thread::spawn(move || {
            let _guard = lanes.write().unwrap();
            panic!("writer panicked");
        })
        .join();
        assert!(result.is_err());

        registry
            .reload(vec![RouteCandidate::new("b", "p", Lane::Premium)])
            .unwrap();
        assert!(registry.get("a").is_none());
        assert!(registry.get("b").is_some());
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[[routes]]
id = "route-a"
provider = "alpha"
lane = "balanced"
cost_per_million = 2.0
latency_p95_ms = 900.0
capacity_score = 50.0

[[routes]]
id = "route-b"
provider = "beta"
lane = "balanced"
cost_per_million = 3.0
latency_p95_ms = 700.0
reliability = 0.95
capacity_score = 80.0
"#
        )
        .unwrap();

        let registry = ProviderRegistry::load_from(file.path()).unwrap();
        let balanced = registry.candidates(Lane::Balanced);
        assert_eq!(balanced.len(), 2);
        assert_eq!(balanced[0].reliability, 1.0);
        assert_eq!(balanced[1].reliability, 0.95);
    }
}
