//! Tollway Core Integration Tests

use std::sync::Arc;
use std::thread;

use tollway_core::{
    Error,
    config::{FinOpsConfig, RoutingConfig},
    dispatch::Dispatcher,
    finops::{
        ExecutionRequest, FinOpsABExperiment, FinOpsAdaptiveBudget, FinOpsBudget,
        FinOpsController, FinOpsVariant, MemoryReporter, NullReporter, names,
    },
    routing::{
        FixedWeightEngine, Lane, ProviderRegistry, RouteCandidate, RoutingPlanner,
        RoutingSimulationResponse, RunRecord, SqliteTelemetryStore, TelemetryBreakdown,
        TelemetrySnapshot,
    },
};

fn adaptive_controller() -> FinOpsController {
    let budget = FinOpsBudget::new(100.0).with_adaptive(FinOpsAdaptiveBudget::new(0.6, 50.0, 150.0));
    FinOpsController::new(FinOpsConfig::empty().with_budget(Lane::Balanced, budget)).unwrap()
}

fn planner() -> RoutingPlanner {
    RoutingPlanner::new(RoutingConfig::default(), Arc::new(TelemetrySnapshot::new()))
}

#[test]
fn test_adaptive_budget_end_to_end() {
    let controller = adaptive_controller();
    let budget = controller.config().budgets[&Lane::Balanced].clone();

    let idle = controller.effective_budget("s-1", Lane::Balanced, &budget).unwrap();
    assert!(idle >= 100.0, "idle budget shrank to {}", idle);

    controller.record_usage("s-1", Lane::Balanced, 90.0).unwrap();
    let busy = controller.effective_budget("s-1", Lane::Balanced, &budget).unwrap();
    assert!(busy <= 100.0, "busy budget grew to {}", busy);
    assert!((50.0..=150.0).contains(&busy));
}

#[test]
fn test_effective_budget_monotone_in_usage() {
    let budget = FinOpsBudget::new(100.0).with_adaptive(
        FinOpsAdaptiveBudget::new(0.6, 50.0, 150.0)
            .with_steps(40.0, 60.0)
            .with_weights(0.5, 0.5)
            .with_latency_threshold(1000.0),
    );
    let experiment = FinOpsABExperiment {
        id: "balanced-q3".to_string(),
        lane: Lane::Balanced,
        concluded_at: None,
        variants: vec![
            FinOpsVariant::new("control", 0.5, 0.04, 1400.0),
            FinOpsVariant::new("candidate", 0.5, 0.02, 800.0).winner(),
        ],
    };
    let mut config = FinOpsConfig::empty().with_budget(Lane::Balanced, budget.clone());
    config.experiments.push(experiment);
    let controller = FinOpsController::new(config).unwrap();

    let mut previous = f64::INFINITY;
    for _ in 0..40 {
        let amount = controller.effective_budget("s", Lane::Balanced, &budget).unwrap();
        assert!(amount <= previous + 1e-12);
        assert!((50.0..=150.0).contains(&amount));
        previous = amount;
        controller.record_usage("s", Lane::Balanced, 5.0).unwrap();
    }
}

#[test]
fn test_prepare_execution_then_exceeded() {
    let controller = FinOpsController::new(
        FinOpsConfig::empty().with_budget(Lane::Economy, FinOpsBudget::new(10.0)),
    )
    .unwrap();
    let reporter = MemoryReporter::new();

    let request = ExecutionRequest::new("translate", vec![Lane::Economy])
        .with_estimated_cost(7.5)
        .with_session("tenant-a");

    let decision = controller.prepare_execution(&request, &reporter).unwrap();
    assert_eq!(decision.tier, Lane::Economy);
    assert_eq!(controller.usage("tenant-a", Lane::Economy).unwrap(), 7.5);

    let admitted = reporter.named(names::ADMITTED);
    assert_eq!(admitted.len(), 1);
    assert_eq!(admitted[0].estimated_cost, 7.5);
    assert_eq!(admitted[0].effective_budget, 10.0);

    let err = controller.prepare_execution(&request, &reporter).unwrap_err();
    assert!(matches!(err, Error::FinOpsBudgetExceeded { .. }));
    assert!(err.is_client_error());
    assert_eq!(controller.usage("tenant-a", Lane::Economy).unwrap(), 7.5);
}

#[test]
fn test_snapshot_idempotent_and_counts_pairs() {
    let controller = adaptive_controller();
    let budget = controller.config().budgets[&Lane::Balanced].clone();

    for session in ["a", "b", "c"] {
        controller.effective_budget(session, Lane::Balanced, &budget).unwrap();
    }
    // Re-evaluating a pair does not grow the cache
    controller.effective_budget("a", Lane::Balanced, &budget).unwrap();

    let first = controller.snapshot().unwrap();
    let second = controller.snapshot().unwrap();
    assert_eq!(first, second);
    assert_eq!(first.cache_size, 3);

    let balanced = &first.tiers[0];
    assert_eq!(balanced.tier, Lane::Balanced);
    assert_eq!(balanced.configured_amount, 100.0);
    assert!(balanced.adaptive_enabled);
    assert!(balanced.effective_amount >= 100.0);

    controller.clear_cache().unwrap();
    assert_eq!(controller.snapshot().unwrap().cache_size, 0);
}

#[test]
fn test_concurrent_admission_never_overspends() {
    let controller = Arc::new(
        FinOpsController::new(
            FinOpsConfig::empty().with_budget(Lane::Premium, FinOpsBudget::new(10.0)),
        )
        .unwrap(),
    );

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let controller = Arc::clone(&controller);
            thread::spawn(move || {
                let request = ExecutionRequest::new("embed", vec![Lane::Premium])
                    .with_estimated_cost(1.0)
                    .with_session("shared");
                (0..4)
                    .filter(|_| controller.prepare_execution(&request, &NullReporter).is_ok())
                    .count()
            })
        })
        .collect();

    let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(admitted, 10);
    assert_eq!(controller.usage("shared", Lane::Premium).unwrap(), 10.0);
}

#[tokio::test]
async fn test_mocked_weights_favor_heavier_route() {
    let candidates = vec![
        RouteCandidate::new("routeA", "alpha", Lane::Balanced)
            .with_cost(3.0)
            .with_latency(800.0)
            .with_capacity(500.0),
        RouteCandidate::new("routeB", "beta", Lane::Balanced)
            .with_cost(3.0)
            .with_latency(800.0)
            .with_capacity(500.0),
    ];
    let engine = FixedWeightEngine::new([("routeA".to_string(), 1.0), ("routeB".to_string(), 3.0)]);
    let planner = planner().with_weight_engine(Arc::new(engine));

    let plan = planner
        .compute_plan(&candidates, "thompson", None, 20.0)
        .await
        .unwrap();

    assert!(plan.share_of("routeB") > plan.share_of("routeA"));
    assert!((plan.total_share() - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_every_strategy_sums_to_one() {
    let registry = ProviderRegistry::with_defaults();
    let planner = planner();

    for lane in Lane::ALL {
        let candidates = registry.candidates(lane);
        for strategy in [
            "thompson",
            "ucb",
            "cost_optimized",
            "latency_optimized",
            "capacity_weighted",
            "reliability_weighted",
        ] {
            for volume in [0.0, 50.0, 1000.0] {
                let plan = planner
                    .compute_plan(&candidates, strategy, Some(candidates[0].id.as_str()), volume)
                    .await
                    .unwrap();
                assert!(
                    (plan.total_share() - 1.0).abs() < 1e-9,
                    "{} / {} / {} sums to {}",
                    lane,
                    strategy,
                    volume,
                    plan.total_share()
                );
                assert!(plan.distribution.iter().all(|e| (0.0..=1.0 + 1e-12).contains(&e.share)));
            }
        }
    }
}

async fn simulate_balanced(
    registry: &ProviderRegistry,
    telemetry: &TelemetrySnapshot,
) -> (String, String) {
    let planner = RoutingPlanner::new(RoutingConfig::default(), Arc::new(telemetry.clone()));
    let plan = planner
        .compute_plan(&registry.candidates(Lane::Balanced), "thompson", None, 25.0)
        .await
        .unwrap();
    let response = RoutingSimulationResponse::from_plan(Lane::Balanced, &plan);
    (response.to_fixture_json().unwrap(), response.fingerprint().unwrap())
}

#[tokio::test]
async fn test_fixture_generation_is_reproducible() {
    let registry = ProviderRegistry::with_defaults();
    let telemetry = TelemetrySnapshot::from_breakdowns(vec![
        TelemetryBreakdown::new("balanced-claude-haiku").with_runs(120, 0.96),
        TelemetryBreakdown::new("balanced-gpt-4o").with_runs(120, 0.82),
    ]);

    let (json_a, fp_a) = simulate_balanced(&registry, &telemetry).await;
    let (json_b, fp_b) = simulate_balanced(&registry, &telemetry).await;
    assert_eq!(json_a, json_b);
    assert_eq!(fp_a, fp_b);
    assert!(json_a.contains("balanced-claude-haiku"));
}

#[tokio::test]
async fn test_sqlite_telemetry_feeds_planner() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteTelemetryStore::connect(&dir.path().join("telemetry.db"))
        .await
        .unwrap();
    store.init().await.unwrap();

    for i in 0..50 {
        store
            .record_run(&RunRecord::new("good", true).with_tokens(1000, 500).with_cost(0.002))
            .await
            .unwrap();
        store
            .record_run(&RunRecord::new("flaky", i % 2 == 0).with_tokens(1000, 500).with_cost(0.002))
            .await
            .unwrap();
    }

    let candidates = vec![
        RouteCandidate::new("good", "p", Lane::Economy),
        RouteCandidate::new("flaky", "q", Lane::Economy),
    ];
    let planner = RoutingPlanner::new(RoutingConfig::default(), Arc::new(store));
    let plan = planner
        .compute_plan(&candidates, "thompson", None, 0.0)
        .await
        .unwrap();

    assert!(plan.share_of("good") > plan.share_of("flaky"));
}

#[tokio::test]
async fn test_dispatch_admits_then_routes() {
    let controller = Arc::new(
        FinOpsController::new(FinOpsConfig::default()).unwrap(),
    );
    let routing = RoutingConfig {
        thompson_seed: Some(42),
        ..RoutingConfig::default()
    };
    let planner = Arc::new(RoutingPlanner::new(routing, Arc::new(TelemetrySnapshot::new())));
    let dispatcher = Dispatcher::new(controller, planner, ProviderRegistry::with_defaults());
    let reporter = MemoryReporter::new();

    let request = ExecutionRequest::new("chat", vec![Lane::Premium])
        .with_estimated_cost(0.25)
        .with_failover("premium-claude-opus");
    let decision = dispatcher.dispatch(&request, &reporter).await.unwrap();

    let route = decision.route.expect("premium lane has routes");
    assert_eq!(route.lane, Lane::Premium);
    assert_eq!(reporter.named(names::ROUTE_SELECTED).len(), 1);
}
