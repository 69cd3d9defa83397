//! Integration tests for startup reconciliation.
//!
//! The registry lists every tenant ever onboarded; reconciliation must
//! recreate only those whose service is missing from the platform and
//! leave the rest (running or stopped) untouched.

mod common;

use std::sync::Arc;

use common::{lifecycle_config, service_name, tenant, Fleet, NETWORK};
use fleet_agent::platform::{MemoryPlatform, PlatformCall, WorkerBehavior};
use fleet_agent::registry::{MemoryRegistry, SqliteRegistry, TenantRegistry};
use fleet_agent::{PortRange, ReconcileOutcome, ReconciliationLoop, ServiceState};

fn creates(call: &PlatformCall) -> bool {
    matches!(call, PlatformCall::CreateService(_))
}

#[tokio::test(start_paused = true)]
async fn test_recreates_only_missing_services() {
    let fleet = Fleet::new();
    for id in ["u1", "u2", "u3"] {
        fleet.lifecycle.run(&tenant(id)).await.unwrap();
    }
    fleet.lifecycle.stop(&tenant("u2")).await.unwrap();
    fleet.platform.lose_service(&service_name("u3"));

    let reconciler = ReconciliationLoop::new(
        Arc::clone(&fleet.registry),
        Arc::clone(&fleet.lifecycle),
        4,
    );
    let report = reconciler.run_once().await.unwrap();

    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(
        report.outcome(&tenant("u1")),
        Some(&ReconcileOutcome::Present(ServiceState::Running))
    );
    assert_eq!(
        report.outcome(&tenant("u2")),
        Some(&ReconcileOutcome::Present(ServiceState::Stopped))
    );
    assert_eq!(report.outcome(&tenant("u3")), Some(&ReconcileOutcome::Recreated));
    assert_eq!(report.recreated(), 1);

    // Stopped tenants stay stopped; only u3 got a second create.
    assert_eq!(fleet.platform.count_calls(creates), 4);
    assert_eq!(
        fleet.platform.service(&service_name("u2")).unwrap().spec.replicas(),
        0
    );

    // The recreated worker keeps its original port.
    let spec = fleet.platform.service(&service_name("u3")).unwrap().spec;
    assert_eq!(spec.env_value("PORT"), Some("20002"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_recreation_does_not_stop_the_pass() {
    let platform = MemoryPlatform::new();
    platform.add_network(NETWORK);
    platform.set_behavior(&service_name("u1"), WorkerBehavior::NeverHealthy);

    let registry = Arc::new(MemoryRegistry::with_entries([
        (tenant("u1"), 20000),
        (tenant("u2"), 20001),
    ]));
    let fleet = Fleet::build(
        Arc::new(platform),
        registry,
        lifecycle_config(),
        PortRange::default(),
    );

    let reconciler = ReconciliationLoop::new(
        Arc::clone(&fleet.registry),
        Arc::clone(&fleet.lifecycle),
        2,
    );
    let report = reconciler.run_once().await.unwrap();

    assert_eq!(
        report.outcome(&tenant("u1")),
        Some(&ReconcileOutcome::RecreateFailed)
    );
    assert_eq!(report.outcome(&tenant("u2")), Some(&ReconcileOutcome::Recreated));
    assert_eq!(report.failed(), 1);

    assert!(fleet.platform.service(&service_name("u1")).is_none());
    let spec = fleet.platform.service(&service_name("u2")).unwrap().spec;
    assert_eq!(spec.env_value("PORT"), Some("20001"));
}

#[tokio::test(start_paused = true)]
async fn test_empty_registry() {
    let fleet = Fleet::new();
    let reconciler = ReconciliationLoop::new(
        Arc::clone(&fleet.registry),
        Arc::clone(&fleet.lifecycle),
        4,
    );

    let report = reconciler.run_once().await.unwrap();
    assert!(report.outcomes.is_empty());
    assert_eq!(fleet.platform.service_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_from_persistent_registry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry.db");

    // First agent run: onboard two tenants.
    {
        let platform = MemoryPlatform::new();
        platform.add_network(NETWORK);
        let registry: Arc<dyn TenantRegistry> = Arc::new(SqliteRegistry::open(&path).unwrap());
        let fleet = Fleet::build(
            Arc::new(platform),
            registry,
            lifecycle_config(),
            PortRange::default(),
        );
        fleet.lifecycle.run(&tenant("alice")).await.unwrap();
        fleet.lifecycle.run(&tenant("bob")).await.unwrap();
    }

    // The platform was wiped; the registry survived.
    let platform = MemoryPlatform::new();
    platform.add_network(NETWORK);
    let registry: Arc<dyn TenantRegistry> = Arc::new(SqliteRegistry::open(&path).unwrap());
    let fleet = Fleet::build(
        Arc::new(platform),
        registry,
        lifecycle_config(),
        PortRange::default(),
    );

    let reconciler = ReconciliationLoop::new(
        Arc::clone(&fleet.registry),
        Arc::clone(&fleet.lifecycle),
        4,
    );
    let report = reconciler.run_once().await.unwrap();
    assert_eq!(report.recreated(), 2);

    for (id, port) in [("alice", "20000"), ("bob", "20001")] {
        let spec = fleet.platform.service(&service_name(id)).unwrap().spec;
        assert_eq!(spec.env_value("PORT"), Some(port));
    }
}
