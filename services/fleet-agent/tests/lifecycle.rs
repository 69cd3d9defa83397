//! Integration tests for per-tenant worker lifecycle.
//!
//! Runs the lifecycle manager against the in-memory platform and registry
//! with tokio's clock paused, so health waits complete instantly while the
//! elapsed (virtual) time stays observable.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{lifecycle_config, service_name, tenant, Fleet, IMAGE, NETWORK};
use fleet_agent::platform::{
    MemoryPlatform, Platform, PlatformCall, ServiceSpec, WorkerBehavior, MANAGED_BY_LABEL,
    TENANT_LABEL,
};
use fleet_agent::registry::{MemoryRegistry, TenantRegistry};
use fleet_agent::{FleetError, PortRange, ServiceState};
use tokio::time::Instant;

fn creates(call: &PlatformCall) -> bool {
    matches!(call, PlatformCall::CreateService(_))
}

fn updates(call: &PlatformCall) -> bool {
    matches!(call, PlatformCall::UpdateService(_))
}

fn removes(call: &PlatformCall) -> bool {
    matches!(call, PlatformCall::RemoveService(_))
}

#[tokio::test(start_paused = true)]
async fn test_run_creates_volume_and_service() {
    let fleet = Fleet::with_platform(MemoryPlatform::with_behavior(WorkerBehavior::HealthyAfter(3)));
    let u1 = tenant("u1");
    let started = Instant::now();

    assert!(fleet.lifecycle.run(&u1).await.unwrap());
    assert!(started.elapsed() <= Duration::from_secs(10));

    assert_eq!(fleet.platform.volume_names(), vec!["worker-u1-data".to_string()]);

    let service = fleet.platform.service(&service_name("u1")).unwrap();
    let spec = &service.spec;
    assert_eq!(spec.replicas(), 1);
    assert_eq!(spec.image(), IMAGE);
    assert_eq!(spec.env_value("PORT"), Some("20000"));
    assert_eq!(spec.env_value("TENANT_ID"), Some("u1"));
    assert_eq!(spec.labels.get(TENANT_LABEL).map(String::as_str), Some("u1"));
    assert!(spec.labels.contains_key(MANAGED_BY_LABEL));

    let check = &spec.task_template.container_spec.health_check.as_ref().unwrap().test;
    assert!(check.iter().any(|p| p.contains("localhost:20000/health")));
    assert_eq!(spec.task_template.networks[0].target, NETWORK);
}

#[tokio::test(start_paused = true)]
async fn test_run_is_idempotent() {
    let fleet = Fleet::new();
    let u1 = tenant("u1");

    assert!(fleet.lifecycle.run(&u1).await.unwrap());
    assert!(fleet.lifecycle.run(&u1).await.unwrap());

    assert_eq!(fleet.platform.count_calls(creates), 1);
    assert_eq!(fleet.platform.service_count(), 1);
    assert_eq!(fleet.platform.volume_names().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_port_is_stable() {
    let fleet = Fleet::new();
    let u1 = tenant("u1");

    assert_eq!(fleet.lifecycle.get_port(&u1).await.unwrap(), None);
    fleet.lifecycle.run(&u1).await.unwrap();
    let port = fleet.lifecycle.get_port(&u1).await.unwrap();
    assert_eq!(port, Some(20000));

    fleet.lifecycle.run(&tenant("u2")).await.unwrap();
    fleet.lifecycle.stop(&u1).await.unwrap();
    fleet.lifecycle.run(&u1).await.unwrap();

    assert_eq!(fleet.lifecycle.get_port(&u1).await.unwrap(), port);
    assert_eq!(fleet.lifecycle.get_port(&tenant("u2")).await.unwrap(), Some(20001));
}

#[tokio::test(start_paused = true)]
async fn test_stop_then_run_scales_back_up() {
    let fleet = Fleet::new();
    let u1 = tenant("u1");
    fleet.lifecycle.run(&u1).await.unwrap();

    assert!(fleet.lifecycle.stop(&u1).await.unwrap());
    let status = fleet.lifecycle.get_status(&u1).await.unwrap().unwrap();
    assert_eq!(status.state, ServiceState::Stopped);
    assert_eq!(fleet.platform.service(&service_name("u1")).unwrap().spec.replicas(), 0);

    assert!(fleet.lifecycle.run(&u1).await.unwrap());
    let status = fleet.lifecycle.get_status(&u1).await.unwrap().unwrap();
    assert!(status.is_running());
    assert_eq!(fleet.platform.service(&service_name("u1")).unwrap().spec.replicas(), 1);

    assert_eq!(fleet.platform.count_calls(creates), 1);
    assert_eq!(fleet.platform.service_count(), 1);
    assert_eq!(fleet.platform.volume_names().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_edge_cases() {
    let fleet = Fleet::new();
    let u1 = tenant("u1");

    // Nothing to stop.
    assert!(!fleet.lifecycle.stop(&u1).await.unwrap());

    fleet.lifecycle.run(&u1).await.unwrap();
    assert!(fleet.lifecycle.stop(&u1).await.unwrap());

    // Already stopped: no second update.
    let updates_before = fleet.platform.count_calls(updates);
    assert!(fleet.lifecycle.stop(&u1).await.unwrap());
    assert_eq!(fleet.platform.count_calls(updates), updates_before);

    // Stopping never removes the service or its volume.
    assert_eq!(fleet.platform.count_calls(removes), 0);
    assert_eq!(fleet.platform.volume_names().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_start_absent_service() {
    let fleet = Fleet::new();
    assert!(!fleet.lifecycle.start(&tenant("nobody")).await.unwrap());
    assert_eq!(fleet.platform.service_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_get_status() {
    let fleet = Fleet::new();
    let u1 = tenant("u1");

    assert_eq!(fleet.lifecycle.get_status(&u1).await.unwrap(), None);

    fleet.lifecycle.run(&u1).await.unwrap();
    let status = fleet.lifecycle.get_status(&u1).await.unwrap().unwrap();
    assert_eq!(status.state, ServiceState::Running);
    assert_eq!(fleet.lifecycle.get_hostname(&u1), "worker-u1");
}

#[tokio::test(start_paused = true)]
async fn test_conflict_on_create_falls_back_to_start() {
    let fleet = Fleet::new();
    let u1 = tenant("u1");
    fleet.platform.conflict_on_next_create();

    assert!(fleet.lifecycle.run(&u1).await.unwrap());

    let service = fleet.platform.service(&service_name("u1")).unwrap();
    assert_eq!(service.spec.replicas(), 1);
    assert_eq!(fleet.platform.count_calls(creates), 1);
    assert_eq!(fleet.platform.count_calls(updates), 1);
    assert_eq!(fleet.platform.service_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_creation_removes_service() {
    let fleet = Fleet::with_platform(MemoryPlatform::with_behavior(WorkerBehavior::NeverHealthy));
    let u1 = tenant("u1");
    let started = Instant::now();

    assert!(!fleet.lifecycle.run(&u1).await.unwrap());
    assert_eq!(started.elapsed(), Duration::from_secs(10));

    assert!(fleet.platform.service(&service_name("u1")).is_none());
    assert_eq!(fleet.platform.count_calls(removes), 1);

    // The volume and the port assignment survive.
    assert_eq!(fleet.platform.volume_names(), vec!["worker-u1-data".to_string()]);
    assert_eq!(fleet.lifecycle.get_port(&u1).await.unwrap(), Some(20000));
}

#[tokio::test(start_paused = true)]
async fn test_wrong_network_is_recreated() {
    let fleet = Fleet::new();
    let u1 = tenant("u1");

    let stray = fleet.lifecycle.build_spec(&u1, 20000, "legacy-net");
    fleet.platform.seed_service(stray);

    assert!(fleet.lifecycle.run(&u1).await.unwrap());

    assert_eq!(fleet.platform.count_calls(removes), 1);
    assert_eq!(fleet.platform.count_calls(creates), 1);
    let service = fleet.platform.service(&service_name("u1")).unwrap();
    assert_eq!(service.spec.task_template.networks[0].target, NETWORK);
}

#[tokio::test(start_paused = true)]
async fn test_start_reattaches_and_refreshes_message_bus() {
    let fleet = Fleet::new();
    let u1 = tenant("u1");
    fleet.lifecycle.run(&u1).await.unwrap();
    fleet.lifecycle.stop(&u1).await.unwrap();

    // Move the stopped service off the shared network.
    let service = fleet.platform.service(&service_name("u1")).unwrap();
    let mut spec = service.spec.clone();
    spec.attach_only("legacy-net", vec![]);
    fleet
        .platform
        .update_service(&spec.name, service.version_index().unwrap(), &spec)
        .await
        .unwrap();

    // The message bus moved while the worker was stopped.
    let mut config = lifecycle_config();
    config.message_bus_host = "bus.internal".to_string();
    let restarted = fleet.manager_with(config);

    assert!(restarted.start(&u1).await.unwrap());

    let spec = fleet.platform.service(&service_name("u1")).unwrap().spec;
    assert_eq!(spec.replicas(), 1);
    assert_eq!(spec.task_template.networks[0].target, NETWORK);
    assert_eq!(spec.env_value("MESSAGE_BUS_HOST"), Some("bus.internal"));
    assert_eq!(fleet.platform.count_calls(creates), 1);
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_worker_is_awaited_not_recreated() {
    let fleet = Fleet::with_platform(MemoryPlatform::with_behavior(WorkerBehavior::HealthyAfter(3)));
    let u1 = tenant("u1");
    fleet.registry.set_port(&u1, 20000).await.unwrap();
    fleet
        .platform
        .seed_service(fleet.lifecycle.build_spec(&u1, 20000, NETWORK));
    fleet.platform.set_task_state(&service_name("u1"), "preparing");

    let status = fleet.lifecycle.get_status(&u1).await.unwrap().unwrap();
    assert_eq!(status.state, ServiceState::Stopped);

    let started = Instant::now();
    assert!(fleet.lifecycle.run(&u1).await.unwrap());
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(started.elapsed() <= Duration::from_secs(10));

    assert_eq!(fleet.platform.count_calls(creates), 0);
    assert_eq!(fleet.platform.count_calls(removes), 0);
    assert_eq!(fleet.platform.count_calls(updates), 0);
    assert_eq!(fleet.platform.service(&service_name("u1")).unwrap().spec.replicas(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_version_token_is_integrity_error() {
    let fleet = Fleet::new();
    let u1 = tenant("u1");
    fleet.lifecycle.run(&u1).await.unwrap();
    fleet.platform.clear_version(&service_name("u1"));

    let err = fleet.lifecycle.stop(&u1).await.unwrap_err();
    assert!(matches!(err, FleetError::Integrity(_)));
}

#[tokio::test(start_paused = true)]
async fn test_port_drift_is_integrity_error() {
    let fleet = Fleet::new();
    let u1 = tenant("u1");
    fleet.registry.set_port(&u1, 20000).await.unwrap();

    let mut drifted = fleet.lifecycle.build_spec(&u1, 20005, NETWORK);
    drifted.set_replicas(0);
    fleet.platform.seed_service(drifted);

    let err = fleet.lifecycle.start(&u1).await.unwrap_err();
    assert!(matches!(err, FleetError::Integrity(_)));
    assert_eq!(fleet.platform.count_calls(updates), 0);
}

#[tokio::test(start_paused = true)]
async fn test_platform_failure_reported_as_false() {
    let fleet = Fleet::new();
    let u1 = tenant("u1");
    fleet.lifecycle.run(&u1).await.unwrap();
    fleet.platform.fail_updates_for(&service_name("u1"));

    assert!(!fleet.lifecycle.stop(&u1).await.unwrap());
    assert_eq!(fleet.platform.service(&service_name("u1")).unwrap().spec.replicas(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_network_reported_as_false() {
    // No shared network registered.
    let platform = Arc::new(MemoryPlatform::new());
    let fleet = Fleet::build(
        platform,
        Arc::new(MemoryRegistry::new()),
        lifecycle_config(),
        PortRange::default(),
    );

    assert!(!fleet.lifecycle.run(&tenant("u1")).await.unwrap());
    assert_eq!(fleet.platform.service_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_ports_exhausted_is_surfaced() {
    let platform = MemoryPlatform::new();
    platform.add_network(NETWORK);
    let fleet = Fleet::build(
        Arc::new(platform),
        Arc::new(MemoryRegistry::new()),
        lifecycle_config(),
        PortRange::new(20000, 20001).unwrap(),
    );

    assert!(fleet.lifecycle.run(&tenant("u1")).await.unwrap());
    let err = fleet.lifecycle.run(&tenant("u2")).await.unwrap_err();
    assert!(matches!(err, FleetError::PortsExhausted { .. }));
    assert!(fleet.platform.service(&service_name("u2")).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_runs_for_one_tenant_are_serialized() {
    let fleet = Fleet::new();
    let u1 = tenant("u1");

    let (a, b) = tokio::join!(fleet.lifecycle.run(&u1), fleet.lifecycle.run(&u1));
    assert!(a.unwrap());
    assert!(b.unwrap());

    assert_eq!(fleet.platform.count_calls(creates), 1);
    assert_eq!(fleet.platform.service_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_different_tenants_run_concurrently() {
    let fleet = Fleet::with_platform(MemoryPlatform::with_behavior(WorkerBehavior::HealthyAfter(4)));
    let started = Instant::now();

    let (t1, t2, t3) = (tenant("u1"), tenant("u2"), tenant("u3"));
    let (a, b, c) = tokio::join!(
        fleet.lifecycle.run(&t1),
        fleet.lifecycle.run(&t2),
        fleet.lifecycle.run(&t3),
    );
    assert!(a.unwrap() && b.unwrap() && c.unwrap());

    // Each waits ~4s; serialized they would take ~12s.
    assert!(started.elapsed() < Duration::from_secs(8));

    let mut ports = Vec::new();
    for id in ["u1", "u2", "u3"] {
        ports.push(fleet.lifecycle.get_port(&tenant(id)).await.unwrap().unwrap());
    }
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_health_wait() {
    let fleet = Fleet::with_platform(MemoryPlatform::with_behavior(WorkerBehavior::NeverHealthy));
    let shutdown = fleet.shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        shutdown.cancel();
    });

    let started = Instant::now();
    assert!(!fleet.lifecycle.run(&tenant("u1")).await.unwrap());
    assert_eq!(started.elapsed(), Duration::from_secs(3));

    // An interrupted creation is not treated as an unhealthy worker.
    assert!(fleet.platform.service(&service_name("u1")).is_some());
    assert_eq!(fleet.platform.count_calls(removes), 0);
}

#[tokio::test(start_paused = true)]
async fn test_list_services_skips_foreign_services() {
    let fleet = Fleet::new();
    fleet.lifecycle.run(&tenant("u1")).await.unwrap();
    fleet.platform.seed_service(ServiceSpec {
        name: "unrelated".to_string(),
        ..ServiceSpec::default()
    });

    let managed = fleet.lifecycle.list_services().await.unwrap();
    assert_eq!(managed.len(), 1);
    assert_eq!(managed[0].tenant, tenant("u1"));
}
