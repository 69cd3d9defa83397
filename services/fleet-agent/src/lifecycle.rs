//! Per-tenant worker lifecycle.
//!
//! The [`ServiceLifecycleManager`] keeps exactly one worker service per
//! tenant on the platform. It creates the service (with its volume and port)
//! on first use, scales it between zero and one replica, and repairs a
//! service that ended up on the wrong network.
//!
//! Operations on the same tenant are serialized; different tenants proceed
//! independently.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_id::{ResourceNames, TenantId};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::{FleetError, FleetResult};
use crate::health::{HealthMonitor, WaitOptions};
use crate::locks::KeyedLocks;
use crate::platform::{
    nanos, HealthCheck, Mount, Network, OptionalExt, Platform, PlatformError, RestartPolicy,
    Service, ServiceSpec, UpdateConfig, MANAGED_BY_LABEL, MANAGED_BY_VALUE, TENANT_LABEL,
};
use crate::ports::PortAllocator;

/// Where the tenant's volume is mounted inside the worker.
pub const DATA_MOUNT_PATH: &str = "/data";

/// Default delay between rolling-update steps.
pub const DEFAULT_UPDATE_DELAY: Duration = Duration::from_secs(10);

/// Environment variables the orchestrator sets on every worker.
pub mod env {
    pub const TENANT_ID: &str = "TENANT_ID";
    pub const PORT: &str = "PORT";
    pub const MESSAGE_BUS_HOST: &str = "MESSAGE_BUS_HOST";
    pub const WORKER_HOSTNAME: &str = "WORKER_HOSTNAME";
}

/// Settings for building and managing worker services.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Worker image reference.
    pub image: String,

    /// Shared network every worker is attached to.
    pub network: String,

    /// Message bus hostname handed to workers.
    pub message_bus_host: String,

    /// Extra environment injected verbatim into every worker.
    pub worker_env: Vec<(String, String)>,

    /// HTTP path the container health check probes.
    pub health_path: String,

    /// Delay between rolling-update steps.
    pub update_delay: Duration,

    /// How long to wait for a worker to become healthy.
    pub wait: WaitOptions,
}

impl LifecycleConfig {
    pub fn new(image: impl Into<String>, network: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            network: network.into(),
            message_bus_host: "rabbitmq".to_string(),
            worker_env: Vec::new(),
            health_path: "/health".to_string(),
            update_delay: DEFAULT_UPDATE_DELAY,
            wait: WaitOptions::default(),
        }
    }
}

/// Whether a tenant's worker is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Stopped,
}

/// Status of an existing tenant service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantStatus {
    pub state: ServiceState,
}

impl TenantStatus {
    pub fn is_running(&self) -> bool {
        self.state == ServiceState::Running
    }
}

/// A service managed by this orchestrator, with the tenant it belongs to.
#[derive(Debug, Clone)]
pub struct ManagedService {
    pub tenant: TenantId,
    pub service: Service,
}

/// Creates, starts, stops and inspects tenant workers.
pub struct ServiceLifecycleManager {
    platform: Arc<dyn Platform>,
    ports: PortAllocator,
    health: HealthMonitor,
    names: ResourceNames,
    locks: KeyedLocks<TenantId>,
    config: LifecycleConfig,
}

impl ServiceLifecycleManager {
    pub fn new(
        platform: Arc<dyn Platform>,
        ports: PortAllocator,
        health: HealthMonitor,
        names: ResourceNames,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            platform,
            ports,
            health,
            names,
            locks: KeyedLocks::new(),
            config,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Make sure the tenant has exactly one healthy worker.
    ///
    /// Returns `false` if the worker could not be brought up; the reason is
    /// logged. Errors are returned only for broken local state.
    #[instrument(skip(self, tenant), fields(tenant = %tenant))]
    pub async fn run(&self, tenant: &TenantId) -> FleetResult<bool> {
        let _guard = self.locks.lock(tenant).await;
        settle("run", tenant, self.run_locked(tenant).await)
    }

    /// Scale an existing worker back up and wait for it to become healthy.
    #[instrument(skip(self, tenant), fields(tenant = %tenant))]
    pub async fn start(&self, tenant: &TenantId) -> FleetResult<bool> {
        let _guard = self.locks.lock(tenant).await;
        settle("start", tenant, self.start_locked(tenant).await)
    }

    /// Scale the worker to zero replicas. The service and volume are kept.
    #[instrument(skip(self, tenant), fields(tenant = %tenant))]
    pub async fn stop(&self, tenant: &TenantId) -> FleetResult<bool> {
        let _guard = self.locks.lock(tenant).await;
        settle("stop", tenant, self.stop_locked(tenant).await)
    }

    /// Force a redeploy of the worker on `image` and wait for it to become
    /// healthy again. A digest pinned on the current spec is replaced.
    ///
    /// Unlike the other operations this reports every failure as an error,
    /// so fleet-wide rollouts can record why a tenant failed.
    #[instrument(skip(self, tenant), fields(tenant = %tenant))]
    pub async fn redeploy(&self, tenant: &TenantId, image: &str) -> FleetResult<bool> {
        let _guard = self.locks.lock(tenant).await;
        let name = self.names.service(tenant);

        let service = self.platform.inspect_service(&name).await?;
        let version = version_of(&service)?;

        let mut spec = service.spec;
        if spec.image() != image {
            info!(tenant = %tenant, from = %spec.image(), to = %image, "Replacing worker image reference");
            spec.set_image(image);
        }
        spec.task_template.force_update = spec.task_template.force_update.wrapping_add(1);
        self.platform.update_service(&name, version, &spec).await?;
        info!(
            tenant = %tenant,
            force_update = spec.task_template.force_update,
            "Redeploy requested"
        );

        Ok(self.health.wait_until_healthy(tenant, self.config.wait).await)
    }

    /// Whether the tenant's worker is running, or `None` if it has no service.
    #[instrument(skip(self, tenant), fields(tenant = %tenant))]
    pub async fn get_status(&self, tenant: &TenantId) -> FleetResult<Option<TenantStatus>> {
        let name = self.names.service(tenant);
        match self.platform.inspect_service(&name).await.optional()? {
            Some(service) => Ok(Some(TenantStatus {
                state: self.state_of(&service).await?,
            })),
            None => Ok(None),
        }
    }

    /// The tenant's assigned port, if any.
    pub async fn get_port(&self, tenant: &TenantId) -> FleetResult<Option<u16>> {
        self.ports.get_port(tenant).await
    }

    /// Hostname the tenant's worker is reachable at on the shared network.
    pub fn get_hostname(&self, tenant: &TenantId) -> String {
        self.names.hostname(tenant)
    }

    /// Wait for the tenant's worker to become healthy.
    pub async fn wait_until_healthy(&self, tenant: &TenantId, opts: WaitOptions) -> bool {
        self.health.wait_until_healthy(tenant, opts).await
    }

    /// All services managed by this orchestrator.
    ///
    /// Services whose tenant label is missing or invalid are skipped.
    pub async fn list_services(&self) -> FleetResult<Vec<ManagedService>> {
        let filter = format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}");
        let services = self.platform.list_services(&filter).await?;

        Ok(services
            .into_iter()
            .filter_map(|service| {
                let label = service.spec.labels.get(TENANT_LABEL)?;
                match TenantId::parse(label) {
                    Ok(tenant) => Some(ManagedService { tenant, service }),
                    Err(e) => {
                        warn!(service = %service.spec.name, error = %e, "Skipping service with invalid tenant label");
                        None
                    }
                }
            })
            .collect())
    }

    /// The service spec for a tenant's worker.
    pub fn build_spec(&self, tenant: &TenantId, port: u16, network: &str) -> ServiceSpec {
        let hostname = self.names.hostname(tenant);

        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        labels.insert(TENANT_LABEL.to_string(), tenant.to_string());

        let mut spec = ServiceSpec {
            name: self.names.service(tenant),
            labels: labels.clone(),
            update_config: Some(UpdateConfig {
                parallelism: 1,
                delay: nanos(self.config.update_delay),
                failure_action: Some("rollback".to_string()),
                order: Some("stop-first".to_string()),
            }),
            rollback_config: Some(UpdateConfig {
                parallelism: 1,
                delay: 0,
                failure_action: Some("pause".to_string()),
                order: Some("stop-first".to_string()),
            }),
            ..ServiceSpec::default()
        };

        let container = &mut spec.task_template.container_spec;
        container.image = self.config.image.clone();
        container.hostname = Some(hostname.clone());
        container.labels = labels;
        container.mounts = vec![Mount {
            kind: "volume".to_string(),
            source: self.names.volume(tenant),
            target: DATA_MOUNT_PATH.to_string(),
        }];
        container.health_check = Some(HealthCheck {
            test: vec![
                "CMD-SHELL".to_string(),
                format!(
                    "curl -fsS http://localhost:{port}{} || exit 1",
                    self.config.health_path
                ),
            ],
            interval: nanos(Duration::from_secs(10)),
            timeout: nanos(Duration::from_secs(5)),
            retries: 3,
            start_period: nanos(Duration::from_secs(30)),
        });

        for (key, value) in &self.config.worker_env {
            spec.set_env(key, value);
        }
        spec.set_env(env::TENANT_ID, tenant.as_str());
        spec.set_env(env::PORT, &port.to_string());
        spec.set_env(env::MESSAGE_BUS_HOST, &self.config.message_bus_host);
        spec.set_env(env::WORKER_HOSTNAME, &hostname);

        spec.task_template.restart_policy = Some(RestartPolicy {
            condition: "on-failure".to_string(),
            delay: Some(nanos(Duration::from_secs(5))),
            max_attempts: None,
        });
        spec.attach_only(network, vec![hostname]);
        spec.set_replicas(1);
        spec
    }

    async fn run_locked(&self, tenant: &TenantId) -> FleetResult<bool> {
        let name = self.names.service(tenant);
        let network = self.shared_network().await?;

        if let Some(service) = self.platform.inspect_service(&name).await.optional()? {
            if !service.spec.is_attached_to(&network) {
                warn!(
                    tenant = %tenant,
                    network = %network.name,
                    "Service attached to the wrong network, recreating"
                );
                self.platform.remove_service(&name).await.optional()?;
            } else if service.spec.replicas() == 0 {
                debug!(tenant = %tenant, "Service scaled down, starting");
                return self.start_locked(tenant).await;
            } else if self.state_of(&service).await? == ServiceState::Running {
                debug!(tenant = %tenant, "Worker already running");
                return Ok(true);
            } else {
                debug!(tenant = %tenant, "Worker scheduled but not running yet");
                return Ok(self.health.wait_until_healthy(tenant, self.config.wait).await);
            }
        }

        self.create(tenant, &network).await
    }

    async fn create(&self, tenant: &TenantId, network: &Network) -> FleetResult<bool> {
        let name = self.names.service(tenant);

        self.ensure_volume(tenant).await?;
        let port = self.ports.assign_port(tenant).await?;
        let spec = self.build_spec(tenant, port, &network.name);

        match self.platform.create_service(&spec).await {
            Ok(id) => info!(tenant = %tenant, service_id = %id, port, "Created worker service"),
            Err(PlatformError::Conflict(message)) => {
                info!(tenant = %tenant, message = %message, "Service created concurrently, starting it");
                return self.start_locked(tenant).await;
            }
            Err(e) => return Err(e.into()),
        }

        let started = Instant::now();
        if self.health.wait_until_healthy(tenant, self.config.wait).await {
            return Ok(true);
        }
        let elapsed = started.elapsed();

        // Left in place on shutdown; the next startup pass picks it up.
        if self.health.is_shutting_down() {
            return Err(FleetError::Cancelled {
                resource: name,
                elapsed,
            });
        }

        self.discard(&name).await;
        Err(FleetError::Timeout {
            resource: name,
            elapsed,
        })
    }

    async fn start_locked(&self, tenant: &TenantId) -> FleetResult<bool> {
        let name = self.names.service(tenant);
        let service = self.platform.inspect_service(&name).await?;
        let version = version_of(&service)?;
        self.check_port(tenant, &service).await?;

        let network = self.shared_network().await?;
        let mut spec = service.spec;
        let mut changed = false;

        if !spec.is_attached_to(&network) {
            info!(tenant = %tenant, network = %network.name, "Re-attaching service to shared network");
            spec.attach_only(&network.name, vec![self.names.hostname(tenant)]);
            changed = true;
        }

        if spec.replicas() == 0 {
            info!(tenant = %tenant, "Scaling worker up");
            spec.set_replicas(1);
            spec.set_env(env::MESSAGE_BUS_HOST, &self.config.message_bus_host);
            changed = true;
        }

        if changed {
            self.platform.update_service(&name, version, &spec).await?;
        }

        Ok(self.health.wait_until_healthy(tenant, self.config.wait).await)
    }

    async fn stop_locked(&self, tenant: &TenantId) -> FleetResult<bool> {
        let name = self.names.service(tenant);

        let Some(service) = self.platform.inspect_service(&name).await.optional()? else {
            info!(tenant = %tenant, "No service to stop");
            return Ok(false);
        };

        if service.spec.replicas() == 0 {
            debug!(tenant = %tenant, "Worker already stopped");
            return Ok(true);
        }

        let version = version_of(&service)?;
        let mut spec = service.spec;
        spec.set_replicas(0);
        self.platform.update_service(&name, version, &spec).await?;

        info!(tenant = %tenant, "Worker stopped");
        Ok(true)
    }

    async fn state_of(&self, service: &Service) -> FleetResult<ServiceState> {
        if service.spec.replicas() == 0 {
            return Ok(ServiceState::Stopped);
        }

        let tasks = self.platform.list_tasks(&service.spec.name).await?;
        if tasks.iter().any(|t| t.is_running()) {
            Ok(ServiceState::Running)
        } else {
            Ok(ServiceState::Stopped)
        }
    }

    async fn shared_network(&self) -> FleetResult<Network> {
        Ok(self.platform.inspect_network(&self.config.network).await?)
    }

    async fn ensure_volume(&self, tenant: &TenantId) -> FleetResult<()> {
        let name = self.names.volume(tenant);
        if self.platform.inspect_volume(&name).await.optional()?.is_some() {
            return Ok(());
        }

        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        labels.insert(TENANT_LABEL.to_string(), tenant.to_string());
        self.platform.create_volume(&name, &labels).await?;

        info!(tenant = %tenant, volume = %name, "Created worker volume");
        Ok(())
    }

    /// The port baked into an existing service must be the tenant's assignment.
    async fn check_port(&self, tenant: &TenantId, service: &Service) -> FleetResult<()> {
        let assigned = self.ports.get_port(tenant).await?.ok_or_else(|| {
            FleetError::Integrity(format!("service {} exists but tenant has no port", service.spec.name))
        })?;

        match service.spec.env_value(env::PORT) {
            Some(port) if port != assigned.to_string() => Err(FleetError::Integrity(format!(
                "service {} uses port {port}, registry has {assigned}",
                service.spec.name
            ))),
            _ => Ok(()),
        }
    }

    /// Best-effort removal of a service that never became healthy.
    async fn discard(&self, name: &str) {
        match self.platform.remove_service(name).await {
            Ok(()) => info!(service = %name, "Removed unhealthy worker service"),
            Err(e) => warn!(service = %name, error = %e, "Failed to remove unhealthy worker service"),
        }
    }
}

fn version_of(service: &Service) -> FleetResult<u64> {
    service.version_index().ok_or_else(|| {
        FleetError::Integrity(format!("service {} has no version token", service.spec.name))
    })
}

/// Report transient failures as `false`, pass surfaced ones through.
fn settle(op: &'static str, tenant: &TenantId, result: FleetResult<bool>) -> FleetResult<bool> {
    match result {
        Ok(done) => Ok(done),
        Err(e) if e.is_surfaced() => Err(e),
        Err(e) => {
            warn!(tenant = %tenant, op, error = %e, "Lifecycle operation failed");
            Ok(false)
        }
    }
}
