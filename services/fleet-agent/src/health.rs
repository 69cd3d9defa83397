//! Worker health checks.
//!
//! A tenant's health is read from the platform: the service's desired
//! replica count, its tasks, and the health state of the container backing
//! the live task. Nothing is cached between probes.

use std::sync::Arc;
use std::time::Duration;

use fleet_id::{ResourceNames, TenantId};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::FleetResult;
use crate::platform::{OptionalExt, Platform, Task};

/// Default time to wait for a worker to become healthy.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(120);

/// Default pause between health probes.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// Coarse health of a tenant's worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// No service exists.
    Absent,
    /// Desired replicas is zero.
    Stopped,
    /// Scheduled but not (yet) passing its health check.
    Starting,
    /// Passing its health check, or running without one.
    Healthy,
    /// Failing its health check.
    Unhealthy,
}

/// Polling parameters for [`HealthMonitor::wait_until_healthy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_HEALTH_TIMEOUT,
            interval: DEFAULT_HEALTH_INTERVAL,
        }
    }
}

/// Reads worker health from the platform.
pub struct HealthMonitor {
    platform: Arc<dyn Platform>,
    names: ResourceNames,
    shutdown: CancellationToken,
}

impl HealthMonitor {
    /// `shutdown` aborts any wait in progress when cancelled.
    pub fn new(
        platform: Arc<dyn Platform>,
        names: ResourceNames,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            platform,
            names,
            shutdown,
        }
    }

    /// Whether process shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Classify the tenant's worker.
    pub async fn health_status(&self, tenant: &TenantId) -> FleetResult<HealthStatus> {
        let name = self.names.service(tenant);

        let Some(service) = self.platform.inspect_service(&name).await.optional()? else {
            return Ok(HealthStatus::Absent);
        };

        // Scaled down: task lists can lag and still show the old container.
        if service.spec.replicas() == 0 {
            return Ok(HealthStatus::Stopped);
        }

        let tasks = self.platform.list_tasks(&name).await?;
        let Some(container_id) = pick_task(&tasks).and_then(Task::container_id) else {
            debug!(tenant = %tenant, tasks = tasks.len(), "No task with a container yet");
            return Ok(HealthStatus::Starting);
        };

        let Some(container) = self
            .platform
            .inspect_container(container_id)
            .await
            .optional()?
        else {
            return Ok(HealthStatus::Starting);
        };

        let status = match container.health.as_ref().map(|h| h.status.as_str()) {
            Some("healthy") => HealthStatus::Healthy,
            Some("unhealthy") => HealthStatus::Unhealthy,
            None if container.running => HealthStatus::Healthy,
            _ => HealthStatus::Starting,
        };
        Ok(status)
    }

    /// Whether the tenant's worker is up and passing its health check.
    /// Platform failures count as unhealthy.
    pub async fn is_healthy(&self, tenant: &TenantId) -> bool {
        match self.health_status(tenant).await {
            Ok(status) => status == HealthStatus::Healthy,
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "Health probe failed");
                false
            }
        }
    }

    /// Poll until the worker is healthy, the timeout elapses, or shutdown.
    ///
    /// The first probe happens immediately. Returns `false` on timeout or
    /// cancellation.
    pub async fn wait_until_healthy(&self, tenant: &TenantId, opts: WaitOptions) -> bool {
        let cancel = self.shutdown.child_token();
        let started = Instant::now();
        let deadline = started + opts.timeout;
        let mut probes = 0u32;

        loop {
            probes += 1;
            let healthy = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(tenant = %tenant, "Health wait cancelled");
                    return false;
                }
                probe = tokio::time::timeout_at(deadline, self.is_healthy(tenant)) => {
                    probe.unwrap_or(false)
                }
            };

            if healthy {
                info!(
                    tenant = %tenant,
                    probes,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Worker healthy"
                );
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    tenant = %tenant,
                    probes,
                    timeout_secs = opts.timeout.as_secs(),
                    "Worker did not become healthy in time"
                );
                return false;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(tenant = %tenant, "Health wait cancelled");
                    return false;
                }
                _ = tokio::time::sleep(opts.interval.min(deadline - now)) => {}
            }
        }
    }
}

/// Prefer a running task with a container, then any task with one.
fn pick_task(tasks: &[Task]) -> Option<&Task> {
    tasks
        .iter()
        .find(|t| t.is_running() && t.container_id().is_some())
        .or_else(|| tasks.iter().find(|t| t.container_id().is_some()))
}
