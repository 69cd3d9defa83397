//! Startup reconciliation of the tenant registry against the platform.
//!
//! Every tenant in the registry should have a service. Tenants whose
//! service went missing (platform reset, manual removal) are recreated;
//! everything else is left alone. Tenants are handled independently and a
//! failure for one never stops the pass.

use std::sync::Arc;

use fleet_id::TenantId;
use futures_util::{stream, StreamExt};
use tracing::{error, info, warn};

use crate::error::FleetResult;
use crate::lifecycle::{ServiceLifecycleManager, ServiceState};
use crate::registry::TenantRegistry;

/// What reconciliation did for one tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A service exists; nothing to do.
    Present(ServiceState),
    /// The service was missing and has been recreated.
    Recreated,
    /// The service was missing and could not be brought up.
    RecreateFailed,
    /// The tenant could not be checked or recreated.
    Error(String),
}

/// Statistics from one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub outcomes: Vec<(TenantId, ReconcileOutcome)>,
}

impl ReconcileReport {
    pub fn present(&self) -> usize {
        self.count(|o| matches!(o, ReconcileOutcome::Present(_)))
    }

    pub fn recreated(&self) -> usize {
        self.count(|o| *o == ReconcileOutcome::Recreated)
    }

    pub fn failed(&self) -> usize {
        self.count(|o| {
            matches!(
                o,
                ReconcileOutcome::RecreateFailed | ReconcileOutcome::Error(_)
            )
        })
    }

    pub fn outcome(&self, tenant: &TenantId) -> Option<&ReconcileOutcome> {
        self.outcomes
            .iter()
            .find(|(t, _)| t == tenant)
            .map(|(_, outcome)| outcome)
    }

    fn count(&self, f: impl Fn(&ReconcileOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| f(o)).count()
    }
}

/// Repairs drift between the registry and the platform.
pub struct ReconciliationLoop {
    registry: Arc<dyn TenantRegistry>,
    lifecycle: Arc<ServiceLifecycleManager>,
    concurrency: usize,
}

impl ReconciliationLoop {
    pub fn new(
        registry: Arc<dyn TenantRegistry>,
        lifecycle: Arc<ServiceLifecycleManager>,
        concurrency: usize,
    ) -> Self {
        Self {
            registry,
            lifecycle,
            concurrency: concurrency.max(1),
        }
    }

    /// Check every registered tenant once and recreate missing services.
    ///
    /// Fails only if the registry cannot be read.
    pub async fn run_once(&self) -> FleetResult<ReconcileReport> {
        let tenants = self.registry.all_tenants().await?;
        info!(tenants = tenants.len(), "Starting reconciliation");

        let lifecycle = &self.lifecycle;
        let outcomes = stream::iter(tenants)
            .map(|tenant| async move {
                let outcome = reconcile_tenant(lifecycle, &tenant).await;
                (tenant, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let report = ReconcileReport { outcomes };
        info!(
            present = report.present(),
            recreated = report.recreated(),
            failed = report.failed(),
            "Reconciliation complete"
        );
        Ok(report)
    }
}

async fn reconcile_tenant(lifecycle: &ServiceLifecycleManager, tenant: &TenantId) -> ReconcileOutcome {
    match lifecycle.get_status(tenant).await {
        Ok(Some(status)) => return ReconcileOutcome::Present(status.state),
        Ok(None) => {}
        Err(e) => {
            error!(tenant = %tenant, error = %e, "Failed to check tenant service");
            return ReconcileOutcome::Error(e.to_string());
        }
    }

    warn!(tenant = %tenant, "Tenant service missing, recreating");
    match lifecycle.run(tenant).await {
        Ok(true) => ReconcileOutcome::Recreated,
        Ok(false) => ReconcileOutcome::RecreateFailed,
        Err(e) => {
            error!(tenant = %tenant, error = %e, "Failed to recreate tenant service");
            ReconcileOutcome::Error(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts() {
        let t = |s: &str| TenantId::parse(s).unwrap();
        let report = ReconcileReport {
            outcomes: vec![
                (t("a"), ReconcileOutcome::Present(ServiceState::Running)),
                (t("b"), ReconcileOutcome::Present(ServiceState::Stopped)),
                (t("c"), ReconcileOutcome::Recreated),
                (t("d"), ReconcileOutcome::RecreateFailed),
                (t("e"), ReconcileOutcome::Error("registry".into())),
            ],
        };
        assert_eq!(report.present(), 2);
        assert_eq!(report.recreated(), 1);
        assert_eq!(report.failed(), 2);
        assert_eq!(report.outcome(&t("c")), Some(&ReconcileOutcome::Recreated));
    }
}
