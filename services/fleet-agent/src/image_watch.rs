//! Worker image release detection and fleet-wide rollout.
//!
//! The watcher pulls the worker image on a schedule. When the pull brings
//! in a new digest, every running tenant service on that image is
//! redeployed, a few tenants at a time, and the result for each tenant is
//! collected in a [`RolloutReport`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use fleet_id::TenantId;
use futures_util::{stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::FleetResult;
use crate::lifecycle::ServiceLifecycleManager;
use crate::platform::{ImageRef, OptionalExt, Platform};

/// Default time between image checks.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Default number of tenants redeployed at once.
pub const DEFAULT_ROLLOUT_CONCURRENCY: usize = 4;

/// Last digest the watcher saw for its image. Not persisted; a fresh value
/// means the next check establishes a baseline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestState {
    cached_digest: Option<String>,
}

impl DigestState {
    pub fn new() -> Self {
        Self::default()
    }

    /// State that already knows a digest.
    pub fn with_digest(digest: impl Into<String>) -> Self {
        Self {
            cached_digest: Some(digest.into()),
        }
    }

    pub fn cached_digest(&self) -> Option<&str> {
        self.cached_digest.as_deref()
    }
}

/// Watcher settings.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Image reference to watch.
    pub image: String,

    /// Time between checks.
    pub interval: Duration,

    /// Tenants redeployed at once.
    pub rollout_concurrency: usize,
}

impl WatcherConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            interval: DEFAULT_CHECK_INTERVAL,
            rollout_concurrency: DEFAULT_ROLLOUT_CONCURRENCY,
        }
    }
}

/// What happened to one tenant during a rollout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutOutcome {
    /// Redeployed and healthy.
    Updated,
    /// Redeployed but not healthy within the timeout.
    Unhealthy,
    /// The redeploy could not be issued.
    Failed(String),
}

impl fmt::Display for RolloutOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Updated => write!(f, "updated"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Per-tenant results of a rollout.
#[derive(Debug, Clone, Default)]
pub struct RolloutReport {
    pub outcomes: Vec<(TenantId, RolloutOutcome)>,
}

impl RolloutReport {
    pub fn updated(&self) -> usize {
        self.count(|o| *o == RolloutOutcome::Updated)
    }

    pub fn unhealthy(&self) -> usize {
        self.count(|o| *o == RolloutOutcome::Unhealthy)
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, RolloutOutcome::Failed(_)))
    }

    /// Outcome for one tenant.
    pub fn outcome(&self, tenant: &TenantId) -> Option<&RolloutOutcome> {
        self.outcomes
            .iter()
            .find(|(t, _)| t == tenant)
            .map(|(_, outcome)| outcome)
    }

    fn count(&self, f: impl Fn(&RolloutOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| f(o)).count()
    }
}

/// Detects new releases of the worker image and rolls them out.
pub struct ImageUpdateWatcher {
    platform: Arc<dyn Platform>,
    lifecycle: Arc<ServiceLifecycleManager>,
    config: WatcherConfig,
    state: DigestState,
}

impl ImageUpdateWatcher {
    pub fn new(
        platform: Arc<dyn Platform>,
        lifecycle: Arc<ServiceLifecycleManager>,
        config: WatcherConfig,
        state: DigestState,
    ) -> Self {
        Self {
            platform,
            lifecycle,
            config,
            state,
        }
    }

    pub fn digest_state(&self) -> &DigestState {
        &self.state
    }

    /// Pull the watched image and report whether a new release arrived.
    ///
    /// The first check after startup only records a baseline when the image
    /// was already present locally.
    pub async fn check_for_new_image(&mut self) -> FleetResult<bool> {
        let image = self.config.image.as_str();

        let old_digest = self
            .platform
            .inspect_image(image)
            .await
            .optional()?
            .map(|i| i.digest().to_string());

        let mut progress = self.platform.pull_image(image).await?;
        let mut downloaded_newer = false;
        while let Some(message) = progress.next().await {
            let message = message?;
            if let Some(status) = message.status.as_deref() {
                debug!(image = %image, status = %status, "Pull progress");
            }
            downloaded_newer |= message.is_newer_image();
        }

        let new_digest = self.platform.inspect_image(image).await?.digest().to_string();

        let changed = match self.state.cached_digest.as_deref() {
            None if old_digest.is_some() => {
                info!(image = %image, digest = %new_digest, "Recorded image baseline");
                false
            }
            None => true,
            Some(cached) => cached != new_digest || downloaded_newer,
        };

        if changed {
            info!(
                image = %image,
                previous = ?self.state.cached_digest,
                digest = %new_digest,
                "New worker image available"
            );
        }
        self.state.cached_digest = Some(new_digest);

        Ok(changed)
    }

    /// Redeploy every running tenant service that uses the watched image.
    /// Services pinned to a digest are moved onto the watched tag.
    ///
    /// Each tenant is handled independently; failures are recorded in the
    /// report and never stop the others.
    pub async fn update_all_services(&self) -> FleetResult<RolloutReport> {
        let watched = ImageRef::parse(&self.config.image);
        let target_image = watched.unpinned().to_string();

        let targets: Vec<TenantId> = self
            .lifecycle
            .list_services()
            .await?
            .into_iter()
            .filter(|m| {
                m.service.spec.replicas() >= 1
                    && ImageRef::parse(m.service.spec.image()).same_image(&watched)
            })
            .map(|m| m.tenant)
            .collect();

        info!(
            image = %self.config.image,
            tenants = targets.len(),
            concurrency = self.config.rollout_concurrency,
            "Starting rollout"
        );

        let lifecycle = &self.lifecycle;
        let target_image = target_image.as_str();
        let outcomes = stream::iter(targets)
            .map(|tenant| async move {
                let outcome = match lifecycle.redeploy(&tenant, target_image).await {
                    Ok(true) => RolloutOutcome::Updated,
                    Ok(false) => {
                        warn!(tenant = %tenant, "Worker unhealthy after update");
                        RolloutOutcome::Unhealthy
                    }
                    Err(e) => {
                        error!(tenant = %tenant, error = %e, "Worker update failed");
                        RolloutOutcome::Failed(e.to_string())
                    }
                };
                (tenant, outcome)
            })
            .buffer_unordered(self.config.rollout_concurrency.max(1))
            .collect()
            .await;

        Ok(RolloutReport { outcomes })
    }

    /// One scheduled check, followed by a rollout if the image changed.
    pub async fn tick(&mut self) -> Option<RolloutReport> {
        match self.check_for_new_image().await {
            Ok(true) => {}
            Ok(false) => {
                debug!(image = %self.config.image, "Worker image unchanged");
                return None;
            }
            Err(e) => {
                warn!(image = %self.config.image, error = %e, "Image check failed");
                return None;
            }
        }

        match self.update_all_services().await {
            Ok(report) => {
                info!(
                    updated = report.updated(),
                    unhealthy = report.unhealthy(),
                    failed = report.failed(),
                    "Rollout complete"
                );
                Some(report)
            }
            Err(e) => {
                error!(error = %e, "Rollout failed to start");
                None
            }
        }
    }

    /// Check on the configured interval until shutdown. The first check
    /// runs immediately.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            image = %self.config.image,
            interval_secs = self.config.interval.as_secs(),
            "Image watcher started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Image watcher shutting down");
                    break;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts() {
        let t = |s: &str| TenantId::parse(s).unwrap();
        let report = RolloutReport {
            outcomes: vec![
                (t("a"), RolloutOutcome::Updated),
                (t("b"), RolloutOutcome::Failed("boom".into())),
                (t("c"), RolloutOutcome::Unhealthy),
                (t("d"), RolloutOutcome::Updated),
            ],
        };
        assert_eq!(report.updated(), 2);
        assert_eq!(report.unhealthy(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.outcome(&t("c")), Some(&RolloutOutcome::Unhealthy));
        assert_eq!(report.outcome(&t("z")), None);
    }

    #[test]
    fn test_digest_state() {
        assert_eq!(DigestState::new().cached_digest(), None);
        assert_eq!(
            DigestState::with_digest("sha256:a").cached_digest(),
            Some("sha256:a")
        );
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(RolloutOutcome::Failed("no version".into()).to_string(), "failed: no version");
    }
}
