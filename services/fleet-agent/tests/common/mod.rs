//! Shared fixtures for fleet agent integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use fleet_agent::platform::{MemoryPlatform, Platform};
use fleet_agent::registry::{MemoryRegistry, TenantRegistry};
use fleet_agent::{
    DigestState, HealthMonitor, ImageUpdateWatcher, LifecycleConfig, PortAllocator, PortRange,
    ResourceNames, ServiceLifecycleManager, TenantId, WaitOptions, WatcherConfig,
};
use tokio_util::sync::CancellationToken;

pub const IMAGE: &str = "ghcr.io/acme/worker:latest";
pub const NETWORK: &str = "fleet";

pub fn tenant(id: &str) -> TenantId {
    TenantId::parse(id).unwrap()
}

pub fn service_name(id: &str) -> String {
    format!("worker-{id}")
}

/// Lifecycle settings with a 10s health budget polled every second.
pub fn lifecycle_config() -> LifecycleConfig {
    let mut config = LifecycleConfig::new(IMAGE, NETWORK);
    config.wait = WaitOptions {
        timeout: Duration::from_secs(10),
        interval: Duration::from_secs(1),
    };
    config
}

/// An in-memory platform and registry with a lifecycle manager on top.
pub struct Fleet {
    pub platform: Arc<MemoryPlatform>,
    pub registry: Arc<dyn TenantRegistry>,
    pub lifecycle: Arc<ServiceLifecycleManager>,
    pub shutdown: CancellationToken,
}

impl Fleet {
    pub fn new() -> Self {
        Self::with_platform(MemoryPlatform::new())
    }

    pub fn with_platform(platform: MemoryPlatform) -> Self {
        platform.add_network(NETWORK);
        Self::build(
            Arc::new(platform),
            Arc::new(MemoryRegistry::new()),
            lifecycle_config(),
            PortRange::default(),
        )
    }

    pub fn build(
        platform: Arc<MemoryPlatform>,
        registry: Arc<dyn TenantRegistry>,
        config: LifecycleConfig,
        range: PortRange,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let lifecycle = Arc::new(manager(
            Arc::clone(&platform),
            Arc::clone(&registry),
            config,
            range,
            &shutdown,
        ));
        Self {
            platform,
            registry,
            lifecycle,
            shutdown,
        }
    }

    /// A second manager over the same platform and registry.
    pub fn manager_with(&self, config: LifecycleConfig) -> ServiceLifecycleManager {
        manager(
            Arc::clone(&self.platform),
            Arc::clone(&self.registry),
            config,
            PortRange::default(),
            &self.shutdown,
        )
    }

    pub fn watcher(&self, state: DigestState) -> ImageUpdateWatcher {
        let mut config = WatcherConfig::new(IMAGE);
        config.interval = Duration::from_secs(60);
        ImageUpdateWatcher::new(
            Arc::clone(&self.platform) as Arc<dyn Platform>,
            Arc::clone(&self.lifecycle),
            config,
            state,
        )
    }
}

fn manager(
    platform: Arc<MemoryPlatform>,
    registry: Arc<dyn TenantRegistry>,
    config: LifecycleConfig,
    range: PortRange,
    shutdown: &CancellationToken,
) -> ServiceLifecycleManager {
    let platform: Arc<dyn Platform> = platform;
    let names = ResourceNames::default();
    ServiceLifecycleManager::new(
        Arc::clone(&platform),
        PortAllocator::new(registry, range),
        HealthMonitor::new(platform, names.clone(), shutdown.child_token()),
        names,
        config,
    )
}
