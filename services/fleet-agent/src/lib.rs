//! Fleet agent library.
//!
//! Runs one isolated worker service per tenant on a Docker Swarm cluster:
//! creates workers on demand, scales them between zero and one replica,
//! rolls out new worker images across the fleet, and repairs drift between
//! the tenant registry and the platform at startup.
//!
//! ## Architecture
//!
//! ```text
//! ReconciliationLoop ─┐
//!                     ├─> ServiceLifecycleManager ─┬─> PortAllocator ─> TenantRegistry
//! ImageUpdateWatcher ─┘                            ├─> HealthMonitor
//!                                                  └─> Platform
//! ```
//!
//! ## Modules
//!
//! - `platform`: platform interface, Docker Engine client and in-memory platform
//! - `registry`: persistent tenant → port registry (SQLite)
//! - `lifecycle`: per-tenant create/start/stop/status
//! - `image_watch`: image release detection and fleet rollout
//! - `reconciler`: startup repair of missing services

pub mod backoff;
pub mod config;
pub mod error;
pub mod health;
pub mod image_watch;
pub mod lifecycle;
pub mod locks;
pub mod platform;
pub mod ports;
pub mod reconciler;
pub mod registry;

// Re-export commonly used types
pub use error::{FleetError, FleetResult};
pub use fleet_id::{ResourceNames, TenantId};
pub use health::{HealthMonitor, HealthStatus, WaitOptions};
pub use image_watch::{DigestState, ImageUpdateWatcher, RolloutOutcome, RolloutReport, WatcherConfig};
pub use lifecycle::{LifecycleConfig, ServiceLifecycleManager, ServiceState, TenantStatus};
pub use ports::{PortAllocator, PortRange};
pub use reconciler::{ReconcileOutcome, ReconcileReport, ReconciliationLoop};
