//! Persistent tenant registry.
//!
//! The registry is the durable record of which tenants exist and which port
//! each one was assigned. It outlives the platform state: if the swarm loses
//! a service, the registry still knows the tenant and reconciliation brings
//! the service back on the same port.
//!
//! - `SqliteRegistry`: SQLite file, used in production
//! - `MemoryRegistry`: in-process map, used in tests

mod memory;
mod sqlite;

use async_trait::async_trait;
use fleet_id::{IdError, TenantId};
use thiserror::Error;

pub use memory::MemoryRegistry;
pub use sqlite::SqliteRegistry;

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The port is already assigned to another tenant.
    #[error("port {port} already assigned to tenant {owner}")]
    PortTaken { port: u16, owner: TenantId },

    /// The tenant already has a different port.
    #[error("tenant {tenant} already assigned port {existing}")]
    AlreadyAssigned { tenant: TenantId, existing: u16 },

    /// A stored row could not be decoded.
    #[error("invalid registry row: {0}")]
    Invalid(String),
}

impl From<IdError> for RegistryError {
    fn from(err: IdError) -> Self {
        Self::Invalid(err.to_string())
    }
}

/// Durable tenant → port registry.
#[async_trait]
pub trait TenantRegistry: Send + Sync {
    /// Port assigned to the tenant, if any.
    async fn get_port(&self, tenant: &TenantId) -> Result<Option<u16>, RegistryError>;

    /// Record a port assignment. Re-recording the same pair is a no-op;
    /// a different port for the tenant or a port owned by another tenant is
    /// an error.
    async fn set_port(&self, tenant: &TenantId, port: u16) -> Result<(), RegistryError>;

    /// All known tenants, in registration order.
    async fn all_tenants(&self) -> Result<Vec<TenantId>, RegistryError>;

    /// All assigned ports.
    async fn all_ports(&self) -> Result<Vec<u16>, RegistryError>;
}
