//! In-memory tenant registry for tests.

use std::sync::Mutex;

use async_trait::async_trait;
use fleet_id::TenantId;

use super::{RegistryError, TenantRegistry};

/// Tenant registry held in process memory.
#[derive(Default)]
pub struct MemoryRegistry {
    // Insertion order doubles as registration order.
    entries: Mutex<Vec<(TenantId, u16)>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry pre-populated with assignments.
    pub fn with_entries(entries: impl IntoIterator<Item = (TenantId, u16)>) -> Self {
        Self {
            entries: Mutex::new(entries.into_iter().collect()),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<(TenantId, u16)>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TenantRegistry for MemoryRegistry {
    async fn get_port(&self, tenant: &TenantId) -> Result<Option<u16>, RegistryError> {
        Ok(self
            .entries()
            .iter()
            .find(|(t, _)| t == tenant)
            .map(|(_, port)| *port))
    }

    async fn set_port(&self, tenant: &TenantId, port: u16) -> Result<(), RegistryError> {
        let mut entries = self.entries();

        if let Some((_, existing)) = entries.iter().find(|(t, _)| t == tenant) {
            if *existing == port {
                return Ok(());
            }
            return Err(RegistryError::AlreadyAssigned {
                tenant: tenant.clone(),
                existing: *existing,
            });
        }

        if let Some((owner, _)) = entries.iter().find(|(_, p)| *p == port) {
            return Err(RegistryError::PortTaken {
                port,
                owner: owner.clone(),
            });
        }

        entries.push((tenant.clone(), port));
        Ok(())
    }

    async fn all_tenants(&self) -> Result<Vec<TenantId>, RegistryError> {
        Ok(self.entries().iter().map(|(t, _)| t.clone()).collect())
    }

    async fn all_ports(&self) -> Result<Vec<u16>, RegistryError> {
        Ok(self.entries().iter().map(|(_, p)| *p).collect())
    }
}
