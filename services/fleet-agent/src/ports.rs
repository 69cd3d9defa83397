//! Stable port assignment per tenant.
//!
//! Each tenant's worker listens on a host-unique port from a fixed range.
//! Once assigned, a port belongs to its tenant for good; the registry is the
//! source of truth and enforces that no two tenants share one.

use std::collections::HashSet;
use std::sync::Arc;

use fleet_id::TenantId;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{FleetError, FleetResult};
use crate::registry::TenantRegistry;

/// Lowest port handed out by default (inclusive).
pub const DEFAULT_PORT_LOW: u16 = 20000;

/// Upper bound of the default range (exclusive).
pub const DEFAULT_PORT_HIGH: u16 = 30000;

/// Half-open port range `[low, high)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    low: u16,
    high: u16,
}

impl PortRange {
    /// Returns `None` if the range is empty.
    pub fn new(low: u16, high: u16) -> Option<Self> {
        (low < high).then_some(Self { low, high })
    }

    pub fn low(&self) -> u16 {
        self.low
    }

    pub fn high(&self) -> u16 {
        self.high
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.low..self.high).contains(&port)
    }

    fn len(&self) -> u32 {
        u32::from(self.high - self.low)
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            low: DEFAULT_PORT_LOW,
            high: DEFAULT_PORT_HIGH,
        }
    }
}

/// Hands out ports from a range, remembering them in the tenant registry.
pub struct PortAllocator {
    registry: Arc<dyn TenantRegistry>,
    range: PortRange,
    // Held across read-max → persist so two assignments never pick the same candidate.
    assign_lock: Mutex<()>,
}

impl PortAllocator {
    pub fn new(registry: Arc<dyn TenantRegistry>, range: PortRange) -> Self {
        Self {
            registry,
            range,
            assign_lock: Mutex::new(()),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// The tenant's port, if one was ever assigned.
    pub async fn get_port(&self, tenant: &TenantId) -> FleetResult<Option<u16>> {
        Ok(self.registry.get_port(tenant).await?)
    }

    /// Return the tenant's port, assigning and persisting one on first call.
    ///
    /// New ports continue after the highest assigned port. When that runs
    /// past the end of the range the search wraps to the start, and any
    /// candidate already held by another tenant is skipped.
    pub async fn assign_port(&self, tenant: &TenantId) -> FleetResult<u16> {
        let _guard = self.assign_lock.lock().await;

        if let Some(port) = self.registry.get_port(tenant).await? {
            debug!(tenant = %tenant, port, "Port already assigned");
            return Ok(port);
        }

        let assigned = self.registry.all_ports().await?;
        let candidate = match assigned.iter().max() {
            Some(&max) if max < u16::MAX && self.range.contains(max + 1) => max + 1,
            Some(_) => {
                warn!(
                    low = self.range.low,
                    high = self.range.high,
                    "Port range end reached, wrapping around"
                );
                self.range.low
            }
            None => self.range.low,
        };

        let taken: HashSet<u16> = assigned.into_iter().collect();
        let port = self
            .first_free_from(candidate, &taken)
            .ok_or(FleetError::PortsExhausted {
                low: self.range.low,
                high: self.range.high,
            })?;

        self.registry.set_port(tenant, port).await?;
        info!(tenant = %tenant, port, "Assigned port");
        Ok(port)
    }

    /// Scan forward from `start`, wrapping at the end of the range, for a
    /// port nobody holds.
    fn first_free_from(&self, start: u16, taken: &HashSet<u16>) -> Option<u16> {
        let len = self.range.len();
        let offset = u32::from(start - self.range.low);
        (0..len)
            .map(|i| self.range.low + ((offset + i) % len) as u16)
            .find(|port| !taken.contains(port))
    }
}
