//! Orchestrator error taxonomy.
//!
//! Transient infrastructure trouble (`NotFound`, `Conflict`, `Timeout`,
//! `Cancelled`, `Platform`) is absorbed at the lifecycle boundary and reported to callers
//! as `false`. Errors that point at a bug or at local state drift
//! (`Integrity`, `Registry`, `PortsExhausted`) are surfaced.

use std::time::Duration;

use thiserror::Error;

use crate::platform::PlatformError;
use crate::registry::RegistryError;

/// Result type for orchestrator operations.
pub type FleetResult<T> = Result<T, FleetError>;

/// Errors that can occur while managing the fleet.
#[derive(Debug, Error)]
pub enum FleetError {
    /// The platform object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The platform object already exists or changed concurrently.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A worker did not become healthy in time.
    #[error("timeout after {elapsed:?} waiting for {resource}")]
    Timeout { resource: String, elapsed: Duration },

    /// A health wait was cut short by shutdown.
    #[error("wait for {resource} cancelled after {elapsed:?}")]
    Cancelled { resource: String, elapsed: Duration },

    /// Any other platform, network or auth failure.
    #[error("platform error: {0}")]
    Platform(PlatformError),

    /// Platform or registry state contradicts what this core wrote.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// The tenant registry failed.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Every port in the range is assigned.
    #[error("no free port in range [{low}, {high})")]
    PortsExhausted { low: u16, high: u16 },
}

impl FleetError {
    /// Whether this error must reach the caller instead of being reported as `false`.
    pub fn is_surfaced(&self) -> bool {
        matches!(
            self,
            Self::Integrity(_) | Self::Registry(_) | Self::PortsExhausted { .. }
        )
    }
}

impl From<PlatformError> for FleetError {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::NotFound(msg) => Self::NotFound(msg),
            PlatformError::Conflict(msg) => Self::Conflict(msg),
            other => Self::Platform(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_wait_reports_real_elapsed() {
        let err = FleetError::Cancelled {
            resource: "worker-u1".into(),
            elapsed: Duration::from_secs(3),
        };
        assert_eq!(err.to_string(), "wait for worker-u1 cancelled after 3s");
        assert!(!err.is_surfaced());
    }

    #[test]
    fn test_platform_errors_are_classified() {
        let err: FleetError = PlatformError::NotFound("worker-u1".into()).into();
        assert!(matches!(err, FleetError::NotFound(_)));

        let err: FleetError = PlatformError::Conflict("exists".into()).into();
        assert!(matches!(err, FleetError::Conflict(_)));

        let err: FleetError = PlatformError::Transport("broken pipe".into()).into();
        assert!(matches!(err, FleetError::Platform(_)));
        assert!(!err.is_surfaced());
    }

    #[test]
    fn test_surfaced_errors() {
        assert!(FleetError::Integrity("no version".into()).is_surfaced());
        assert!(FleetError::PortsExhausted { low: 1, high: 2 }.is_surfaced());
        assert!(!FleetError::Timeout {
            resource: "worker-u1".into(),
            elapsed: Duration::from_secs(120),
        }
        .is_surfaced());
    }
}
