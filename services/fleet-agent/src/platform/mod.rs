//! Container orchestration platform interface.
//!
//! The [`Platform`] trait is the only way the orchestrator talks to the
//! outside world about services, tasks, containers, volumes and images.
//! Two implementations are provided:
//!
//! - [`DockerPlatform`]: Docker Engine API (swarm mode) over the local unix socket
//! - [`MemoryPlatform`]: in-process simulation for tests and dry runs
//!
//! Adapters classify every failure into a [`PlatformError`] variant, so
//! business logic matches on `NotFound`/`Conflict` instead of inspecting
//! status codes.

mod docker;
mod image_ref;
mod memory;
mod types;

use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use thiserror::Error;

pub use docker::{DockerConfig, DockerPlatform};
pub use image_ref::ImageRef;
pub use memory::{MemoryPlatform, PlatformCall, WorkerBehavior};
pub use types::*;

/// Errors from platform operations.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The named object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An object with the same name already exists, or the version token is stale.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Any other error response from the platform API.
    #[error("platform API error {status}: {message}")]
    Api { status: u16, message: String },

    /// The request never got a response (socket, connection, protocol).
    #[error("transport error: {0}")]
    Transport(String),

    /// The response could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The image pull stream reported an error.
    #[error("image pull failed: {0}")]
    Pull(String),
}

impl PlatformError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<serde_json::Error> for PlatformError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Result type for platform operations.
pub type PlatformResult<T> = Result<T, PlatformError>;

/// Stream of progress messages from an image pull.
pub type PullProgressStream = Pin<Box<dyn Stream<Item = PlatformResult<PullProgress>> + Send>>;

/// Turns `NotFound` into `Ok(None)`, leaving other errors untouched.
pub trait OptionalExt<T> {
    fn optional(self) -> PlatformResult<Option<T>>;
}

impl<T> OptionalExt<T> for PlatformResult<T> {
    fn optional(self) -> PlatformResult<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(PlatformError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Container orchestration platform interface.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Check that the platform API is reachable.
    async fn ping(&self) -> PlatformResult<()>;

    /// Create a service; returns its platform ID.
    async fn create_service(&self, spec: &ServiceSpec) -> PlatformResult<String>;

    /// Replace a service's spec. `version` must be the index read from the
    /// latest inspect; a stale index yields `Conflict`.
    async fn update_service(
        &self,
        name: &str,
        version: u64,
        spec: &ServiceSpec,
    ) -> PlatformResult<()>;

    /// Remove a service.
    async fn remove_service(&self, name: &str) -> PlatformResult<()>;

    /// Inspect a service by name.
    async fn inspect_service(&self, name: &str) -> PlatformResult<Service>;

    /// List services carrying the given `key=value` label.
    async fn list_services(&self, label: &str) -> PlatformResult<Vec<Service>>;

    /// List the tasks of a service.
    async fn list_tasks(&self, service: &str) -> PlatformResult<Vec<Task>>;

    /// Inspect a container's runtime state.
    async fn inspect_container(&self, id: &str) -> PlatformResult<ContainerState>;

    /// Create a named volume.
    async fn create_volume(
        &self,
        name: &str,
        labels: &std::collections::BTreeMap<String, String>,
    ) -> PlatformResult<Volume>;

    /// Inspect a named volume.
    async fn inspect_volume(&self, name: &str) -> PlatformResult<Volume>;

    /// Inspect a network by name or ID.
    async fn inspect_network(&self, name: &str) -> PlatformResult<Network>;

    /// Start pulling an image; progress arrives on the returned stream and
    /// the pull is complete when the stream ends.
    async fn pull_image(&self, image: &str) -> PlatformResult<PullProgressStream>;

    /// Inspect a local image.
    async fn inspect_image(&self, image: &str) -> PlatformResult<Image>;
}
