//! Platform object model.
//!
//! These types mirror the Docker Engine API wire format (PascalCase keys,
//! durations in nanoseconds) so the Docker adapter can send and receive them
//! without a translation layer. Fields this crate does not manage are kept in
//! `extra` so that an inspect → modify → update cycle never drops settings
//! the platform filled in.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Label marking a service or volume as owned by this orchestrator.
pub const MANAGED_BY_LABEL: &str = "fleet.managed-by";

/// Value of [`MANAGED_BY_LABEL`].
pub const MANAGED_BY_VALUE: &str = "fleet-agent";

/// Label carrying the tenant ID a service or volume belongs to.
pub const TENANT_LABEL: &str = "fleet.tenant";

/// Converts a duration to the nanosecond integers the platform expects.
pub fn nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

/// Declarative description of a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceSpec {
    pub name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    pub task_template: TaskTemplate,

    #[serde(default)]
    pub mode: ServiceMode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_config: Option<UpdateConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_config: Option<UpdateConfig>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ServiceSpec {
    /// Desired replica count (0 for global or unknown mode).
    pub fn replicas(&self) -> u64 {
        self.mode
            .replicated
            .as_ref()
            .map(|r| r.replicas)
            .unwrap_or(0)
    }

    /// Set the desired replica count.
    pub fn set_replicas(&mut self, replicas: u64) {
        self.mode.replicated = Some(Replicated { replicas });
    }

    /// Returns true if any attachment targets the given network (by name or ID).
    pub fn is_attached_to(&self, network: &Network) -> bool {
        self.task_template
            .networks
            .iter()
            .any(|n| n.target == network.name || n.target == network.id)
    }

    /// Replace all network attachments with a single one.
    pub fn attach_only(&mut self, network: &str, aliases: Vec<String>) {
        self.task_template.networks = vec![NetworkAttachment {
            target: network.to_string(),
            aliases,
        }];
    }

    /// Look up an environment variable in the container spec.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.task_template
            .container_spec
            .env
            .iter()
            .find_map(|entry| match entry.split_once('=') {
                Some((k, v)) if k == key => Some(v),
                _ => None,
            })
    }

    /// Set an environment variable, replacing any existing entry.
    pub fn set_env(&mut self, key: &str, value: &str) {
        let env = &mut self.task_template.container_spec.env;
        let entry = format!("{key}={value}");
        match env
            .iter_mut()
            .find(|e| e.split_once('=').map(|(k, _)| k) == Some(key))
        {
            Some(existing) => *existing = entry,
            None => env.push(entry),
        }
    }

    /// Image the task template runs.
    pub fn image(&self) -> &str {
        &self.task_template.container_spec.image
    }

    pub fn set_image(&mut self, image: &str) {
        self.task_template.container_spec.image = image.to_string();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskTemplate {
    pub container_spec: ContainerSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<NetworkAttachment>,

    /// Counter that forces a redeploy when incremented, even if nothing else changed.
    #[serde(default)]
    pub force_update: u64,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSpec {
    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Container health probe. Durations are in nanoseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthCheck {
    pub test: Vec<String>,
    #[serde(default)]
    pub interval: i64,
    #[serde(default)]
    pub timeout: i64,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub start_period: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Mount {
    #[serde(rename = "Type")]
    pub kind: String,
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RestartPolicy {
    pub condition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkAttachment {
    pub target: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceMode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicated: Option<Replicated>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Replicated {
    pub replicas: u64,
}

/// Rolling update (or rollback) policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateConfig {
    pub parallelism: u64,
    #[serde(default)]
    pub delay: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<String>,
}

/// A service as reported by the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Service {
    #[serde(rename = "ID")]
    pub id: String,

    /// Optimistic-concurrency token; must be echoed back on update.
    #[serde(default)]
    pub version: Option<ObjectVersion>,

    pub spec: ServiceSpec,
}

impl Service {
    /// Version index to pass to an update, if the platform reported one.
    pub fn version_index(&self) -> Option<u64> {
        self.version.as_ref().map(|v| v.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ObjectVersion {
    pub index: u64,
}

/// A scheduled instance of a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Task {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(default)]
    pub status: TaskStatus,

    #[serde(default)]
    pub desired_state: String,
}

impl Task {
    /// Observed state is `running`.
    pub fn is_running(&self) -> bool {
        self.status.state == "running"
    }

    /// Container backing this task, once one has been created.
    pub fn container_id(&self) -> Option<&str> {
        self.status
            .container_status
            .as_ref()
            .and_then(|c| c.container_id.as_deref())
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskStatus {
    #[serde(default)]
    pub state: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_status: Option<ContainerStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerStatus {
    #[serde(rename = "ContainerID", default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

/// Runtime state of a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub running: bool,

    /// Absent when the container has no health check configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<ContainerHealth>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerHealth {
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Volume {
    pub name: String,

    #[serde(default)]
    pub driver: String,

    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Network {
    #[serde(rename = "Id")]
    pub id: String,

    #[serde(rename = "Name")]
    pub name: String,
}

/// Local image metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    #[serde(rename = "Id")]
    pub id: String,

    #[serde(rename = "RepoDigests", default)]
    pub repo_digests: Vec<String>,
}

impl Image {
    /// Content digest of the image.
    ///
    /// Prefers the registry manifest digest (`repo@sha256:...`) and falls
    /// back to the local image ID for images that were never pushed.
    pub fn digest(&self) -> &str {
        self.repo_digests
            .iter()
            .find_map(|d| d.rsplit_once('@').map(|(_, digest)| digest))
            .unwrap_or(self.id.as_str())
    }
}

/// One progress message from an image pull.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullProgress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PullProgress {
    /// A status line.
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: Some(status.into()),
            ..Self::default()
        }
    }

    /// The pull fetched an image that differs from the local copy.
    pub fn is_newer_image(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|s| s.contains("Downloaded newer image"))
    }
}
