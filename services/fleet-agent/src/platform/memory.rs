//! In-memory platform for testing and development.
//!
//! Simulates just enough of a swarm to exercise the orchestrator: services
//! with version tokens, one task per running replica, containers whose
//! health follows a configurable [`WorkerBehavior`], volumes, networks, and
//! a registry of "remote" image digests that pulls compare against.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use super::{
    ContainerHealth, ContainerState, ContainerStatus, Image, Network, ObjectVersion, Platform,
    PlatformError, PlatformResult, PullProgress, PullProgressStream, Service, ServiceSpec, Task,
    TaskStatus, Volume,
};

/// How containers of a service behave once scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerBehavior {
    /// Reports `healthy` from the first inspection.
    Healthy,
    /// Reports `starting` for this many inspections, then `healthy`.
    HealthyAfter(u32),
    /// Reports `starting` forever.
    NeverHealthy,
    /// Reports `unhealthy`.
    Unhealthy,
    /// Running without a health check configured.
    NoHealthCheck,
}

/// A mutating call observed by the platform, for assertions in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCall {
    CreateService(String),
    UpdateService(String),
    RemoveService(String),
    CreateVolume(String),
    PullImage(String),
}

struct ContainerSim {
    behavior: WorkerBehavior,
    inspections: u32,
    running: bool,
}

#[derive(Default)]
struct State {
    next_id: u64,
    services: BTreeMap<String, Service>,
    tasks: HashMap<String, Vec<Task>>,
    containers: HashMap<String, ContainerSim>,
    volumes: BTreeMap<String, Volume>,
    networks: BTreeMap<String, Network>,
    local_images: HashMap<String, String>,
    remote_images: HashMap<String, String>,
    behaviors: HashMap<String, WorkerBehavior>,
    failing_updates: HashSet<String>,
    conflict_on_next_create: bool,
    keep_stale_tasks: bool,
    calls: Vec<PlatformCall>,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{:08x}", self.next_id)
    }

    fn find_service_name(&self, name_or_id: &str) -> Option<String> {
        if self.services.contains_key(name_or_id) {
            return Some(name_or_id.to_string());
        }
        self.services
            .iter()
            .find(|(_, s)| s.id == name_or_id)
            .map(|(name, _)| name.clone())
    }

    /// Bring the service's tasks in line with its spec: shut down old tasks
    /// and schedule a fresh one if a replica is wanted.
    fn reschedule(&mut self, name: &str, default_behavior: WorkerBehavior) {
        let Some(service) = self.services.get(name) else {
            return;
        };
        let replicas = service.spec.replicas();
        let behavior = self
            .behaviors
            .get(name)
            .copied()
            .unwrap_or(default_behavior);

        let keep_stale = self.keep_stale_tasks && replicas == 0;
        let tasks = self.tasks.entry(name.to_string()).or_default();
        if !keep_stale {
            for task in tasks.iter_mut() {
                task.status.state = "shutdown".to_string();
                task.desired_state = "shutdown".to_string();
            }
        }
        let stopped: Vec<String> = if keep_stale {
            Vec::new()
        } else {
            tasks
                .iter()
                .filter_map(|t| t.container_id().map(str::to_string))
                .collect()
        };

        for container in stopped {
            if let Some(sim) = self.containers.get_mut(&container) {
                sim.running = false;
            }
        }

        if replicas > 0 {
            let task_id = self.next_id("task");
            let container_id = self.next_id("ctr");
            self.containers.insert(
                container_id.clone(),
                ContainerSim {
                    behavior,
                    inspections: 0,
                    running: true,
                },
            );
            self.tasks.entry(name.to_string()).or_default().push(Task {
                id: task_id,
                status: TaskStatus {
                    state: "running".to_string(),
                    container_status: Some(ContainerStatus {
                        container_id: Some(container_id),
                    }),
                },
                desired_state: "running".to_string(),
            });
        }
    }
}

/// In-memory platform for testing and development.
pub struct MemoryPlatform {
    state: Mutex<State>,
    default_behavior: WorkerBehavior,
}

impl MemoryPlatform {
    /// Create an empty platform whose workers become healthy immediately.
    pub fn new() -> Self {
        Self::with_behavior(WorkerBehavior::Healthy)
    }

    /// Create an empty platform with the given default worker behavior.
    pub fn with_behavior(default_behavior: WorkerBehavior) -> Self {
        Self {
            state: Mutex::new(State::default()),
            default_behavior,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a network; returns its ID.
    pub fn add_network(&self, name: &str) -> String {
        let mut state = self.state();
        let id = state.next_id("net");
        state.networks.insert(
            name.to_string(),
            Network {
                id: id.clone(),
                name: name.to_string(),
            },
        );
        id
    }

    /// Override worker behavior for one service (applies to tasks scheduled later).
    pub fn set_behavior(&self, service: &str, behavior: WorkerBehavior) {
        self.state()
            .behaviors
            .insert(service.to_string(), behavior);
    }

    /// Make every update of the named service fail with an API error.
    pub fn fail_updates_for(&self, service: &str) {
        self.state().failing_updates.insert(service.to_string());
    }

    /// The next create behaves as if a concurrent creator won the race: the
    /// service appears (scaled to zero) and the call returns `Conflict`.
    pub fn conflict_on_next_create(&self) {
        self.state().conflict_on_next_create = true;
    }

    /// Leave running tasks listed after a scale-down, like a lagging task view.
    pub fn keep_stale_tasks(&self, keep: bool) {
        self.state().keep_stale_tasks = keep;
    }

    /// Set the digest a pull of `image` will fetch.
    pub fn publish_image(&self, image: &str, digest: &str) {
        self.state()
            .remote_images
            .insert(image.to_string(), digest.to_string());
    }

    /// Put an image in the local image store without pulling.
    pub fn seed_local_image(&self, image: &str, digest: &str) {
        self.state()
            .local_images
            .insert(image.to_string(), digest.to_string());
    }

    /// Insert a service directly, bypassing `create_service`.
    pub fn seed_service(&self, spec: ServiceSpec) {
        let mut state = self.state();
        let id = state.next_id("svc");
        let name = spec.name.clone();
        state.services.insert(
            name.clone(),
            Service {
                id,
                version: Some(ObjectVersion { index: 1 }),
                spec,
            },
        );
        state.reschedule(&name, self.default_behavior);
    }

    /// Force the state of a service's current tasks, e.g. `preparing`.
    pub fn set_task_state(&self, service: &str, task_state: &str) {
        if let Some(tasks) = self.state().tasks.get_mut(service) {
            for task in tasks.iter_mut().filter(|t| t.desired_state == "running") {
                task.status.state = task_state.to_string();
            }
        }
    }

    /// Drop a service's version token, as a misbehaving platform might.
    pub fn clear_version(&self, name: &str) {
        if let Some(service) = self.state().services.get_mut(name) {
            service.version = None;
        }
    }

    /// Current spec of a service.
    pub fn service(&self, name: &str) -> Option<Service> {
        self.state().services.get(name).cloned()
    }

    /// Number of services on the platform.
    pub fn service_count(&self) -> usize {
        self.state().services.len()
    }

    /// Names of all volumes.
    pub fn volume_names(&self) -> Vec<String> {
        self.state().volumes.keys().cloned().collect()
    }

    /// Drop a service as if the platform lost it.
    pub fn lose_service(&self, name: &str) {
        let mut state = self.state();
        state.services.remove(name);
        state.tasks.remove(name);
    }

    /// Mutating calls seen so far.
    pub fn calls(&self) -> Vec<PlatformCall> {
        self.state().calls.clone()
    }

    /// Number of recorded calls matching the predicate.
    pub fn count_calls(&self, f: impl Fn(&PlatformCall) -> bool) -> usize {
        self.state().calls.iter().filter(|c| f(c)).count()
    }
}

impl Default for MemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Platform for MemoryPlatform {
    async fn ping(&self) -> PlatformResult<()> {
        Ok(())
    }

    async fn create_service(&self, spec: &ServiceSpec) -> PlatformResult<String> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        state
            .calls
            .push(PlatformCall::CreateService(spec.name.clone()));

        if state.services.contains_key(&spec.name) {
            return Err(PlatformError::Conflict(format!(
                "service {} already exists",
                spec.name
            )));
        }

        let id = state.next_id("svc");

        if std::mem::take(&mut state.conflict_on_next_create) {
            let mut raced = spec.clone();
            raced.set_replicas(0);
            state.services.insert(
                spec.name.clone(),
                Service {
                    id,
                    version: Some(ObjectVersion { index: 1 }),
                    spec: raced,
                },
            );
            return Err(PlatformError::Conflict(format!(
                "service {} already exists",
                spec.name
            )));
        }

        debug!(service = %spec.name, "[MEMORY] Creating service");
        state.services.insert(
            spec.name.clone(),
            Service {
                id: id.clone(),
                version: Some(ObjectVersion { index: 1 }),
                spec: spec.clone(),
            },
        );
        state.reschedule(&spec.name, self.default_behavior);
        Ok(id)
    }

    async fn update_service(
        &self,
        name: &str,
        version: u64,
        spec: &ServiceSpec,
    ) -> PlatformResult<()> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        state.calls.push(PlatformCall::UpdateService(name.to_string()));

        if state.failing_updates.contains(name) {
            return Err(PlatformError::Api {
                status: 500,
                message: format!("update of {name} rejected"),
            });
        }

        let service = state
            .services
            .get_mut(name)
            .ok_or_else(|| PlatformError::NotFound(format!("service {name} not found")))?;

        let current = service.version_index().unwrap_or(0);
        if current != version {
            return Err(PlatformError::Conflict(format!(
                "update out of sequence: have {current}, got {version}"
            )));
        }

        let needs_reschedule = service.spec.task_template != spec.task_template
            || service.spec.replicas() != spec.replicas();

        service.spec = spec.clone();
        service.version = Some(ObjectVersion { index: current + 1 });

        if needs_reschedule {
            state.reschedule(name, self.default_behavior);
        }
        Ok(())
    }

    async fn remove_service(&self, name: &str) -> PlatformResult<()> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        state.calls.push(PlatformCall::RemoveService(name.to_string()));

        if state.services.remove(name).is_none() {
            return Err(PlatformError::NotFound(format!("service {name} not found")));
        }
        state.tasks.remove(name);
        Ok(())
    }

    async fn inspect_service(&self, name: &str) -> PlatformResult<Service> {
        tokio::task::yield_now().await;
        self.state()
            .services
            .get(name)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("service {name} not found")))
    }

    async fn list_services(&self, label: &str) -> PlatformResult<Vec<Service>> {
        let (key, value) = label.split_once('=').unwrap_or((label, ""));
        Ok(self
            .state()
            .services
            .values()
            .filter(|s| match s.spec.labels.get(key) {
                Some(v) => value.is_empty() || v == value,
                None => false,
            })
            .cloned()
            .collect())
    }

    async fn list_tasks(&self, service: &str) -> PlatformResult<Vec<Task>> {
        tokio::task::yield_now().await;
        let state = self.state();
        let name = state.find_service_name(service).unwrap_or_default();
        Ok(state.tasks.get(&name).cloned().unwrap_or_default())
    }

    async fn inspect_container(&self, id: &str) -> PlatformResult<ContainerState> {
        let mut state = self.state();
        let sim = state
            .containers
            .get_mut(id)
            .ok_or_else(|| PlatformError::NotFound(format!("container {id} not found")))?;
        sim.inspections += 1;

        if !sim.running {
            return Ok(ContainerState {
                status: "exited".to_string(),
                running: false,
                health: None,
            });
        }

        let health = match sim.behavior {
            WorkerBehavior::Healthy => Some("healthy"),
            WorkerBehavior::HealthyAfter(n) if sim.inspections > n => Some("healthy"),
            WorkerBehavior::HealthyAfter(_) | WorkerBehavior::NeverHealthy => Some("starting"),
            WorkerBehavior::Unhealthy => Some("unhealthy"),
            WorkerBehavior::NoHealthCheck => None,
        };

        Ok(ContainerState {
            status: "running".to_string(),
            running: true,
            health: health.map(|status| ContainerHealth {
                status: status.to_string(),
            }),
        })
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> PlatformResult<Volume> {
        let mut state = self.state();
        state.calls.push(PlatformCall::CreateVolume(name.to_string()));
        let volume = state
            .volumes
            .entry(name.to_string())
            .or_insert_with(|| Volume {
                name: name.to_string(),
                driver: "local".to_string(),
                labels: Some(labels.clone()),
            })
            .clone();
        Ok(volume)
    }

    async fn inspect_volume(&self, name: &str) -> PlatformResult<Volume> {
        self.state()
            .volumes
            .get(name)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("volume {name} not found")))
    }

    async fn inspect_network(&self, name: &str) -> PlatformResult<Network> {
        let state = self.state();
        state
            .networks
            .values()
            .find(|n| n.name == name || n.id == name)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("network {name} not found")))
    }

    async fn pull_image(&self, image: &str) -> PlatformResult<PullProgressStream> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        state.calls.push(PlatformCall::PullImage(image.to_string()));

        let Some(remote) = state.remote_images.get(image).cloned() else {
            return Err(PlatformError::NotFound(format!(
                "manifest for {image} not found"
            )));
        };

        let mut progress = vec![Ok(PullProgress::status(format!(
            "Pulling from {image}"
        )))];
        let previous = state.local_images.insert(image.to_string(), remote.clone());
        progress.push(Ok(PullProgress::status(format!("Digest: {remote}"))));
        if previous.as_deref() == Some(remote.as_str()) {
            progress.push(Ok(PullProgress::status(format!(
                "Status: Image is up to date for {image}"
            ))));
        } else {
            progress.push(Ok(PullProgress::status(format!(
                "Status: Downloaded newer image for {image}"
            ))));
        }

        Ok(Box::pin(futures_util::stream::iter(progress)))
    }

    async fn inspect_image(&self, image: &str) -> PlatformResult<Image> {
        let state = self.state();
        let digest = state
            .local_images
            .get(image)
            .ok_or_else(|| PlatformError::NotFound(format!("no such image: {image}")))?;
        Ok(Image {
            id: format!("sha256:local-{digest}"),
            repo_digests: vec![format!("{image}@{digest}")],
        })
    }
}
