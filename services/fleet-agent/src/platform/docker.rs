//! Docker Engine API client (swarm mode).
//!
//! Talks HTTP/1.1 to the Docker daemon over its unix socket. Only the
//! endpoints the orchestrator needs are implemented.
//!
//! Reference: https://docs.docker.com/reference/api/engine/version/v1.43/

use std::collections::BTreeMap;

use async_trait::async_trait;
use hyper::body::{Buf, Bytes, HttpBody};
use hyper::{Body, Client, Method, Request, Response, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::{
    ContainerState, Image, ImageRef, Network, Platform, PlatformError, PlatformResult,
    PullProgress, PullProgressStream, Service, ServiceSpec, Task, Volume,
};

/// Default daemon socket.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/docker.sock";

/// Engine API version the request paths are pinned to.
pub const DEFAULT_API_VERSION: &str = "v1.43";

/// Docker client configuration.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Path to the daemon's unix socket.
    pub socket_path: String,

    /// API version prefix, e.g. `v1.43`.
    pub api_version: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
        }
    }
}

/// Docker Engine API client for unix socket communication.
pub struct DockerPlatform {
    socket_path: String,
    api_version: String,
    client: Client<UnixConnector>,
}

impl DockerPlatform {
    /// Create a client for the configured socket. No connection is made
    /// until the first request.
    pub fn new(config: DockerConfig) -> Self {
        Self {
            socket_path: config.socket_path,
            api_version: config.api_version,
            client: Client::unix(),
        }
    }

    /// Send a request and return the raw response, whatever its status.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> PlatformResult<Response<Body>> {
        let uri = Uri::new(&self.socket_path, &format!("/{}{}", self.api_version, path));

        debug!(method = %method, path = path, "Docker API request");

        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json");

        let request = match body {
            Some(bytes) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(bytes)),
            None => builder.body(Body::empty()),
        }
        .map_err(|e| PlatformError::Transport(e.to_string()))?;

        self.client
            .request(request)
            .await
            .map_err(|e| PlatformError::Transport(e.to_string()))
    }

    /// Send a request and collect the body of a successful response.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> PlatformResult<Bytes> {
        let response = self.send(method, path, body).await?;
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| PlatformError::Transport(e.to_string()))?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(classify(status, &body))
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> PlatformResult<T> {
        let body = self.call(Method::GET, path, None).await?;
        Ok(serde_json::from_reader(body.reader())?)
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> PlatformResult<T> {
        let bytes = serde_json::to_vec(body)?;
        let body = self.call(Method::POST, path, Some(bytes)).await?;
        Ok(serde_json::from_reader(body.reader())?)
    }
}

/// Docker's error body.
#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Deserialize)]
struct CreateServiceResponse {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    state: ContainerState,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateVolumeRequest<'a> {
    name: &'a str,
    labels: &'a BTreeMap<String, String>,
}

/// Map an error response to a platform error.
///
/// Swarm reports a stale version token as a 500 "update out of sequence";
/// that is a conflict as far as callers are concerned.
fn classify(status: StatusCode, body: &[u8]) -> PlatformError {
    let message = serde_json::from_slice::<ErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string());

    match status {
        StatusCode::NOT_FOUND => PlatformError::NotFound(message),
        StatusCode::CONFLICT => PlatformError::Conflict(message),
        _ if message.contains("update out of sequence") => PlatformError::Conflict(message),
        _ => {
            error!(status = %status, message = %message, "Docker API error");
            PlatformError::Api {
                status: status.as_u16(),
                message,
            }
        }
    }
}

/// Build a `?filters=` query string.
fn filters_query(key: &str, values: &[&str]) -> PlatformResult<String> {
    let mut filters = BTreeMap::new();
    filters.insert(key, values);
    let json = serde_json::to_string(&filters)?;
    serde_urlencoded::to_string([("filters", json.as_str())])
        .map_err(|e| PlatformError::Decode(e.to_string()))
}

fn decode_progress(line: &[u8]) -> PlatformResult<PullProgress> {
    let progress: PullProgress = serde_json::from_slice(line)?;
    match progress.error {
        Some(message) => Err(PlatformError::Pull(message)),
        None => Ok(progress),
    }
}

/// Turn a newline-delimited JSON response body into a stream of progress
/// messages, decoding each line as soon as it arrives.
fn progress_stream(body: Body) -> PullProgressStream {
    let state = (body, Vec::<u8>::new(), false);

    Box::pin(futures_util::stream::unfold(
        state,
        |(mut body, mut buf, mut done)| async move {
            loop {
                if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    return Some((decode_progress(&line), (body, buf, done)));
                }

                if done {
                    if buf.iter().all(u8::is_ascii_whitespace) {
                        return None;
                    }
                    let line = std::mem::take(&mut buf);
                    return Some((decode_progress(&line), (body, buf, done)));
                }

                match body.data().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        buf.clear();
                        done = true;
                        let err = PlatformError::Transport(e.to_string());
                        return Some((Err(err), (body, buf, done)));
                    }
                    None => done = true,
                }
            }
        },
    ))
}

#[async_trait]
impl Platform for DockerPlatform {
    async fn ping(&self) -> PlatformResult<()> {
        self.call(Method::GET, "/_ping", None).await?;
        Ok(())
    }

    async fn create_service(&self, spec: &ServiceSpec) -> PlatformResult<String> {
        let response: CreateServiceResponse = self.post_json("/services/create", spec).await?;
        Ok(response.id)
    }

    async fn update_service(
        &self,
        name: &str,
        version: u64,
        spec: &ServiceSpec,
    ) -> PlatformResult<()> {
        let path = format!("/services/{name}/update?version={version}");
        let bytes = serde_json::to_vec(spec)?;
        self.call(Method::POST, &path, Some(bytes)).await?;
        Ok(())
    }

    async fn remove_service(&self, name: &str) -> PlatformResult<()> {
        self.call(Method::DELETE, &format!("/services/{name}"), None)
            .await?;
        Ok(())
    }

    async fn inspect_service(&self, name: &str) -> PlatformResult<Service> {
        self.get_json(&format!("/services/{name}")).await
    }

    async fn list_services(&self, label: &str) -> PlatformResult<Vec<Service>> {
        let query = filters_query("label", &[label])?;
        self.get_json(&format!("/services?{query}")).await
    }

    async fn list_tasks(&self, service: &str) -> PlatformResult<Vec<Task>> {
        let query = filters_query("service", &[service])?;
        self.get_json(&format!("/tasks?{query}")).await
    }

    async fn inspect_container(&self, id: &str) -> PlatformResult<ContainerState> {
        let inspect: ContainerInspect = self.get_json(&format!("/containers/{id}/json")).await?;
        Ok(inspect.state)
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> PlatformResult<Volume> {
        self.post_json("/volumes/create", &CreateVolumeRequest { name, labels })
            .await
    }

    async fn inspect_volume(&self, name: &str) -> PlatformResult<Volume> {
        self.get_json(&format!("/volumes/{name}")).await
    }

    async fn inspect_network(&self, name: &str) -> PlatformResult<Network> {
        self.get_json(&format!("/networks/{name}")).await
    }

    async fn pull_image(&self, image: &str) -> PlatformResult<PullProgressStream> {
        let (from_image, tag) = ImageRef::parse(image).pull_params();
        let query = serde_urlencoded::to_string([("fromImage", from_image), ("tag", tag)])
            .map_err(|e| PlatformError::Decode(e.to_string()))?;

        let response = self
            .send(Method::POST, &format!("/images/create?{query}"), None)
            .await?;
        let status = response.status();

        if !status.is_success() {
            let body = hyper::body::to_bytes(response.into_body())
                .await
                .map_err(|e| PlatformError::Transport(e.to_string()))?;
            return Err(classify(status, &body));
        }

        Ok(progress_stream(response.into_body()))
    }

    async fn inspect_image(&self, image: &str) -> PlatformResult<Image> {
        self.get_json(&format!("/images/{image}/json")).await
    }
}
