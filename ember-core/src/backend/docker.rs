// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Docker engine adapter.
//!
//! Containers join a pre-created bridge network at create time, so their
//! addresses are routable from the host and no NAT port is needed. Docker
//! cannot relabel a container after create; IPs are re-read via inspect.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use thiserror::Error;

use super::{
    Backend, ContainerHandle, ContainerSpec, NetworkAttachment, TaskStatus, LABEL_FUNCTION,
};
use crate::error::BackendError;
use crate::types::{ContainerId, FunctionId};

/// Error returned by the Docker SDK: HTTP status plus daemon message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("docker daemon returned {status}: {message}")]
pub struct DockerApiError {
    pub status: u16,
    pub message: String,
}

impl DockerApiError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Row of `GET /containers/json`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DockerContainerSummary {
    pub id: String,
    /// Names as the daemon reports them, with a leading `/`.
    pub names: Vec<String>,
    pub labels: HashMap<String, String>,
    pub state: String,
}

/// Subset of `GET /containers/{id}/json` the adapter reads.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DockerInspect {
    pub state: String,
    /// Network name → IP address; empty string when not yet assigned.
    pub networks: HashMap<String, String>,
}

/// Body of `POST /containers/create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerCreateConfig {
    pub image: String,
    /// `KEY=VALUE` entries, sorted for stable requests.
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub network_mode: String,
    pub exposed_port: u16,
}

/// Docker SDK surface consumed by [`DockerBackend`].
#[async_trait]
pub trait DockerApi: Send + Sync {
    /// List containers (including stopped ones) matching `label=value`.
    async fn container_list(&self, label_filter: &str)
        -> Result<Vec<DockerContainerSummary>, DockerApiError>;

    /// Returns the new container ID.
    async fn container_create(
        &self,
        name: &str,
        config: &DockerCreateConfig,
    ) -> Result<String, DockerApiError>;

    async fn container_start(&self, id: &str) -> Result<(), DockerApiError>;

    async fn container_inspect(&self, id: &str) -> Result<DockerInspect, DockerApiError>;

    async fn container_pause(&self, id: &str) -> Result<(), DockerApiError>;

    async fn container_unpause(&self, id: &str) -> Result<(), DockerApiError>;

    async fn container_remove(&self, id: &str, force: bool) -> Result<(), DockerApiError>;

    async fn network_connect(&self, network: &str, id: &str) -> Result<(), DockerApiError>;

    async fn image_inspect(&self, image: &str) -> Result<(), DockerApiError>;

    async fn image_pull(&self, image: &str) -> Result<(), DockerApiError>;

    async fn close(&self) -> Result<(), DockerApiError>;
}

/// [`Backend`] over the Docker daemon.
pub struct DockerBackend<C> {
    client: C,
    network: String,
}

impl<C: DockerApi> DockerBackend<C> {
    pub fn new(client: C, network: impl Into<String>) -> Self {
        Self {
            client,
            network: network.into(),
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    fn classify(&self, operation: &'static str, id: &str, err: DockerApiError) -> BackendError {
        let message = err.message.to_ascii_lowercase();
        if err.status == 404 || message.contains("no such container") {
            BackendError::NotFound { id: id.to_string() }
        } else if message.contains("already connected")
            || message.contains("already exists in network")
        {
            BackendError::AlreadyConnected {
                id: id.to_string(),
                network: self.network.clone(),
            }
        } else {
            BackendError::engine(operation, err.to_string())
        }
    }

    async fn connect(&self, id: &ContainerId) -> Result<(), BackendError> {
        self.client
            .network_connect(&self.network, id.as_str())
            .await
            .map_err(|e| self.classify("network connect", id.as_str(), e))
    }
}

fn parse_state(state: &str) -> TaskStatus {
    match state {
        "running" | "restarting" => TaskStatus::Running,
        "paused" => TaskStatus::Paused,
        "created" => TaskStatus::Created,
        "exited" | "dead" | "removing" => TaskStatus::Stopped,
        _ => TaskStatus::Unknown,
    }
}

#[async_trait]
impl<C: DockerApi> Backend for DockerBackend<C> {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn host_routable(&self) -> bool {
        true
    }

    async fn ensure_image(&self, image: &str) -> Result<(), BackendError> {
        match self.client.image_inspect(image).await {
            Ok(()) => Ok(()),
            Err(e) if e.status == 404 => {
                tracing::info!(image = %image, "Pulling image");
                self.client
                    .image_pull(image)
                    .await
                    .map_err(|e| BackendError::engine("image pull", e.to_string()))
            }
            Err(e) => Err(BackendError::engine("image inspect", e.to_string())),
        }
    }

    async fn list_by_label(
        &self,
        function: &FunctionId,
    ) -> Result<Vec<ContainerHandle>, BackendError> {
        let filter = format!("{}={}", LABEL_FUNCTION, function);
        let containers = self
            .client
            .container_list(&filter)
            .await
            .map_err(|e| BackendError::engine("container list", e.to_string()))?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerHandle {
                name: c
                    .names
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                id: ContainerId::new(c.id),
                labels: c.labels,
            })
            .collect())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, BackendError> {
        let mut env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.sort();

        let config = DockerCreateConfig {
            image: spec.image.clone(),
            env,
            labels: spec.labels.clone(),
            network_mode: self.network.clone(),
            exposed_port: spec.container_port,
        };

        let id = self
            .client
            .container_create(&spec.name, &config)
            .await
            .map_err(|e| BackendError::engine("container create", e.to_string()))?;

        Ok(ContainerHandle {
            id: ContainerId::new(id),
            name: spec.name.clone(),
            labels: spec.labels.clone(),
        })
    }

    async fn start_task(&self, id: &ContainerId) -> Result<(), BackendError> {
        self.client
            .container_start(id.as_str())
            .await
            .map_err(|e| self.classify("container start", id.as_str(), e))
    }

    async fn task_status(&self, id: &ContainerId) -> Result<TaskStatus, BackendError> {
        let inspect = self
            .client
            .container_inspect(id.as_str())
            .await
            .map_err(|e| self.classify("container inspect", id.as_str(), e))?;
        Ok(parse_state(&inspect.state))
    }

    async fn pause(&self, id: &ContainerId) -> Result<(), BackendError> {
        self.client
            .container_pause(id.as_str())
            .await
            .map_err(|e| self.classify("container pause", id.as_str(), e))
    }

    async fn resume(&self, id: &ContainerId) -> Result<(), BackendError> {
        self.client
            .container_unpause(id.as_str())
            .await
            .map_err(|e| self.classify("container unpause", id.as_str(), e))
    }

    async fn delete(&self, id: &ContainerId, kill_task_first: bool) -> Result<(), BackendError> {
        self.client
            .container_remove(id.as_str(), kill_task_first)
            .await
            .map_err(|e| self.classify("container remove", id.as_str(), e))
    }

    async fn connect_network(
        &self,
        id: &ContainerId,
        _attachment: &NetworkAttachment,
    ) -> Result<(), BackendError> {
        // The daemon owns IPAM for its networks; CNI documents do not apply
        self.connect(id).await
    }

    async fn reattach(&self, id: &ContainerId) -> Result<(), BackendError> {
        self.connect(id).await
    }

    async fn inspect_network(
        &self,
        id: &ContainerId,
    ) -> Result<HashMap<String, IpAddr>, BackendError> {
        let inspect = self
            .client
            .container_inspect(id.as_str())
            .await
            .map_err(|e| self.classify("container inspect", id.as_str(), e))?;

        Ok(inspect
            .networks
            .into_iter()
            .filter_map(|(network, ip)| ip.parse().ok().map(|ip| (network, ip)))
            .collect())
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.client
            .close()
            .await
            .map_err(|e| BackendError::engine("close", e.to_string()))
    }
}
