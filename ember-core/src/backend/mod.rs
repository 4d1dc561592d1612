// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Container engine adapters.
//!
//! The orchestrator drives every engine through the [`Backend`] contract.
//! Each adapter wraps an engine-SDK-shaped client trait supplied by the
//! embedding process, so engines can be swapped or faked in tests.

mod containerd;
mod docker;

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::BackendError;
use crate::state::LifecycleState;
use crate::types::{ContainerId, FunctionId, HostPort};

pub use containerd::{
    resolve_snapshotter, ContainerdApi, ContainerdApiError, ContainerdBackend, ContainerdContainer,
    ContainerdErrorCode, ContainerdSettings, ContainerdSpec, ContainerdTaskStatus,
    DEFAULT_RUNTIME, RUNTIME_FIRECRACKER, SNAPSHOTTER_DEVMAPPER, SNAPSHOTTER_OVERLAY,
};
pub use docker::{
    DockerApi, DockerApiError, DockerBackend, DockerContainerSummary, DockerCreateConfig,
    DockerInspect,
};

/// Label carrying the function identity; used for warm-start lookup.
pub const LABEL_FUNCTION: &str = "ember.function";
/// Label persisting the instance IP once the network is up.
pub const LABEL_IP: &str = "ember.ip";
/// Label persisting the host NAT port once allocated.
pub const LABEL_PORT: &str = "ember.port";

/// Engine-side view of one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: ContainerId,
    pub name: String,
    pub labels: HashMap<String, String>,
}

impl ContainerHandle {
    pub fn function(&self) -> Option<&str> {
        self.labels.get(LABEL_FUNCTION).map(String::as_str)
    }

    /// IP recovered from labels written at cold-start completion.
    pub fn persisted_ip(&self) -> Option<IpAddr> {
        self.labels.get(LABEL_IP).and_then(|ip| ip.parse().ok())
    }

    /// Host port recovered from labels written at cold-start completion.
    pub fn persisted_port(&self) -> Option<HostPort> {
        self.labels
            .get(LABEL_PORT)
            .and_then(|port| port.parse::<u16>().ok())
            .and_then(|port| HostPort::new(port).ok())
    }
}

/// Everything an engine needs to create one function container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Requested container name, unique per cold start.
    pub name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    /// Port the function runtime listens on inside the container.
    pub container_port: u16,
}

/// Execution task status as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Created,
    Running,
    Paused,
    Stopped,
    Unknown,
}

impl TaskStatus {
    /// Lifecycle state the orchestrator assigns to an instance in this status.
    /// Anything neither running nor paused is an orphan to clean up.
    pub fn lifecycle(&self) -> LifecycleState {
        match self {
            Self::Running => LifecycleState::Running,
            Self::Paused => LifecycleState::Paused,
            Self::Created | Self::Stopped | Self::Unknown => LifecycleState::Stopped,
        }
    }
}

/// Host → container NAT mapping handed to the portmap plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: HostPort,
    pub container_port: u16,
}

/// Network request for a freshly started instance.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkAttachment {
    /// Network name the instance joins.
    pub network: String,
    /// Rendered per-instance CNI document, when the engine attaches via CNI.
    pub cni_config: Option<Value>,
    pub port_mapping: Option<PortMapping>,
}

/// Uniform lifecycle contract over a container engine.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether container addresses are reachable from the host without NAT.
    fn host_routable(&self) -> bool;

    /// Make `image` available locally. No-op when already cached.
    async fn ensure_image(&self, image: &str) -> Result<(), BackendError>;

    /// Containers labeled with `function`, in engine order.
    async fn list_by_label(
        &self,
        function: &FunctionId,
    ) -> Result<Vec<ContainerHandle>, BackendError>;

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, BackendError>;

    /// Create and start the container's execution task.
    async fn start_task(&self, id: &ContainerId) -> Result<(), BackendError>;

    async fn task_status(&self, id: &ContainerId) -> Result<TaskStatus, BackendError>;

    async fn pause(&self, id: &ContainerId) -> Result<(), BackendError>;

    async fn resume(&self, id: &ContainerId) -> Result<(), BackendError>;

    /// Remove the container and its snapshot. With `kill_task_first` the
    /// task is force-stopped before removal.
    async fn delete(&self, id: &ContainerId, kill_task_first: bool) -> Result<(), BackendError>;

    async fn connect_network(
        &self,
        id: &ContainerId,
        attachment: &NetworkAttachment,
    ) -> Result<(), BackendError>;

    /// Re-attach an existing instance to the agent network.
    /// Reports [`BackendError::AlreadyConnected`] when nothing had to change.
    async fn reattach(&self, id: &ContainerId) -> Result<(), BackendError>;

    /// IP addresses keyed by network name.
    async fn inspect_network(&self, id: &ContainerId)
        -> Result<HashMap<String, IpAddr>, BackendError>;

    /// Merge `labels` into the container metadata.
    /// Returns `Ok(false)` when the engine cannot update labels after create.
    async fn persist_labels(
        &self,
        _id: &ContainerId,
        _labels: &HashMap<String, String>,
    ) -> Result<bool, BackendError> {
        Ok(false)
    }

    async fn close(&self) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(labels: &[(&str, &str)]) -> ContainerHandle {
        ContainerHandle {
            id: ContainerId::new("c1"),
            name: "ember-echo-1".to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_handle_persisted_labels() {
        let h = handle(&[
            (LABEL_FUNCTION, "echo"),
            (LABEL_IP, "10.88.1.2"),
            (LABEL_PORT, "20001"),
        ]);
        assert_eq!(h.function(), Some("echo"));
        assert_eq!(h.persisted_ip(), Some("10.88.1.2".parse().unwrap()));
        assert_eq!(h.persisted_port(), Some(HostPort::new(20001).unwrap()));
    }

    #[test]
    fn test_handle_ignores_garbage_labels() {
        let h = handle(&[(LABEL_IP, "nope"), (LABEL_PORT, "0")]);
        assert_eq!(h.persisted_ip(), None);
        assert_eq!(h.persisted_port(), None);
    }

    #[test]
    fn test_task_status_lifecycle() {
        assert_eq!(TaskStatus::Running.lifecycle(), LifecycleState::Running);
        assert_eq!(TaskStatus::Paused.lifecycle(), LifecycleState::Paused);
        assert_eq!(TaskStatus::Stopped.lifecycle(), LifecycleState::Stopped);
        assert_eq!(TaskStatus::Created.lifecycle(), LifecycleState::Stopped);
        assert_eq!(TaskStatus::Unknown.lifecycle(), LifecycleState::Stopped);
    }
}
