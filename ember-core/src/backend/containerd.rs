// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! containerd engine adapter.
//!
//! Tasks live in a private network namespace wired up through the CNI plugin
//! chain, so instances are reached through a host NAT port. Labels can be
//! updated after create, which lets IP and port survive an agent restart.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;

use super::{
    Backend, ContainerHandle, ContainerSpec, NetworkAttachment, PortMapping, TaskStatus,
    LABEL_FUNCTION, LABEL_IP,
};
use crate::error::BackendError;
use crate::types::{ContainerId, FunctionId};

/// Hardware-isolated microVM runtime; cannot mount overlay filesystems.
pub const RUNTIME_FIRECRACKER: &str = "aws.firecracker";
/// Block-device snapshotter required by microVM runtimes.
pub const SNAPSHOTTER_DEVMAPPER: &str = "devmapper";
/// General-purpose default snapshotter.
pub const SNAPSHOTTER_OVERLAY: &str = "overlayfs";

/// Default runc shim.
pub const DEFAULT_RUNTIME: &str = "io.containerd.runc.v2";

/// Pick the snapshotter for `runtime`.
///
/// A non-empty override wins outright; microVM runtimes get devmapper;
/// everything else uses overlayfs.
pub fn resolve_snapshotter(runtime: &str, override_snapshotter: Option<&str>) -> String {
    match override_snapshotter.map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ if runtime == RUNTIME_FIRECRACKER => SNAPSHOTTER_DEVMAPPER.to_string(),
        _ => SNAPSHOTTER_OVERLAY.to_string(),
    }
}

/// gRPC status classes surfaced by the containerd client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerdErrorCode {
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Unavailable,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("containerd {code:?}: {message}")]
pub struct ContainerdApiError {
    pub code: ContainerdErrorCode,
    pub message: String,
}

impl ContainerdApiError {
    pub fn new(code: ContainerdErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerdContainer {
    pub id: String,
    pub labels: HashMap<String, String>,
}

/// Arguments of `NewContainer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerdSpec {
    pub id: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub runtime: String,
    pub snapshotter: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerdTaskStatus {
    Created,
    Running,
    Paused,
    Pausing,
    Stopped,
    Unknown,
}

/// containerd client surface consumed by [`ContainerdBackend`].
/// Every call is scoped to a namespace.
#[async_trait]
pub trait ContainerdApi: Send + Sync {
    /// Containers matching a `labels."k"=="v"` filter.
    async fn containers(
        &self,
        namespace: &str,
        filter: &str,
    ) -> Result<Vec<ContainerdContainer>, ContainerdApiError>;

    async fn load_container(
        &self,
        namespace: &str,
        id: &str,
    ) -> Result<ContainerdContainer, ContainerdApiError>;

    async fn new_container(
        &self,
        namespace: &str,
        spec: &ContainerdSpec,
    ) -> Result<ContainerdContainer, ContainerdApiError>;

    async fn set_labels(
        &self,
        namespace: &str,
        id: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), ContainerdApiError>;

    async fn new_task(&self, namespace: &str, id: &str) -> Result<u32, ContainerdApiError>;

    async fn start_task(&self, namespace: &str, id: &str) -> Result<(), ContainerdApiError>;

    async fn task_status(
        &self,
        namespace: &str,
        id: &str,
    ) -> Result<ContainerdTaskStatus, ContainerdApiError>;

    async fn pause_task(&self, namespace: &str, id: &str) -> Result<(), ContainerdApiError>;

    async fn resume_task(&self, namespace: &str, id: &str) -> Result<(), ContainerdApiError>;

    async fn kill_task(&self, namespace: &str, id: &str) -> Result<(), ContainerdApiError>;

    async fn delete_task(&self, namespace: &str, id: &str) -> Result<(), ContainerdApiError>;

    async fn delete_container(
        &self,
        namespace: &str,
        id: &str,
        cleanup_snapshot: bool,
    ) -> Result<(), ContainerdApiError>;

    async fn get_image(&self, namespace: &str, image: &str) -> Result<(), ContainerdApiError>;

    async fn pull_image(
        &self,
        namespace: &str,
        image: &str,
        snapshotter: &str,
    ) -> Result<(), ContainerdApiError>;

    /// Run the CNI chain for the task's network namespace.
    /// Returns interface name → assigned address.
    async fn cni_setup(
        &self,
        namespace: &str,
        id: &str,
        config: &Value,
        port_mappings: &[PortMapping],
    ) -> Result<HashMap<String, IpAddr>, ContainerdApiError>;

    async fn cni_remove(
        &self,
        namespace: &str,
        id: &str,
        config: &Value,
        port_mappings: &[PortMapping],
    ) -> Result<(), ContainerdApiError>;

    async fn close(&self) -> Result<(), ContainerdApiError>;
}

/// Static settings for the containerd adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerdSettings {
    pub namespace: String,
    pub runtime: String,
    /// Explicit snapshotter; empty or `None` resolves from the runtime.
    pub snapshotter_override: Option<String>,
}

impl Default for ContainerdSettings {
    fn default() -> Self {
        Self {
            namespace: "ember".to_string(),
            runtime: DEFAULT_RUNTIME.to_string(),
            snapshotter_override: None,
        }
    }
}

/// What the CNI chain produced for one container; needed again on teardown.
#[derive(Debug, Clone)]
struct CniLease {
    network: String,
    config: Value,
    port_mappings: Vec<PortMapping>,
    addresses: HashMap<String, IpAddr>,
}

/// [`Backend`] over containerd with CNI networking.
pub struct ContainerdBackend<C> {
    client: C,
    namespace: String,
    runtime: String,
    snapshotter: String,
    leases: DashMap<ContainerId, CniLease>,
}

impl<C: ContainerdApi> ContainerdBackend<C> {
    pub fn new(client: C, settings: ContainerdSettings) -> Self {
        let snapshotter =
            resolve_snapshotter(&settings.runtime, settings.snapshotter_override.as_deref());

        tracing::info!(
            namespace = %settings.namespace,
            runtime = %settings.runtime,
            snapshotter = %snapshotter,
            "containerd backend configured"
        );

        Self {
            client,
            namespace: settings.namespace,
            runtime: settings.runtime,
            snapshotter,
            leases: DashMap::new(),
        }
    }

    pub fn snapshotter(&self) -> &str {
        &self.snapshotter
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    fn classify(operation: &'static str, id: &str, err: ContainerdApiError) -> BackendError {
        match err.code {
            ContainerdErrorCode::NotFound => BackendError::NotFound { id: id.to_string() },
            _ => BackendError::engine(operation, err.to_string()),
        }
    }

    /// Tolerates a missing task: the container may never have started one.
    async fn stop_task(&self, id: &str) -> Result<(), BackendError> {
        let ns = &self.namespace;
        match self.client.kill_task(ns, id).await {
            Ok(()) => {}
            Err(e) if e.code == ContainerdErrorCode::NotFound => return Ok(()),
            Err(e) => return Err(Self::classify("task kill", id, e)),
        }
        match self.client.delete_task(ns, id).await {
            Ok(()) => Ok(()),
            Err(e) if e.code == ContainerdErrorCode::NotFound => Ok(()),
            Err(e) => Err(Self::classify("task delete", id, e)),
        }
    }
}

fn to_handle(container: ContainerdContainer) -> ContainerHandle {
    ContainerHandle {
        name: container.id.clone(),
        id: ContainerId::new(container.id),
        labels: container.labels,
    }
}

#[async_trait]
impl<C: ContainerdApi> Backend for ContainerdBackend<C> {
    fn name(&self) -> &'static str {
        "containerd"
    }

    fn host_routable(&self) -> bool {
        false
    }

    async fn ensure_image(&self, image: &str) -> Result<(), BackendError> {
        match self.client.get_image(&self.namespace, image).await {
            Ok(()) => Ok(()),
            Err(e) if e.code == ContainerdErrorCode::NotFound => {
                tracing::info!(image = %image, snapshotter = %self.snapshotter, "Pulling image");
                self.client
                    .pull_image(&self.namespace, image, &self.snapshotter)
                    .await
                    .map_err(|e| BackendError::engine("image pull", e.to_string()))
            }
            Err(e) => Err(BackendError::engine("image get", e.to_string())),
        }
    }

    async fn list_by_label(
        &self,
        function: &FunctionId,
    ) -> Result<Vec<ContainerHandle>, BackendError> {
        let filter = format!("labels.{:?}=={:?}", LABEL_FUNCTION, function.as_str());
        let containers = self
            .client
            .containers(&self.namespace, &filter)
            .await
            .map_err(|e| BackendError::engine("container list", e.to_string()))?;
        Ok(containers.into_iter().map(to_handle).collect())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, BackendError> {
        let request = ContainerdSpec {
            id: spec.name.clone(),
            image: spec.image.clone(),
            env: spec.env.clone(),
            labels: spec.labels.clone(),
            runtime: self.runtime.clone(),
            snapshotter: self.snapshotter.clone(),
        };
        let container = self
            .client
            .new_container(&self.namespace, &request)
            .await
            .map_err(|e| BackendError::engine("container create", e.to_string()))?;
        Ok(to_handle(container))
    }

    async fn start_task(&self, id: &ContainerId) -> Result<(), BackendError> {
        let pid = self
            .client
            .new_task(&self.namespace, id.as_str())
            .await
            .map_err(|e| Self::classify("task create", id.as_str(), e))?;
        self.client
            .start_task(&self.namespace, id.as_str())
            .await
            .map_err(|e| Self::classify("task start", id.as_str(), e))?;

        tracing::debug!(container_id = %id, pid = pid, "Task started");
        Ok(())
    }

    async fn task_status(&self, id: &ContainerId) -> Result<TaskStatus, BackendError> {
        let status = self
            .client
            .task_status(&self.namespace, id.as_str())
            .await
            .map_err(|e| Self::classify("task status", id.as_str(), e))?;

        Ok(match status {
            ContainerdTaskStatus::Created => TaskStatus::Created,
            ContainerdTaskStatus::Running => TaskStatus::Running,
            ContainerdTaskStatus::Paused | ContainerdTaskStatus::Pausing => TaskStatus::Paused,
            ContainerdTaskStatus::Stopped => TaskStatus::Stopped,
            ContainerdTaskStatus::Unknown => TaskStatus::Unknown,
        })
    }

    async fn pause(&self, id: &ContainerId) -> Result<(), BackendError> {
        self.client
            .pause_task(&self.namespace, id.as_str())
            .await
            .map_err(|e| Self::classify("task pause", id.as_str(), e))
    }

    async fn resume(&self, id: &ContainerId) -> Result<(), BackendError> {
        self.client
            .resume_task(&self.namespace, id.as_str())
            .await
            .map_err(|e| Self::classify("task resume", id.as_str(), e))
    }

    async fn delete(&self, id: &ContainerId, kill_task_first: bool) -> Result<(), BackendError> {
        // The netns goes away with the task, so CNI teardown comes first
        if let Some((_, lease)) = self.leases.remove(id) {
            if let Err(e) = self
                .client
                .cni_remove(&self.namespace, id.as_str(), &lease.config, &lease.port_mappings)
                .await
            {
                tracing::warn!(container_id = %id, error = %e, "CNI teardown failed");
            }
        }

        if kill_task_first {
            self.stop_task(id.as_str()).await?;
        }

        self.client
            .delete_container(&self.namespace, id.as_str(), true)
            .await
            .map_err(|e| Self::classify("container delete", id.as_str(), e))
    }

    async fn connect_network(
        &self,
        id: &ContainerId,
        attachment: &NetworkAttachment,
    ) -> Result<(), BackendError> {
        if self.leases.contains_key(id) {
            return Err(BackendError::AlreadyConnected {
                id: id.to_string(),
                network: attachment.network.clone(),
            });
        }

        let config = attachment.cni_config.clone().ok_or_else(|| {
            BackendError::engine("network setup", "containerd requires a CNI configuration")
        })?;
        let port_mappings: Vec<PortMapping> = attachment.port_mapping.into_iter().collect();

        let addresses = self
            .client
            .cni_setup(&self.namespace, id.as_str(), &config, &port_mappings)
            .await
            .map_err(|e| Self::classify("network setup", id.as_str(), e))?;

        self.leases.insert(
            id.clone(),
            CniLease {
                network: attachment.network.clone(),
                config,
                port_mappings,
                addresses,
            },
        );
        Ok(())
    }

    async fn reattach(&self, id: &ContainerId) -> Result<(), BackendError> {
        // The task's netns keeps its CNI attachment for as long as it lives
        Err(BackendError::AlreadyConnected {
            id: id.to_string(),
            network: self
                .leases
                .get(id)
                .map(|lease| lease.network.clone())
                .unwrap_or_default(),
        })
    }

    async fn inspect_network(
        &self,
        id: &ContainerId,
    ) -> Result<HashMap<String, IpAddr>, BackendError> {
        if let Some(lease) = self.leases.get(id) {
            if let Some(ip) = lease.addresses.values().next() {
                return Ok(HashMap::from([(lease.network.clone(), *ip)]));
            }
        }

        // Attachment made by an earlier agent process: fall back to labels
        let container = self
            .client
            .load_container(&self.namespace, id.as_str())
            .await
            .map_err(|e| Self::classify("container load", id.as_str(), e))?;
        Ok(container
            .labels
            .get(LABEL_IP)
            .and_then(|ip| ip.parse().ok())
            .map(|ip| HashMap::from([(String::new(), ip)]))
            .unwrap_or_default())
    }

    async fn persist_labels(
        &self,
        id: &ContainerId,
        labels: &HashMap<String, String>,
    ) -> Result<bool, BackendError> {
        self.client
            .set_labels(&self.namespace, id.as_str(), labels)
            .await
            .map_err(|e| Self::classify("set labels", id.as_str(), e))?;
        Ok(true)
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.client
            .close()
            .await
            .map_err(|e| BackendError::engine("close", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_snapshotter_override() {
        assert_eq!(
            resolve_snapshotter(RUNTIME_FIRECRACKER, Some("native")),
            "native"
        );
        assert_eq!(resolve_snapshotter(DEFAULT_RUNTIME, Some("zfs")), "zfs");
    }

    #[test]
    fn test_resolve_snapshotter_firecracker_default() {
        assert_eq!(
            resolve_snapshotter(RUNTIME_FIRECRACKER, Some("")),
            SNAPSHOTTER_DEVMAPPER
        );
        assert_eq!(
            resolve_snapshotter(RUNTIME_FIRECRACKER, None),
            SNAPSHOTTER_DEVMAPPER
        );
    }

    #[test]
    fn test_resolve_snapshotter_default_overlay() {
        assert_eq!(resolve_snapshotter("", None), SNAPSHOTTER_OVERLAY);
        assert_eq!(resolve_snapshotter(DEFAULT_RUNTIME, Some("  ")), SNAPSHOTTER_OVERLAY);
    }

    #[test]
    fn test_classify_not_found() {
        let err = ContainerdBackend::<NoopClient>::classify(
            "task status",
            "c1",
            ContainerdApiError::new(ContainerdErrorCode::NotFound, "no running task"),
        );
        assert!(err.is_not_found());

        let err = ContainerdBackend::<NoopClient>::classify(
            "task status",
            "c1",
            ContainerdApiError::new(ContainerdErrorCode::Unavailable, "connection refused"),
        );
        assert!(matches!(err, BackendError::Engine { operation: "task status", .. }));
    }

    #[test]
    fn test_backend_resolves_snapshotter_at_construction() {
        let backend = ContainerdBackend::new(
            NoopClient,
            ContainerdSettings {
                runtime: RUNTIME_FIRECRACKER.to_string(),
                ..Default::default()
            },
        );
        assert_eq!(backend.snapshotter(), SNAPSHOTTER_DEVMAPPER);
        assert!(!backend.host_routable());
    }

    #[tokio::test]
    async fn test_connect_requires_cni_config() {
        let backend = ContainerdBackend::new(NoopClient, ContainerdSettings::default());
        let attachment = NetworkAttachment {
            network: "ember-net".into(),
            cni_config: None,
            port_mapping: None,
        };
        let err = backend
            .connect_network(&ContainerId::new("c1"), &attachment)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Engine { .. }));
    }

    #[tokio::test]
    async fn test_reattach_reports_already_connected() {
        let backend = ContainerdBackend::new(NoopClient, ContainerdSettings::default());
        let err = backend.reattach(&ContainerId::new("c1")).await.unwrap_err();
        assert!(err.is_already_connected());
    }

    /// Client that accepts every call; fuller fakes live in the integration tests.
    struct NoopClient;

    #[async_trait]
    impl ContainerdApi for NoopClient {
        async fn containers(
            &self,
            _namespace: &str,
            _filter: &str,
        ) -> Result<Vec<ContainerdContainer>, ContainerdApiError> {
            Ok(Vec::new())
        }
        async fn load_container(
            &self,
            _namespace: &str,
            id: &str,
        ) -> Result<ContainerdContainer, ContainerdApiError> {
            Ok(ContainerdContainer {
                id: id.to_string(),
                labels: HashMap::new(),
            })
        }
        async fn new_container(
            &self,
            _namespace: &str,
            spec: &ContainerdSpec,
        ) -> Result<ContainerdContainer, ContainerdApiError> {
            Ok(ContainerdContainer {
                id: spec.id.clone(),
                labels: spec.labels.clone(),
            })
        }
        async fn set_labels(
            &self,
            _namespace: &str,
            _id: &str,
            _labels: &HashMap<String, String>,
        ) -> Result<(), ContainerdApiError> {
            Ok(())
        }
        async fn new_task(&self, _namespace: &str, _id: &str) -> Result<u32, ContainerdApiError> {
            Ok(1)
        }
        async fn start_task(&self, _namespace: &str, _id: &str) -> Result<(), ContainerdApiError> {
            Ok(())
        }
        async fn task_status(
            &self,
            _namespace: &str,
            _id: &str,
        ) -> Result<ContainerdTaskStatus, ContainerdApiError> {
            Ok(ContainerdTaskStatus::Running)
        }
        async fn pause_task(&self, _namespace: &str, _id: &str) -> Result<(), ContainerdApiError> {
            Ok(())
        }
        async fn resume_task(&self, _namespace: &str, _id: &str) -> Result<(), ContainerdApiError> {
            Ok(())
        }
        async fn kill_task(&self, _namespace: &str, _id: &str) -> Result<(), ContainerdApiError> {
            Ok(())
        }
        async fn delete_task(&self, _namespace: &str, _id: &str) -> Result<(), ContainerdApiError> {
            Ok(())
        }
        async fn delete_container(
            &self,
            _namespace: &str,
            _id: &str,
            _cleanup_snapshot: bool,
        ) -> Result<(), ContainerdApiError> {
            Ok(())
        }
        async fn get_image(&self, _namespace: &str, _image: &str) -> Result<(), ContainerdApiError> {
            Ok(())
        }
        async fn pull_image(
            &self,
            _namespace: &str,
            _image: &str,
            _snapshotter: &str,
        ) -> Result<(), ContainerdApiError> {
            Ok(())
        }
        async fn cni_setup(
            &self,
            _namespace: &str,
            _id: &str,
            _config: &Value,
            _port_mappings: &[PortMapping],
        ) -> Result<HashMap<String, IpAddr>, ContainerdApiError> {
            Ok(HashMap::new())
        }
        async fn cni_remove(
            &self,
            _namespace: &str,
            _id: &str,
            _config: &Value,
            _port_mappings: &[PortMapping],
        ) -> Result<(), ContainerdApiError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), ContainerdApiError> {
            Ok(())
        }
    }
}
