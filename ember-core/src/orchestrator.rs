// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Container lifecycle orchestrator.
//!
//! Decides per request whether an existing instance can serve it (warm start)
//! or a new one has to be provisioned (cold start). Owns the network slice and
//! host port each instance holds, and rolls them back when a cold start fails
//! part way.
//!
//! Lookup-then-create is serialized per function, so at most one cold start
//! per function is in flight. Different functions progress independently.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use ipnetwork::Ipv4Network;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::backend::{
    Backend, ContainerHandle, ContainerSpec, NetworkAttachment, PortMapping, TaskStatus,
    LABEL_FUNCTION, LABEL_IP, LABEL_PORT,
};
use crate::cni::CniPlan;
use crate::error::{EmberError, EmberResult, RollbackError};
use crate::metrics;
use crate::ports::PortAllocator;
use crate::registry::{InstanceRecord, InstanceRegistry, InstanceSnapshot};
use crate::state::{InstanceStateMachine, LifecycleState};
use crate::types::{ContainerId, EnsureRequest, FunctionId, HostPort, InstanceInfo};

/// Histogram label for requests that provisioned a new instance.
const PATH_COLD: &str = "cold";

/// Static orchestrator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Network instances join when no CNI plan names one.
    pub network: String,
    /// Port the function runtime listens on inside the container.
    pub container_port: u16,
    /// Upper bound on the engine delete issued by a rollback.
    pub rollback_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            network: "ember-net".to_string(),
            container_port: 8080,
            rollback_timeout: Duration::from_secs(10),
        }
    }
}

/// First instance labeled with a function, as the engine reports it.
struct Existing {
    handle: ContainerHandle,
    /// `None` when the container has no task.
    status: Option<TaskStatus>,
}

/// Lifecycle orchestrator over one container engine.
pub struct Orchestrator {
    backend: Arc<dyn Backend>,
    ports: Arc<PortAllocator>,
    cni: Option<Arc<CniPlan>>,
    registry: Arc<InstanceRegistry>,
    function_locks: DashMap<FunctionId, Arc<Mutex<()>>>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn Backend>,
        ports: Arc<PortAllocator>,
        settings: OrchestratorSettings,
    ) -> Self {
        metrics::init();
        Self {
            backend,
            ports,
            cni: None,
            registry: InstanceRegistry::new_shared(),
            function_locks: DashMap::new(),
            settings,
        }
    }

    /// Give every cold-started instance its own slice of the CNI base subnet.
    pub fn with_cni(mut self, plan: Arc<CniPlan>) -> Self {
        self.cni = Some(plan);
        self
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Read-only view of every instance the agent manages.
    pub fn instances(&self) -> Vec<InstanceSnapshot> {
        self.registry.snapshots()
    }

    /// Return a running, reachable instance of the requested function,
    /// provisioning one if none can be reused.
    pub async fn ensure(&self, request: &EnsureRequest) -> EmberResult<InstanceInfo> {
        let started = Instant::now();
        let result = {
            let lock = self.function_lock(&request.function_name);
            let _held = lock.lock().await;
            self.ensure_locked(request).await
        };
        self.prune_function_lock(&request.function_name);
        let (info, path) = result?;

        metrics::ENSURE_DURATION
            .with_label_values(&[path])
            .observe(started.elapsed().as_secs_f64());
        Ok(info)
    }

    pub async fn pause(&self, id: &ContainerId) -> EmberResult<()> {
        let lock = self.lock_for_container(id);
        let _held = match &lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        self.pause_locked(id).await
    }

    pub async fn resume(&self, id: &ContainerId) -> EmberResult<()> {
        let lock = self.lock_for_container(id);
        let _held = match &lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        self.backend
            .resume(id)
            .await
            .map_err(|source| EmberError::Transition {
                operation: "resume",
                container_id: id.clone(),
                source,
            })?;
        self.sync_state(id, LifecycleState::Running);

        tracing::debug!(container_id = %id, "Instance resumed");
        Ok(())
    }

    /// Delete an instance and release its port and subnet.
    /// Destroying an instance the engine no longer has succeeds.
    pub async fn destroy(&self, id: &ContainerId) -> EmberResult<()> {
        let function_id = self.registry.get(id).map(|record| record.function_id);
        let result = {
            let lock = function_id.as_ref().map(|f| self.function_lock(f));
            let _held = match &lock {
                Some(lock) => Some(lock.lock().await),
                None => None,
            };
            self.destroy_locked(id).await
        };
        if let Some(function_id) = &function_id {
            self.prune_function_lock(function_id);
        }
        result
    }

    /// Destroy every instance of `function_id` the engine still has but the
    /// caller no longer tracks. Returns the removed container IDs.
    pub async fn reconcile(
        &self,
        function_id: &FunctionId,
        live: &[ContainerId],
    ) -> EmberResult<Vec<ContainerId>> {
        let result = {
            let lock = self.function_lock(function_id);
            let _held = lock.lock().await;
            self.reconcile_locked(function_id, live).await
        };
        self.prune_function_lock(function_id);
        result
    }

    async fn reconcile_locked(
        &self,
        function_id: &FunctionId,
        live: &[ContainerId],
    ) -> EmberResult<Vec<ContainerId>> {
        let live: HashSet<&ContainerId> = live.iter().collect();
        let handles = self
            .backend
            .list_by_label(function_id)
            .await
            .map_err(|source| EmberError::Lookup {
                function_id: function_id.clone(),
                source,
            })?;

        let mut removed = Vec::new();
        for handle in handles.iter().filter(|h| !live.contains(&h.id)) {
            tracing::warn!(
                function_id = %function_id,
                container_id = %handle.id,
                "Removing instance missing from live set"
            );
            self.destroy_locked(&handle.id).await?;
            removed.push(handle.id.clone());
        }

        // Records whose container is already gone from the engine
        let listed: HashSet<&ContainerId> = handles.iter().map(|h| &h.id).collect();
        for record in self.registry.for_function(function_id) {
            let id = record.container_id();
            if !listed.contains(id) && !live.contains(id) {
                self.release_instance(id);
                removed.push(id.clone());
            }
        }

        Ok(removed)
    }

    /// Pause running instances unused for at least `idle_timeout`, so the next
    /// request is served by a resume. Returns the paused container IDs.
    pub async fn pause_idle(&self, idle_timeout: Duration) -> Vec<ContainerId> {
        let mut paused = Vec::new();

        for id in self.registry.idle_running(idle_timeout) {
            let Some(lock) = self.lock_for_container(&id) else {
                continue;
            };
            let _held = lock.lock().await;

            // A request may have used it while we waited for the lock
            let still_idle = self
                .registry
                .get(&id)
                .map(|r| {
                    r.state() == LifecycleState::Running && r.last_used.elapsed() >= idle_timeout
                })
                .unwrap_or(false);
            if !still_idle {
                continue;
            }

            match self.pause_locked(&id).await {
                Ok(()) => paused.push(id),
                Err(e) => tracing::warn!(container_id = %id, error = %e, "Idle pause failed"),
            }
        }

        paused
    }

    /// Release the engine connection.
    pub async fn close(&self) -> EmberResult<()> {
        tracing::info!(
            backend = self.backend.name(),
            instances = self.registry.len(),
            "Closing orchestrator"
        );
        self.backend
            .close()
            .await
            .map_err(|source| EmberError::Backend {
                operation: "close",
                source,
            })
    }

    fn function_lock(&self, function_id: &FunctionId) -> Arc<Mutex<()>> {
        Arc::clone(
            self.function_locks
                .entry(function_id.clone())
                .or_default()
                .value(),
        )
    }

    /// Drop the lock of a function with no recorded instances once nobody
    /// else holds or waits on it.
    fn prune_function_lock(&self, function_id: &FunctionId) {
        let pruned = self.function_locks.remove_if(function_id, |_, lock| {
            Arc::strong_count(lock) == 1 && !self.registry.has_function(function_id)
        });
        if pruned.is_some() {
            tracing::debug!(function_id = %function_id, "Released function lock");
        }
    }

    /// Number of per-function locks currently kept.
    pub fn function_lock_count(&self) -> usize {
        self.function_locks.len()
    }

    /// Lock of the function owning `id`, when the registry knows it.
    fn lock_for_container(&self, id: &ContainerId) -> Option<Arc<Mutex<()>>> {
        self.registry
            .get(id)
            .map(|record| self.function_lock(&record.function_id))
    }

    fn network_name(&self) -> &str {
        match &self.cni {
            Some(plan) => plan.network_name(),
            None => &self.settings.network,
        }
    }

    async fn ensure_locked(
        &self,
        request: &EnsureRequest,
    ) -> EmberResult<(InstanceInfo, &'static str)> {
        let function_id = &request.function_name;

        let Some(existing) = self.find_existing(function_id).await? else {
            return Ok((self.cold_start(request).await?, PATH_COLD));
        };

        let id = &existing.handle.id;
        let observed = existing
            .status
            .map(|status| status.lifecycle())
            .unwrap_or(LifecycleState::Stopped);
        // A destroy that failed at the engine leaves the record in Deleting
        let pending_delete = matches!(
            self.registry.get_state(id),
            Ok(LifecycleState::Deleting)
        );

        match (observed, pending_delete) {
            (LifecycleState::Running, false) => {
                let info = self.warm_running(function_id, &existing.handle).await?;
                Ok((info, metrics::WARM_RUNNING))
            }
            (LifecycleState::Paused, false) => {
                let info = self.warm_resume(function_id, &existing.handle).await?;
                Ok((info, metrics::WARM_RESUMED))
            }
            (state, _) => {
                self.remove_orphan(&existing.handle, state).await?;
                Ok((self.cold_start(request).await?, PATH_COLD))
            }
        }
    }

    async fn find_existing(&self, function_id: &FunctionId) -> EmberResult<Option<Existing>> {
        let handles = self
            .backend
            .list_by_label(function_id)
            .await
            .map_err(|source| EmberError::Lookup {
                function_id: function_id.clone(),
                source,
            })?;

        let Some(handle) = handles.into_iter().next() else {
            return Ok(None);
        };

        let status = match self.backend.task_status(&handle.id).await {
            Ok(status) => Some(status),
            Err(e) if e.is_not_found() => None,
            Err(source) => {
                return Err(EmberError::Lookup {
                    function_id: function_id.clone(),
                    source,
                })
            }
        };

        Ok(Some(Existing { handle, status }))
    }

    async fn warm_running(
        &self,
        function_id: &FunctionId,
        handle: &ContainerHandle,
    ) -> EmberResult<InstanceInfo> {
        match self.backend.reattach(&handle.id).await {
            Ok(()) => {}
            Err(e) if e.is_already_connected() => {
                tracing::debug!(container_id = %handle.id, "Instance already attached");
            }
            Err(source) => {
                return Err(EmberError::Transition {
                    operation: "reattach",
                    container_id: handle.id.clone(),
                    source,
                })
            }
        }

        let info = self.recover_info(function_id, handle).await?;
        self.registry.touch(&handle.id);

        metrics::WARM_STARTS
            .with_label_values(&[function_id.as_str(), metrics::WARM_RUNNING])
            .inc();
        tracing::debug!(
            function_id = %function_id,
            container_id = %handle.id,
            "Reusing running instance"
        );
        Ok(info)
    }

    async fn warm_resume(
        &self,
        function_id: &FunctionId,
        handle: &ContainerHandle,
    ) -> EmberResult<InstanceInfo> {
        self.backend
            .resume(&handle.id)
            .await
            .map_err(|source| EmberError::Transition {
                operation: "resume",
                container_id: handle.id.clone(),
                source,
            })?;
        self.sync_state(&handle.id, LifecycleState::Running);

        let info = self.recover_info(function_id, handle).await?;

        metrics::WARM_STARTS
            .with_label_values(&[function_id.as_str(), metrics::WARM_RESUMED])
            .inc();
        tracing::info!(
            function_id = %function_id,
            container_id = %handle.id,
            "Resumed paused instance"
        );
        Ok(info)
    }

    /// Connection details of an existing instance: the registry first, then
    /// persisted labels, then the engine's network view. Adopts the instance
    /// into the registry when it was unknown.
    async fn recover_info(
        &self,
        function_id: &FunctionId,
        handle: &ContainerHandle,
    ) -> EmberResult<InstanceInfo> {
        let id = &handle.id;

        if let Some(info) = self.registry.get(id).and_then(|r| r.info()) {
            return Ok(info);
        }

        let ip_address = match handle.persisted_ip() {
            Some(ip) => ip,
            None => self.resolve_ip(id, self.network_name()).await?,
        };

        // A persisted port already held by another container is stale
        let port = handle.persisted_port().filter(|&port| {
            let claimed = self.ports.claim(port, id);
            if !claimed {
                tracing::warn!(
                    container_id = %id,
                    port = %port,
                    "Persisted host port is held by another instance"
                );
            }
            claimed
        });
        metrics::ALLOCATED_PORTS.set(self.ports.allocated_count() as i64);

        if self.registry.contains(id) {
            self.registry.update(id, |record| {
                record.ip_address = Some(ip_address);
                record.host_port = port;
            })?;
        } else {
            let mut record =
                InstanceRecord::observed(id.clone(), function_id.clone(), LifecycleState::Running);
            record.ip_address = Some(ip_address);
            record.host_port = port;
            self.registry.insert(record);
            tracing::debug!(container_id = %id, "Adopted instance from engine labels");
        }

        Ok(InstanceInfo {
            id: id.clone(),
            ip_address,
            port,
        })
    }

    /// Address reported by the engine, preferring `network`.
    async fn resolve_ip(&self, id: &ContainerId, network: &str) -> EmberResult<IpAddr> {
        let addresses = self
            .backend
            .inspect_network(id)
            .await
            .map_err(|source| EmberError::Transition {
                operation: "inspect network",
                container_id: id.clone(),
                source,
            })?;

        addresses
            .get(network)
            .copied()
            .or_else(|| {
                addresses
                    .iter()
                    .min_by(|a, b| a.0.cmp(b.0))
                    .map(|(_, ip)| *ip)
            })
            .ok_or_else(|| EmberError::NoAddress {
                container_id: id.clone(),
            })
    }

    async fn remove_orphan(
        &self,
        handle: &ContainerHandle,
        observed: LifecycleState,
    ) -> EmberResult<()> {
        let id = &handle.id;
        tracing::warn!(
            container_id = %id,
            state = observed.name(),
            "Removing orphaned instance before cold start"
        );

        self.sync_state(id, LifecycleState::Deleting);
        match self.backend.delete(id, true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(source) => {
                return Err(EmberError::Transition {
                    operation: "delete",
                    container_id: id.clone(),
                    source,
                })
            }
        }

        self.release_instance(id);
        Ok(())
    }

    async fn cold_start(&self, request: &EnsureRequest) -> EmberResult<InstanceInfo> {
        let function_id = &request.function_name;

        self.backend
            .ensure_image(&request.image)
            .await
            .map_err(|source| EmberError::Provision {
                operation: "image pull",
                function_id: function_id.clone(),
                source,
            })?;

        let spec = ContainerSpec {
            name: container_name(function_id),
            image: request.image.clone(),
            env: request.env.clone(),
            labels: HashMap::from([(LABEL_FUNCTION.to_string(), function_id.to_string())]),
            container_port: self.settings.container_port,
        };
        let handle = self
            .backend
            .create(&spec)
            .await
            .map_err(|source| EmberError::Provision {
                operation: "create",
                function_id: function_id.clone(),
                source,
            })?;

        let id = handle.id;
        self.registry
            .insert(InstanceRecord::creating(id.clone(), function_id.clone()));
        let mut guard = RollbackGuard::new(Rollback {
            backend: Arc::clone(&self.backend),
            ports: Arc::clone(&self.ports),
            cni: self.cni.clone(),
            registry: Arc::clone(&self.registry),
            container_id: id.clone(),
            port: None,
            subnet: None,
            timeout: self.settings.rollback_timeout,
        });

        match self.provision(&id, &mut guard).await {
            Ok(info) => {
                guard.disarm();
                metrics::COLD_STARTS
                    .with_label_values(&[function_id.as_str()])
                    .inc();
                tracing::info!(
                    function_id = %function_id,
                    container_id = %id,
                    ip = %info.ip_address,
                    port = ?info.port.map(|p| p.value()),
                    "Cold start complete"
                );
                Ok(info)
            }
            Err(e) => {
                metrics::ROLLBACKS
                    .with_label_values(&[function_id.as_str()])
                    .inc();
                tracing::warn!(
                    function_id = %function_id,
                    container_id = %id,
                    error = %e,
                    "Cold start failed, rolling back"
                );
                guard.run().await;
                Err(e)
            }
        }
    }

    /// Steps after create: task start, network and port, label persistence.
    async fn provision(
        &self,
        id: &ContainerId,
        guard: &mut RollbackGuard,
    ) -> EmberResult<InstanceInfo> {
        self.backend
            .start_task(id)
            .await
            .map_err(|source| EmberError::Transition {
                operation: "start",
                container_id: id.clone(),
                source,
            })?;

        let mut attachment = NetworkAttachment {
            network: self.settings.network.clone(),
            cni_config: None,
            port_mapping: None,
        };

        let mut subnet = None;
        if let Some(plan) = &self.cni {
            let (slice, document) = plan.render(id)?;
            guard.track_subnet(slice);
            subnet = Some(slice);
            attachment.network = plan.network_name().to_string();
            attachment.cni_config = Some(document);
        }

        let mut port = None;
        if !self.backend.host_routable() {
            let host_port = self.ports.allocate(id)?;
            guard.track_port(host_port);
            metrics::ALLOCATED_PORTS.set(self.ports.allocated_count() as i64);
            port = Some(host_port);
            attachment.port_mapping = Some(PortMapping {
                host_port,
                container_port: self.settings.container_port,
            });
        }

        match self.backend.connect_network(id, &attachment).await {
            Ok(()) => {}
            Err(e) if e.is_already_connected() => {}
            Err(source) => {
                return Err(EmberError::Transition {
                    operation: "connect network",
                    container_id: id.clone(),
                    source,
                })
            }
        }

        let ip_address = self.resolve_ip(id, &attachment.network).await?;

        let mut labels = HashMap::from([(LABEL_IP.to_string(), ip_address.to_string())]);
        if let Some(port) = port {
            labels.insert(LABEL_PORT.to_string(), port.to_string());
        }
        match self.backend.persist_labels(id, &labels).await {
            Ok(true) => tracing::debug!(container_id = %id, "Persisted instance labels"),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(container_id = %id, error = %e, "Failed to persist instance labels")
            }
        }

        self.registry.update(id, |record| {
            record.ip_address = Some(ip_address);
            record.host_port = port;
            record.subnet = subnet;
        })?;
        self.registry.transition(id, LifecycleState::Running)?;

        Ok(InstanceInfo {
            id: id.clone(),
            ip_address,
            port,
        })
    }

    async fn pause_locked(&self, id: &ContainerId) -> EmberResult<()> {
        self.backend
            .pause(id)
            .await
            .map_err(|source| EmberError::Transition {
                operation: "pause",
                container_id: id.clone(),
                source,
            })?;
        self.sync_state(id, LifecycleState::Paused);

        tracing::debug!(container_id = %id, "Instance paused");
        Ok(())
    }

    async fn destroy_locked(&self, id: &ContainerId) -> EmberResult<()> {
        self.sync_state(id, LifecycleState::Deleting);

        match self.backend.delete(id, true).await {
            Ok(()) => {
                metrics::DESTROYS.inc();
                tracing::info!(container_id = %id, "Instance destroyed");
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(container_id = %id, "Instance already gone");
            }
            Err(source) => {
                // Record stays in Deleting with its resources; a later destroy retries
                return Err(EmberError::Transition {
                    operation: "delete",
                    container_id: id.clone(),
                    source,
                });
            }
        }

        self.release_instance(id);
        Ok(())
    }

    /// Drop the record of `id` and return its port and subnet to the pools.
    fn release_instance(&self, id: &ContainerId) {
        if let Some(record) = self.registry.remove(id) {
            if let Some(port) = record.host_port {
                self.ports.release(port, id);
            }
            if let (Some(plan), Some(subnet)) = (&self.cni, &record.subnet) {
                plan.release(subnet);
            }
        }
        self.ports.release_owned_by(id);
        metrics::ALLOCATED_PORTS.set(self.ports.allocated_count() as i64);
    }

    /// Move the record of `id` to `target`. The engine is authoritative, so a
    /// record that disagrees with it is reset to the observed state.
    fn sync_state(&self, id: &ContainerId, target: LifecycleState) {
        if !self.registry.contains(id) {
            return;
        }
        if let Err(e) = self.registry.transition(id, target) {
            tracing::debug!(container_id = %id, error = %e, "Adopting engine-observed state");
            let adopted = self.registry.update(id, |record| {
                record.state_machine = InstanceStateMachine::observed(id.clone(), target);
                record.last_used = Instant::now();
            });
            if adopted.is_err() {
                tracing::debug!(container_id = %id, "Record removed concurrently");
            }
        }
    }
}

/// Unique name for a new container of `function_id`.
fn container_name(function_id: &FunctionId) -> String {
    let token = Uuid::new_v4().simple().to_string();
    format!("ember-{}-{}", function_id, &token[..12])
}

/// Resources a cold start holds so far.
struct Rollback {
    backend: Arc<dyn Backend>,
    ports: Arc<PortAllocator>,
    cni: Option<Arc<CniPlan>>,
    registry: Arc<InstanceRegistry>,
    container_id: ContainerId,
    port: Option<HostPort>,
    subnet: Option<Ipv4Network>,
    timeout: Duration,
}

impl Rollback {
    async fn execute(self) -> Result<(), RollbackError> {
        let id = &self.container_id;

        if let Err(e) = self.registry.transition(id, LifecycleState::Deleting) {
            tracing::debug!(container_id = %id, error = %e, "Rollback without a Creating record");
        }

        let deleted = match tokio::time::timeout(self.timeout, self.backend.delete(id, true)).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_not_found() => Ok(()),
            Ok(Err(source)) => Err(RollbackError::Delete {
                container_id: id.clone(),
                source,
            }),
            Err(_) => Err(RollbackError::Timeout {
                container_id: id.clone(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        };

        if let Some(port) = self.port {
            self.ports.release(port, id);
        }
        if let (Some(plan), Some(subnet)) = (&self.cni, &self.subnet) {
            plan.release(subnet);
        }
        self.registry.remove(id);
        metrics::ALLOCATED_PORTS.set(self.ports.allocated_count() as i64);

        deleted
    }
}

/// Runs a [`Rollback`] unless disarmed.
///
/// The cleanup always runs in its own task, so cancelling the caller cannot
/// interrupt it. Dropping an armed guard (the ensure future was abandoned)
/// spawns the same cleanup.
struct RollbackGuard {
    pending: Option<Rollback>,
}

impl RollbackGuard {
    fn new(rollback: Rollback) -> Self {
        Self {
            pending: Some(rollback),
        }
    }

    fn track_port(&mut self, port: HostPort) {
        if let Some(rollback) = self.pending.as_mut() {
            rollback.port = Some(port);
        }
    }

    fn track_subnet(&mut self, subnet: Ipv4Network) {
        if let Some(rollback) = self.pending.as_mut() {
            rollback.subnet = Some(subnet);
        }
    }

    fn disarm(&mut self) {
        self.pending = None;
    }

    async fn run(mut self) {
        let Some(rollback) = self.pending.take() else {
            return;
        };
        let container_id = rollback.container_id.clone();

        match tokio::spawn(rollback.execute()).await {
            Ok(Ok(())) => tracing::info!(container_id = %container_id, "Rolled back cold start"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Rollback incomplete"),
            Err(join) => {
                let e = RollbackError::Aborted {
                    container_id,
                    reason: join.to_string(),
                };
                tracing::warn!(error = %e, "Rollback incomplete");
            }
        }
    }
}

impl Drop for RollbackGuard {
    fn drop(&mut self) {
        let Some(rollback) = self.pending.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::warn!(
                    container_id = %rollback.container_id,
                    "Cold start abandoned, rolling back"
                );
                runtime.spawn(async move {
                    if let Err(e) = rollback.execute().await {
                        tracing::warn!(error = %e, "Rollback incomplete");
                    }
                });
            }
            Err(_) => tracing::error!(
                container_id = %rollback.container_id,
                "No runtime to roll back abandoned cold start"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeContainer {
        id: ContainerId,
        labels: HashMap<String, String>,
        status: Option<TaskStatus>,
        ip: Option<IpAddr>,
        connected: bool,
    }

    #[derive(Default)]
    struct FakeState {
        containers: Vec<FakeContainer>,
        calls: Vec<String>,
        next_ip: u8,
    }

    /// In-memory engine with failure injection.
    struct FakeBackend {
        routable: bool,
        fail_list: AtomicBool,
        fail_connect: AtomicBool,
        connect_delay: Option<Duration>,
        state: std::sync::Mutex<FakeState>,
    }

    impl FakeBackend {
        fn new(routable: bool) -> Self {
            Self {
                routable,
                fail_list: AtomicBool::new(false),
                fail_connect: AtomicBool::new(false),
                connect_delay: None,
                state: std::sync::Mutex::new(FakeState::default()),
            }
        }

        fn seed(
            &self,
            id: &str,
            function: &str,
            status: Option<TaskStatus>,
            extra: &[(&str, &str)],
        ) {
            let mut labels = HashMap::from([(LABEL_FUNCTION.to_string(), function.to_string())]);
            for (k, v) in extra {
                labels.insert(k.to_string(), v.to_string());
            }
            self.state.lock().unwrap().containers.push(FakeContainer {
                id: ContainerId::new(id),
                labels,
                status,
                ip: None,
                connected: true,
            });
        }

        fn count(&self, call: &str) -> usize {
            self.state
                .lock()
                .unwrap()
                .calls
                .iter()
                .filter(|c| c.as_str() == call)
                .count()
        }

        fn container_count(&self) -> usize {
            self.state.lock().unwrap().containers.len()
        }

        fn record(&self, call: &str) {
            self.state.lock().unwrap().calls.push(call.to_string());
        }

        fn with_container<T>(
            &self,
            id: &ContainerId,
            f: impl FnOnce(&mut FakeContainer) -> T,
        ) -> Result<T, BackendError> {
            let mut state = self.state.lock().unwrap();
            state
                .containers
                .iter_mut()
                .find(|c| &c.id == id)
                .map(f)
                .ok_or_else(|| BackendError::NotFound { id: id.to_string() })
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn host_routable(&self) -> bool {
            self.routable
        }

        async fn ensure_image(&self, _image: &str) -> Result<(), BackendError> {
            self.record("image");
            Ok(())
        }

        async fn list_by_label(
            &self,
            function: &FunctionId,
        ) -> Result<Vec<ContainerHandle>, BackendError> {
            if self.fail_list.load(Ordering::SeqCst) {
                return Err(BackendError::engine("container list", "engine unavailable"));
            }
            let state = self.state.lock().unwrap();
            Ok(state
                .containers
                .iter()
                .filter(|c| {
                    c.labels.get(LABEL_FUNCTION).map(String::as_str) == Some(function.as_str())
                })
                .map(|c| ContainerHandle {
                    id: c.id.clone(),
                    name: c.id.to_string(),
                    labels: c.labels.clone(),
                })
                .collect())
        }

        async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, BackendError> {
            self.record("create");
            let id = ContainerId::new(spec.name.clone());
            self.state.lock().unwrap().containers.push(FakeContainer {
                id: id.clone(),
                labels: spec.labels.clone(),
                status: None,
                ip: None,
                connected: false,
            });
            Ok(ContainerHandle {
                id,
                name: spec.name.clone(),
                labels: spec.labels.clone(),
            })
        }

        async fn start_task(&self, id: &ContainerId) -> Result<(), BackendError> {
            self.record("start");
            self.with_container(id, |c| c.status = Some(TaskStatus::Running))
        }

        async fn task_status(&self, id: &ContainerId) -> Result<TaskStatus, BackendError> {
            self.with_container(id, |c| c.status)?
                .ok_or_else(|| BackendError::NotFound { id: id.to_string() })
        }

        async fn pause(&self, id: &ContainerId) -> Result<(), BackendError> {
            self.record("pause");
            self.with_container(id, |c| c.status = Some(TaskStatus::Paused))
        }

        async fn resume(&self, id: &ContainerId) -> Result<(), BackendError> {
            self.record("resume");
            self.with_container(id, |c| c.status = Some(TaskStatus::Running))
        }

        async fn delete(&self, id: &ContainerId, _kill_task_first: bool) -> Result<(), BackendError> {
            self.record("delete");
            let mut state = self.state.lock().unwrap();
            let before = state.containers.len();
            state.containers.retain(|c| &c.id != id);
            if state.containers.len() == before {
                return Err(BackendError::NotFound { id: id.to_string() });
            }
            Ok(())
        }

        async fn connect_network(
            &self,
            id: &ContainerId,
            attachment: &NetworkAttachment,
        ) -> Result<(), BackendError> {
            self.record("connect");
            if let Some(delay) = self.connect_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(BackendError::engine("network setup", "bridge plugin failed"));
            }
            let mut state = self.state.lock().unwrap();
            state.next_ip += 1;
            let ip = IpAddr::V4(Ipv4Addr::new(10, 88, 1, 1 + state.next_ip));
            let container = state
                .containers
                .iter_mut()
                .find(|c| &c.id == id)
                .ok_or_else(|| BackendError::NotFound { id: id.to_string() })?;
            if container.connected {
                return Err(BackendError::AlreadyConnected {
                    id: id.to_string(),
                    network: attachment.network.clone(),
                });
            }
            container.connected = true;
            container.ip = Some(ip);
            Ok(())
        }

        async fn reattach(&self, id: &ContainerId) -> Result<(), BackendError> {
            self.record("reattach");
            let connected = self.with_container(id, |c| c.connected)?;
            if connected {
                return Err(BackendError::AlreadyConnected {
                    id: id.to_string(),
                    network: "ember-net".to_string(),
                });
            }
            Ok(())
        }

        async fn inspect_network(
            &self,
            id: &ContainerId,
        ) -> Result<HashMap<String, IpAddr>, BackendError> {
            let ip = self.with_container(id, |c| c.ip)?;
            Ok(ip
                .map(|ip| HashMap::from([("ember-net".to_string(), ip)]))
                .unwrap_or_default())
        }

        async fn persist_labels(
            &self,
            id: &ContainerId,
            labels: &HashMap<String, String>,
        ) -> Result<bool, BackendError> {
            self.with_container(id, |c| c.labels.extend(labels.clone()))?;
            Ok(true)
        }

        async fn close(&self) -> Result<(), BackendError> {
            self.record("close");
            Ok(())
        }
    }

    fn request(name: &str) -> EnsureRequest {
        EnsureRequest::new(FunctionId::new(name).unwrap(), format!("{}:latest", name))
    }

    fn orchestrator(backend: Arc<FakeBackend>) -> Orchestrator {
        Orchestrator::new(
            backend,
            PortAllocator::new_shared(20000, 20009).unwrap(),
            OrchestratorSettings::default(),
        )
    }

    fn cni_plan() -> Arc<CniPlan> {
        let config = json!({
            "cniVersion": "1.0.0",
            "name": "ember-net",
            "plugins": [{
                "type": "bridge",
                "bridge": "ember0",
                "ipam": {"type": "host-local", "subnet": "10.88.0.0/16"}
            }]
        });
        Arc::new(CniPlan::new(config, 24).unwrap())
    }

    #[test]
    fn test_container_name_format() {
        let name = container_name(&FunctionId::new("echo").unwrap());
        let token = name.strip_prefix("ember-echo-").unwrap();
        assert_eq!(token.len(), 12);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(name, container_name(&FunctionId::new("echo").unwrap()));
    }

    #[tokio::test]
    async fn test_cold_start_then_running_warm_path() {
        let backend = Arc::new(FakeBackend::new(false));
        let orch = orchestrator(backend.clone());

        let first = orch.ensure(&request("echo")).await.unwrap();
        assert_eq!(first.port.map(|p| p.value()), Some(20000));
        assert_eq!(first.ip_address, "10.88.1.2".parse::<IpAddr>().unwrap());
        assert_eq!(
            orch.registry().get_state(&first.id).unwrap(),
            LifecycleState::Running
        );

        let second = orch.ensure(&request("echo")).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(backend.count("create"), 1);
        assert_eq!(backend.count("start"), 1);
        assert_eq!(backend.count("connect"), 1);
        assert_eq!(backend.count("reattach"), 1);
        assert_eq!(orch.ports().allocated_count(), 1);
    }

    #[tokio::test]
    async fn test_routable_backend_skips_port() {
        let backend = Arc::new(FakeBackend::new(true));
        let orch = orchestrator(backend.clone());

        let info = orch.ensure(&request("echo")).await.unwrap();
        assert_eq!(info.port, None);
        assert_eq!(orch.ports().allocated_count(), 0);
    }

    #[tokio::test]
    async fn test_resume_paused_instance() {
        let backend = Arc::new(FakeBackend::new(false));
        let orch = orchestrator(backend.clone());

        let first = orch.ensure(&request("echo")).await.unwrap();
        orch.pause(&first.id).await.unwrap();
        assert_eq!(
            orch.registry().get_state(&first.id).unwrap(),
            LifecycleState::Paused
        );

        let second = orch.ensure(&request("echo")).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(backend.count("resume"), 1);
        assert_eq!(backend.count("create"), 1);
        assert_eq!(
            orch.registry().get_state(&first.id).unwrap(),
            LifecycleState::Running
        );
    }

    #[tokio::test]
    async fn test_network_failure_rolls_back_everything() {
        let backend = Arc::new(FakeBackend::new(false));
        backend.fail_connect.store(true, Ordering::SeqCst);
        let plan = cni_plan();
        let orch = orchestrator(backend.clone()).with_cni(Arc::clone(&plan));

        let err = orch.ensure(&request("echo")).await.unwrap_err();
        assert!(matches!(
            err,
            EmberError::Transition {
                operation: "connect network",
                ..
            }
        ));

        assert_eq!(backend.container_count(), 0);
        assert_eq!(backend.count("delete"), 1);
        assert_eq!(orch.ports().allocated_count(), 0);
        assert_eq!(plan.pool().leased_count(), 0);
        assert!(orch.registry().is_empty());
    }

    #[tokio::test]
    async fn test_cni_slice_recorded_and_released() {
        let backend = Arc::new(FakeBackend::new(false));
        let plan = cni_plan();
        let orch = orchestrator(backend.clone()).with_cni(Arc::clone(&plan));

        let info = orch.ensure(&request("echo")).await.unwrap();
        assert_eq!(plan.pool().leased_count(), 1);
        assert!(orch.registry().get(&info.id).unwrap().subnet.is_some());

        orch.destroy(&info.id).await.unwrap();
        assert_eq!(plan.pool().leased_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_ensure_rolls_back() {
        let mut fake = FakeBackend::new(false);
        fake.connect_delay = Some(Duration::from_millis(500));
        let backend = Arc::new(fake);
        let orch = orchestrator(backend.clone());

        let result =
            tokio::time::timeout(Duration::from_millis(50), orch.ensure(&request("echo"))).await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(backend.container_count(), 0);
        assert_eq!(orch.ports().allocated_count(), 0);
        assert!(orch.registry().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_twice_is_safe() {
        let backend = Arc::new(FakeBackend::new(false));
        let orch = orchestrator(backend.clone());

        let info = orch.ensure(&request("echo")).await.unwrap();
        orch.destroy(&info.id).await.unwrap();
        orch.destroy(&info.id).await.unwrap();

        assert_eq!(backend.container_count(), 0);
        assert_eq!(orch.ports().allocated_count(), 0);
        assert!(orch.registry().is_empty());
    }

    #[tokio::test]
    async fn test_function_lock_dropped_with_last_instance() {
        let backend = Arc::new(FakeBackend::new(false));
        let orch = orchestrator(backend.clone());

        let info = orch.ensure(&request("echo")).await.unwrap();
        assert_eq!(orch.function_lock_count(), 1);

        orch.destroy(&info.id).await.unwrap();
        assert_eq!(orch.function_lock_count(), 0);

        backend.fail_connect.store(true, Ordering::SeqCst);
        assert!(orch.ensure(&request("other")).await.is_err());
        assert_eq!(orch.function_lock_count(), 0);

        let function_id = FunctionId::new("ghost").unwrap();
        assert!(orch.reconcile(&function_id, &[]).await.unwrap().is_empty());
        assert_eq!(orch.function_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_stopped_orphan_replaced() {
        let backend = Arc::new(FakeBackend::new(false));
        backend.seed("old", "echo", Some(TaskStatus::Stopped), &[]);
        let orch = orchestrator(backend.clone());

        let info = orch.ensure(&request("echo")).await.unwrap();
        assert_ne!(info.id.as_str(), "old");
        assert_eq!(backend.count("delete"), 1);
        assert_eq!(backend.count("create"), 1);
        assert_eq!(backend.container_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_task_treated_as_orphan() {
        let backend = Arc::new(FakeBackend::new(false));
        backend.seed("no-task", "echo", None, &[]);
        let orch = orchestrator(backend.clone());

        let info = orch.ensure(&request("echo")).await.unwrap();
        assert_ne!(info.id.as_str(), "no-task");
        assert_eq!(backend.count("delete"), 1);
    }

    #[tokio::test]
    async fn test_recovers_address_from_labels() {
        let backend = Arc::new(FakeBackend::new(false));
        backend.seed(
            "adopted",
            "echo",
            Some(TaskStatus::Running),
            &[(LABEL_IP, "10.88.7.9"), (LABEL_PORT, "20005")],
        );
        let orch = orchestrator(backend.clone());

        let info = orch.ensure(&request("echo")).await.unwrap();
        assert_eq!(info.id.as_str(), "adopted");
        assert_eq!(info.ip_address, "10.88.7.9".parse::<IpAddr>().unwrap());
        assert_eq!(info.port.map(|p| p.value()), Some(20005));
        assert_eq!(
            orch.ports().owner(HostPort::new(20005).unwrap()),
            Some(ContainerId::new("adopted"))
        );
        assert_eq!(backend.count("create"), 0);
    }

    #[tokio::test]
    async fn test_stale_port_label_not_adopted() {
        let backend = Arc::new(FakeBackend::new(false));
        let orch = orchestrator(backend.clone());

        let alpha = orch.ensure(&request("alpha")).await.unwrap();
        let alpha_port = alpha.port.unwrap();
        assert_eq!(alpha_port.value(), 20000);

        backend.seed(
            "beta-old",
            "beta",
            Some(TaskStatus::Running),
            &[(LABEL_IP, "10.88.9.9"), (LABEL_PORT, "20000")],
        );
        let beta = orch.ensure(&request("beta")).await.unwrap();
        assert_eq!(beta.id.as_str(), "beta-old");
        assert_eq!(beta.port, None);
        assert_eq!(orch.registry().get(&beta.id).unwrap().host_port, None);

        orch.destroy(&beta.id).await.unwrap();
        assert_eq!(orch.ports().owner(alpha_port), Some(alpha.id.clone()));

        let gamma = orch.ensure(&request("gamma")).await.unwrap();
        assert_eq!(gamma.port.map(|p| p.value()), Some(20001));
    }

    #[tokio::test]
    async fn test_lookup_failure() {
        let backend = Arc::new(FakeBackend::new(false));
        backend.fail_list.store(true, Ordering::SeqCst);
        let orch = orchestrator(backend.clone());

        let err = orch.ensure(&request("echo")).await.unwrap_err();
        assert!(matches!(err, EmberError::Lookup { .. }));
        assert_eq!(backend.count("create"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ensure_single_container() {
        let backend = Arc::new(FakeBackend::new(false));
        let orch = Arc::new(orchestrator(backend.clone()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let orch = Arc::clone(&orch);
                tokio::spawn(async move { orch.ensure(&request("echo")).await })
            })
            .collect();

        let mut ids = HashSet::new();
        for task in tasks {
            ids.insert(task.await.unwrap().unwrap().id);
        }

        assert_eq!(ids.len(), 1);
        assert_eq!(backend.count("create"), 1);
    }

    #[tokio::test]
    async fn test_pause_idle() {
        let backend = Arc::new(FakeBackend::new(false));
        let orch = orchestrator(backend.clone());

        let info = orch.ensure(&request("echo")).await.unwrap();
        assert!(orch.pause_idle(Duration::from_secs(3600)).await.is_empty());

        assert_eq!(orch.pause_idle(Duration::ZERO).await, vec![info.id.clone()]);
        assert_eq!(
            orch.registry().get_state(&info.id).unwrap(),
            LifecycleState::Paused
        );
        assert!(orch.pause_idle(Duration::ZERO).await.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_removes_untracked() {
        let backend = Arc::new(FakeBackend::new(false));
        let orch = orchestrator(backend.clone());

        let info = orch.ensure(&request("echo")).await.unwrap();
        backend.seed("zombie", "echo", Some(TaskStatus::Running), &[]);

        let function_id = FunctionId::new("echo").unwrap();
        let removed = orch
            .reconcile(&function_id, &[info.id.clone()])
            .await
            .unwrap();

        assert_eq!(removed, vec![ContainerId::new("zombie")]);
        assert_eq!(backend.container_count(), 1);
        assert!(orch.registry().contains(&info.id));
    }

    #[tokio::test]
    async fn test_pause_unknown_container() {
        let backend = Arc::new(FakeBackend::new(false));
        let orch = orchestrator(backend.clone());

        let err = orch.pause(&ContainerId::new("ghost")).await.unwrap_err();
        assert!(matches!(
            err,
            EmberError::Transition {
                operation: "pause",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_close_releases_client() {
        let backend = Arc::new(FakeBackend::new(false));
        let orch = orchestrator(backend.clone());

        orch.close().await.unwrap();
        assert_eq!(backend.count("close"), 1);
    }
}
