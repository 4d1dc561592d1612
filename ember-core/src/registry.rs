// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Thread-safe instance registry using DashMap.
//!
//! Holds what the agent knows about each container it manages: lifecycle
//! state, assigned IP, host port and CNI subnet slice. The engine remains the
//! source of truth for existence; the registry caches what only the agent
//! produced.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use ipnetwork::Ipv4Network;
use serde::Serialize;

use crate::error::{EmberError, EmberResult};
use crate::state::{InstanceStateMachine, LifecycleState};
use crate::types::{ContainerId, FunctionId, HostPort, InstanceInfo};

/// Entry in the instance registry.
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub function_id: FunctionId,
    pub state_machine: InstanceStateMachine,
    pub ip_address: Option<IpAddr>,
    pub host_port: Option<HostPort>,
    pub subnet: Option<Ipv4Network>,
    pub last_used: Instant,
}

impl InstanceRecord {
    /// Record for a container the agent is about to start.
    pub fn creating(container_id: ContainerId, function_id: FunctionId) -> Self {
        Self::observed(container_id, function_id, LifecycleState::Creating)
    }

    /// Record for a container found in the engine in `state`.
    pub fn observed(
        container_id: ContainerId,
        function_id: FunctionId,
        state: LifecycleState,
    ) -> Self {
        Self {
            function_id,
            state_machine: InstanceStateMachine::observed(container_id, state),
            ip_address: None,
            host_port: None,
            subnet: None,
            last_used: Instant::now(),
        }
    }

    pub fn container_id(&self) -> &ContainerId {
        self.state_machine.container_id()
    }

    pub fn state(&self) -> LifecycleState {
        self.state_machine.state()
    }

    /// Connection details, once an address is known.
    pub fn info(&self) -> Option<InstanceInfo> {
        self.ip_address.map(|ip_address| InstanceInfo {
            id: self.container_id().clone(),
            ip_address,
            port: self.host_port,
        })
    }
}

/// Read-only view of a record, safe to hand out of the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSnapshot {
    pub container_id: ContainerId,
    pub function_id: FunctionId,
    pub state: LifecycleState,
    pub ip_address: Option<IpAddr>,
    pub host_port: Option<HostPort>,
    pub subnet: Option<String>,
    pub idle_ms: u64,
}

impl From<&InstanceRecord> for InstanceSnapshot {
    fn from(record: &InstanceRecord) -> Self {
        Self {
            container_id: record.container_id().clone(),
            function_id: record.function_id.clone(),
            state: record.state(),
            ip_address: record.ip_address,
            host_port: record.host_port,
            subnet: record.subnet.map(|s| s.to_string()),
            idle_ms: record.last_used.elapsed().as_millis() as u64,
        }
    }
}

/// Thread-safe registry for managed instances.
/// Every mutation happens under the entry's shard lock.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: DashMap<ContainerId, InstanceRecord>,
}

impl InstanceRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
        }
    }

    /// Create a registry wrapped in an Arc for sharing across tasks.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert or replace the record for its container.
    pub fn insert(&self, record: InstanceRecord) {
        self.instances.insert(record.container_id().clone(), record);
    }

    pub fn remove(&self, id: &ContainerId) -> Option<InstanceRecord> {
        self.instances.remove(id).map(|(_, record)| record)
    }

    /// Clone of the record for `id`.
    pub fn get(&self, id: &ContainerId) -> Option<InstanceRecord> {
        self.instances.get(id).map(|entry| entry.clone())
    }

    pub fn contains(&self, id: &ContainerId) -> bool {
        self.instances.contains_key(id)
    }

    /// Get the current state of an instance.
    pub fn get_state(&self, id: &ContainerId) -> EmberResult<LifecycleState> {
        self.instances
            .get(id)
            .map(|entry| entry.state())
            .ok_or_else(|| EmberError::InstanceNotFound(id.clone()))
    }

    /// Transition an instance to a new state.
    pub fn transition(&self, id: &ContainerId, target: LifecycleState) -> EmberResult<()> {
        let mut entry = self
            .instances
            .get_mut(id)
            .ok_or_else(|| EmberError::InstanceNotFound(id.clone()))?;

        entry.state_machine.transition_to(target)?;
        if target == LifecycleState::Running {
            entry.last_used = Instant::now();
        }
        Ok(())
    }

    /// Apply `f` to the record for `id` under its shard lock.
    pub fn update<F>(&self, id: &ContainerId, f: F) -> EmberResult<()>
    where
        F: FnOnce(&mut InstanceRecord),
    {
        let mut entry = self
            .instances
            .get_mut(id)
            .ok_or_else(|| EmberError::InstanceNotFound(id.clone()))?;
        f(&mut entry);
        Ok(())
    }

    /// Mark an instance as just served.
    pub fn touch(&self, id: &ContainerId) {
        if let Some(mut entry) = self.instances.get_mut(id) {
            entry.last_used = Instant::now();
        }
    }

    /// Records belonging to `function_id`.
    pub fn for_function(&self, function_id: &FunctionId) -> Vec<InstanceRecord> {
        self.instances
            .iter()
            .filter(|r| &r.function_id == function_id)
            .map(|r| r.value().clone())
            .collect()
    }

    /// Whether any instance of `function_id` is recorded.
    pub fn has_function(&self, function_id: &FunctionId) -> bool {
        self.instances.iter().any(|r| &r.function_id == function_id)
    }

    /// Running instances unused for at least `idle_timeout`.
    pub fn idle_running(&self, idle_timeout: Duration) -> Vec<ContainerId> {
        self.instances
            .iter()
            .filter(|r| r.state() == LifecycleState::Running)
            .filter(|r| r.last_used.elapsed() >= idle_timeout)
            .map(|r| r.key().clone())
            .collect()
    }

    /// Get instances in a specific state.
    pub fn instances_in_state(&self, state: LifecycleState) -> Vec<ContainerId> {
        self.instances
            .iter()
            .filter(|r| r.state() == state)
            .map(|r| r.key().clone())
            .collect()
    }

    pub fn snapshots(&self) -> Vec<InstanceSnapshot> {
        let mut snapshots: Vec<InstanceSnapshot> = self
            .instances
            .iter()
            .map(|r| InstanceSnapshot::from(r.value()))
            .collect();
        snapshots.sort_by(|a, b| a.container_id.cmp(&b.container_id));
        snapshots
    }

    pub fn container_ids(&self) -> Vec<ContainerId> {
        self.instances.iter().map(|r| r.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fid(name: &str) -> FunctionId {
        FunctionId::new(name).unwrap()
    }

    fn cid(name: &str) -> ContainerId {
        ContainerId::new(name)
    }

    #[test]
    fn test_insert_and_transition() {
        let registry = InstanceRegistry::new();
        registry.insert(InstanceRecord::creating(cid("c1"), fid("echo")));

        assert_eq!(registry.get_state(&cid("c1")).unwrap(), LifecycleState::Creating);
        registry.transition(&cid("c1"), LifecycleState::Running).unwrap();
        assert_eq!(registry.get_state(&cid("c1")).unwrap(), LifecycleState::Running);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_invalid_transition_leaves_state() {
        let registry = InstanceRegistry::new();
        registry.insert(InstanceRecord::creating(cid("c1"), fid("echo")));

        let err = registry
            .transition(&cid("c1"), LifecycleState::Paused)
            .unwrap_err();
        assert!(matches!(err, EmberError::InvalidStateTransition(_)));
        assert_eq!(registry.get_state(&cid("c1")).unwrap(), LifecycleState::Creating);
    }

    #[test]
    fn test_unknown_instance() {
        let registry = InstanceRegistry::new();
        assert!(matches!(
            registry.get_state(&cid("ghost")),
            Err(EmberError::InstanceNotFound(_))
        ));
        assert!(registry.update(&cid("ghost"), |_| {}).is_err());
        assert!(registry.remove(&cid("ghost")).is_none());
    }

    #[test]
    fn test_info_requires_address() {
        let registry = InstanceRegistry::new();
        registry.insert(InstanceRecord::creating(cid("c1"), fid("echo")));
        assert!(registry.get(&cid("c1")).unwrap().info().is_none());

        registry
            .update(&cid("c1"), |r| {
                r.ip_address = Some("10.88.1.2".parse().unwrap());
                r.host_port = Some(HostPort::new(20000).unwrap());
            })
            .unwrap();

        let info = registry.get(&cid("c1")).unwrap().info().unwrap();
        assert_eq!(info.id, cid("c1"));
        assert_eq!(info.port.map(|p| p.value()), Some(20000));
    }

    #[test]
    fn test_for_function_filters() {
        let registry = InstanceRegistry::new();
        registry.insert(InstanceRecord::creating(cid("c1"), fid("echo")));
        registry.insert(InstanceRecord::creating(cid("c2"), fid("resize")));
        registry.insert(InstanceRecord::creating(cid("c3"), fid("echo")));

        let mut ids: Vec<_> = registry
            .for_function(&fid("echo"))
            .iter()
            .map(|r| r.container_id().clone())
            .collect();
        ids.sort();
        assert_eq!(ids, vec![cid("c1"), cid("c3")]);
    }

    #[test]
    fn test_idle_running() {
        let registry = InstanceRegistry::new();
        registry.insert(InstanceRecord::observed(
            cid("c1"),
            fid("echo"),
            LifecycleState::Running,
        ));
        registry.insert(InstanceRecord::observed(
            cid("c2"),
            fid("echo"),
            LifecycleState::Paused,
        ));

        assert_eq!(registry.idle_running(Duration::ZERO), vec![cid("c1")]);
        assert!(registry.idle_running(Duration::from_secs(3600)).is_empty());
        assert_eq!(
            registry.instances_in_state(LifecycleState::Paused),
            vec![cid("c2")]
        );
    }

    #[test]
    fn test_snapshots_sorted() {
        let registry = InstanceRegistry::new();
        registry.insert(InstanceRecord::creating(cid("b"), fid("echo")));
        registry.insert(InstanceRecord::creating(cid("a"), fid("echo")));

        let snapshots = registry.snapshots();
        assert_eq!(snapshots[0].container_id, cid("a"));
        assert_eq!(snapshots[1].state, LifecycleState::Creating);
    }
}
