// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Host port allocator for NAT-mapped instances.
//!
//! Hands out the lowest free port of a bounded pool. A port is owned by at most
//! one container at a time; releasing a free port is a no-op so rollback and
//! destroy can both call it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::PortError;
use crate::types::{ContainerId, HostPort};

/// Thread-safe pool of host TCP ports.
#[derive(Debug)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    /// Reverse mapping port → owning container.
    allocated: Mutex<BTreeMap<u16, ContainerId>>,
}

impl PortAllocator {
    /// Create an allocator over the inclusive range `[min, max]`.
    pub fn new(min: u16, max: u16) -> Result<Self, PortError> {
        if min == 0 {
            return Err(PortError::InvalidPool {
                min,
                max,
                reason: "port 0 is reserved".to_string(),
            });
        }
        if min > max {
            return Err(PortError::InvalidPool {
                min,
                max,
                reason: "min must not exceed max".to_string(),
            });
        }

        Ok(Self {
            min,
            max,
            allocated: Mutex::new(BTreeMap::new()),
        })
    }

    /// Create an allocator wrapped in an Arc for sharing across tasks.
    pub fn new_shared(min: u16, max: u16) -> Result<Arc<Self>, PortError> {
        Self::new(min, max).map(Arc::new)
    }

    /// Reserve the lowest free port for `container_id`.
    pub fn allocate(&self, container_id: &ContainerId) -> Result<HostPort, PortError> {
        let mut allocated = self.allocated.lock().unwrap_or_else(PoisonError::into_inner);

        let port = (self.min..=self.max)
            .find(|port| !allocated.contains_key(port))
            .ok_or(PortError::PoolExhausted {
                min: self.min,
                max: self.max,
            })?;

        allocated.insert(port, container_id.clone());

        tracing::debug!(container_id = %container_id, port = port, "Allocated host port");

        // min >= 1 is checked in new(), so every candidate is non-zero
        HostPort::new(port).map_err(|e| PortError::InvalidPool {
            min: self.min,
            max: self.max,
            reason: e.to_string(),
        })
    }

    /// Record `port` as held by `container_id`, e.g. when adopting an
    /// instance whose port was persisted by an earlier agent process.
    /// Returns false if another container already holds it.
    pub fn claim(&self, port: HostPort, container_id: &ContainerId) -> bool {
        let mut allocated = self.allocated.lock().unwrap_or_else(PoisonError::into_inner);
        match allocated.get(&port.value()) {
            Some(owner) => owner == container_id,
            None => {
                allocated.insert(port.value(), container_id.clone());
                true
            }
        }
    }

    /// Return `port` to the pool if `container_id` holds it. Releasing a free
    /// port, or one held by another container, is a no-op. Returns whether
    /// the port was freed.
    pub fn release(&self, port: HostPort, container_id: &ContainerId) -> bool {
        let mut allocated = self.allocated.lock().unwrap_or_else(PoisonError::into_inner);
        match allocated.get(&port.value()) {
            Some(owner) if owner == container_id => {
                allocated.remove(&port.value());
                tracing::debug!(container_id = %container_id, port = %port, "Released host port");
                true
            }
            Some(owner) => {
                tracing::debug!(
                    container_id = %container_id,
                    owner = %owner,
                    port = %port,
                    "Host port held by another container, not released"
                );
                false
            }
            None => false,
        }
    }

    /// Release every port held by `container_id`. Returns how many were freed.
    pub fn release_owned_by(&self, container_id: &ContainerId) -> usize {
        let mut allocated = self.allocated.lock().unwrap_or_else(PoisonError::into_inner);
        let before = allocated.len();
        allocated.retain(|_, owner| owner != container_id);
        before - allocated.len()
    }

    /// Get the container currently holding `port`.
    pub fn owner(&self, port: HostPort) -> Option<ContainerId> {
        let allocated = self.allocated.lock().unwrap_or_else(PoisonError::into_inner);
        allocated.get(&port.value()).cloned()
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Total number of ports in the pool.
    pub fn capacity(&self) -> usize {
        usize::from(self.max - self.min) + 1
    }

    pub fn bounds(&self) -> (u16, u16) {
        (self.min, self.max)
    }
}
