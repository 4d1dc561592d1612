// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Ember Core Library
//!
//! Node-agent library that keeps serverless functions running in ephemeral
//! containers. Provides the lifecycle orchestrator, container engine adapters,
//! CNI subnet allocation, host port allocation, configuration parsing and
//! metrics.

pub mod backend;
pub mod cni;
pub mod config;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod ports;
pub mod registry;
pub mod state;
pub mod types;

// Re-export commonly used types
pub use backend::{resolve_snapshotter, Backend, ContainerdBackend, DockerBackend};
pub use cni::{apply_cni_subnet, apply_cni_subnet_bytes, CniPlan, CniRange, SubnetPool};
pub use config::{AgentConfig, BackendKind, Config, ConfigLoader};
pub use error::{
    BackendError, CniError, EmberError, EmberResult, HardValidationError, PortError,
    RollbackError, StateTransitionError,
};
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use ports::PortAllocator;
pub use registry::{InstanceRecord, InstanceRegistry, InstanceSnapshot};
pub use state::{InstanceStateMachine, LifecycleState};
pub use types::{ContainerId, EnsureRequest, FunctionId, HostPort, InstanceInfo};
