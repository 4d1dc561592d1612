// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Instance state machine with typed state transitions.
//!
//! Implements the container lifecycle:
//! Absent → Creating → Running ↔ Paused, with Stopped observed from the engine
//! and Deleting as the terminal state. Invalid transitions result in
//! StateTransitionError.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::StateTransitionError;
use crate::types::ContainerId;

/// Instance lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// No container exists yet.
    Absent,

    /// Container created; task start and network setup in progress.
    Creating,

    /// Task is running and the instance is reachable.
    Running,

    /// Task is frozen and can be resumed.
    Paused,

    /// Task exited or vanished; the container is an orphan.
    Stopped,

    /// Container removal in progress. Terminal.
    Deleting,
}

impl LifecycleState {
    /// Get the state name for error messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Absent => "Absent",
            Self::Creating => "Creating",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Stopped => "Stopped",
            Self::Deleting => "Deleting",
        }
    }

    /// Check if transition to the target state is valid.
    pub fn can_transition_to(&self, target: LifecycleState) -> bool {
        matches!(
            (self, target),
            // From Absent
            (Self::Absent, Self::Creating) |
            // From Creating
            (Self::Creating, Self::Running) |
            (Self::Creating, Self::Deleting) |
            // From Running
            (Self::Running, Self::Paused) |
            (Self::Running, Self::Stopped) |
            (Self::Running, Self::Deleting) |
            // From Paused
            (Self::Paused, Self::Running) |
            (Self::Paused, Self::Stopped) |
            (Self::Paused, Self::Deleting) |
            // From Stopped
            (Self::Stopped, Self::Deleting)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deleting)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// State machine for one container's lifecycle.
/// Enforces valid state transitions and tracks timing metrics.
#[derive(Debug, Clone)]
pub struct InstanceStateMachine {
    container_id: ContainerId,
    current_state: LifecycleState,
    last_transition: Instant,
    transition_count: u64,
}

impl InstanceStateMachine {
    /// Create a new state machine for a container that does not exist yet.
    pub fn new(container_id: ContainerId) -> Self {
        Self::observed(container_id, LifecycleState::Absent)
    }

    /// Create a state machine for a container found already in `state`,
    /// e.g. one adopted from engine labels after an agent restart.
    pub fn observed(container_id: ContainerId, state: LifecycleState) -> Self {
        Self {
            container_id,
            current_state: state,
            last_transition: Instant::now(),
            transition_count: 0,
        }
    }

    /// Get the current state.
    pub fn state(&self) -> LifecycleState {
        self.current_state
    }

    /// Get the container ID.
    pub fn container_id(&self) -> &ContainerId {
        &self.container_id
    }

    /// Get time since last transition.
    pub fn time_in_current_state(&self) -> std::time::Duration {
        self.last_transition.elapsed()
    }

    /// Get total number of transitions.
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Attempt to transition to a new state.
    /// Returns Ok(()) if successful, or StateTransitionError if invalid.
    pub fn transition_to(&mut self, target: LifecycleState) -> Result<(), StateTransitionError> {
        if self.current_state.is_terminal() {
            return Err(StateTransitionError::TerminalState {
                container_id: self.container_id.clone(),
                state: self.current_state.name(),
            });
        }

        if !self.current_state.can_transition_to(target) {
            return Err(StateTransitionError::InvalidTransition {
                container_id: self.container_id.clone(),
                from: self.current_state.name(),
                to: target.name(),
            });
        }

        tracing::debug!(
            container_id = %self.container_id,
            from = self.current_state.name(),
            to = target.name(),
            "State transition"
        );

        self.current_state = target;
        self.last_transition = Instant::now();
        self.transition_count += 1;

        Ok(())
    }

    /// Check if the instance can serve requests without provisioning.
    pub fn is_warm(&self) -> bool {
        matches!(
            self.current_state,
            LifecycleState::Running | LifecycleState::Paused
        )
    }
}
