// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Custom error types for Ember.
//!
//! This module defines explicit enum error types as per coding guidelines.
//! No `Box<dyn Error>`, no `anyhow::Result` - all errors are strongly typed.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{ContainerId, FunctionId};

/// Top-level error type for the Ember agent.
/// All errors are explicit variants - no catch-all or generic handling.
#[derive(Debug, Error)]
pub enum EmberError {
    // =========================================================================
    // Configuration Errors - Fail-Fast on Invalid Config
    // =========================================================================
    #[error("Hard validation error: {0}")]
    HardValidation(#[from] HardValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(#[from] StateTransitionError),

    #[error("Instance not found: {0}")]
    InstanceNotFound(ContainerId),

    /// Engine query failed while locating an existing instance.
    #[error("Lookup for function {function_id} failed: {source}")]
    Lookup {
        function_id: FunctionId,
        #[source]
        source: BackendError,
    },

    /// Engine call failed before a container existed.
    #[error("{operation} for function {function_id} failed: {source}")]
    Provision {
        operation: &'static str,
        function_id: FunctionId,
        #[source]
        source: BackendError,
    },

    /// Engine call against an existing container failed.
    #[error("{operation} failed for container {container_id}: {source}")]
    Transition {
        operation: &'static str,
        container_id: ContainerId,
        #[source]
        source: BackendError,
    },

    #[error("Container {container_id} reported no IP address")]
    NoAddress { container_id: ContainerId },

    /// Engine call not tied to a single container or function.
    #[error("Backend {operation} failed: {source}")]
    Backend {
        operation: &'static str,
        #[source]
        source: BackendError,
    },

    // =========================================================================
    // Resource Allocation Errors
    // =========================================================================
    #[error("CNI error: {0}")]
    Cni(#[from] CniError),

    #[error("Port allocation error: {0}")]
    Port(#[from] PortError),

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Hard validation errors cause immediate process termination.
/// Used when configuration is invalid and the system cannot safely start.
#[derive(Debug, Error)]
pub enum HardValidationError {
    #[error("Missing required field: {field} in {context}")]
    MissingRequiredField {
        field: &'static str,
        context: String,
    },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid port: {port} - {reason}")]
    InvalidPort { port: u16, reason: String },
}

/// State transition errors for the instance state machine.
#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("Cannot transition from {from} to {to} for container {container_id}")]
    InvalidTransition {
        container_id: ContainerId,
        from: &'static str,
        to: &'static str,
    },

    #[error("Container {container_id} is in terminal state: {state}")]
    TerminalState {
        container_id: ContainerId,
        state: &'static str,
    },
}

/// Failures reported by a container engine adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("container {id} not found")]
    NotFound { id: String },

    #[error("container {id} is already attached to network {network}")]
    AlreadyConnected { id: String, network: String },

    #[error("{operation}: {message}")]
    Engine {
        operation: &'static str,
        message: String,
    },
}

impl BackendError {
    pub fn engine(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Engine {
            operation,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_connected(&self) -> bool {
        matches!(self, Self::AlreadyConnected { .. })
    }
}

/// CNI configuration rewrite and subnet slicing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CniError {
    /// Requested subnet is not usable inside the base subnet.
    #[error("Requested subnet {requested} is outside base subnet {base}: {reason}")]
    Range {
        requested: String,
        base: String,
        reason: String,
    },

    /// Plugin configuration is missing an expected element.
    #[error("CNI configuration is missing {element}")]
    Structure { element: &'static str },

    #[error("Invalid CIDR '{value}': {reason}")]
    InvalidCidr { value: String, reason: String },

    #[error("No free /{prefix} slice left in {base}")]
    PoolExhausted { base: String, prefix: u8 },

    #[error("CNI document encoding failed: {reason}")]
    Encoding { reason: String },
}

/// Host port pool errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("Port pool {min}-{max} exhausted")]
    PoolExhausted { min: u16, max: u16 },

    #[error("Invalid port pool {min}-{max}: {reason}")]
    InvalidPool { min: u16, max: u16, reason: String },
}

/// A best-effort cleanup step that did not complete.
/// Logged by the orchestrator, never returned over the triggering error.
#[derive(Debug, Error)]
pub enum RollbackError {
    #[error("rollback delete of {container_id} failed: {source}")]
    Delete {
        container_id: ContainerId,
        #[source]
        source: BackendError,
    },

    #[error("rollback of {container_id} exceeded {timeout_ms}ms")]
    Timeout {
        container_id: ContainerId,
        timeout_ms: u64,
    },

    #[error("rollback task for {container_id} aborted: {reason}")]
    Aborted {
        container_id: ContainerId,
        reason: String,
    },
}

/// Result type alias using EmberError.
pub type EmberResult<T> = Result<T, EmberError>;
