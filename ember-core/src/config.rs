// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! YAML configuration parser with strict schema validation.
//!
//! Validates the agent configuration at boot-up time.
//! Any invalid field results in a HardValidationError that prevents startup.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::backend::{resolve_snapshotter, ContainerdSettings};
use crate::cni::MAX_SLICE_PREFIX;
use crate::error::{EmberError, EmberResult, HardValidationError};
use crate::orchestrator::OrchestratorSettings;

/// Smallest slice the subnet pool will carve.
const MIN_SLICE_PREFIX: u8 = 8;
/// Upper bound on the detached rollback task.
const MAX_ROLLBACK_TIMEOUT_MS: u64 = 60_000;

/// Raw agent configuration as parsed from YAML (before validation).
#[derive(Debug, Deserialize)]
struct RawAgentConfig {
    #[serde(default = "default_backend")]
    backend: String,
    #[serde(default = "default_namespace")]
    namespace: String,
    #[serde(default = "default_network")]
    network: String,
    #[serde(default = "default_container_port")]
    container_port: u16,
    #[serde(default = "default_runtime")]
    runtime: String,
    #[serde(default)]
    snapshotter: String,
    #[serde(default = "default_rollback_timeout_ms")]
    rollback_timeout_ms: u64,
}

fn default_backend() -> String {
    "containerd".to_string()
}

fn default_namespace() -> String {
    "ember".to_string()
}

fn default_network() -> String {
    "ember-net".to_string()
}

fn default_container_port() -> u16 {
    8080
}

fn default_runtime() -> String {
    crate::backend::DEFAULT_RUNTIME.to_string()
}

fn default_rollback_timeout_ms() -> u64 {
    10_000
}

impl Default for RawAgentConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            namespace: default_namespace(),
            network: default_network(),
            container_port: default_container_port(),
            runtime: default_runtime(),
            snapshotter: String::new(),
            rollback_timeout_ms: default_rollback_timeout_ms(),
        }
    }
}

/// Raw host port pool.
#[derive(Debug, Deserialize)]
struct RawPortsConfig {
    #[serde(default = "default_port_min")]
    min: u16,
    #[serde(default = "default_port_max")]
    max: u16,
}

fn default_port_min() -> u16 {
    20000
}

fn default_port_max() -> u16 {
    20999
}

impl Default for RawPortsConfig {
    fn default() -> Self {
        Self {
            min: default_port_min(),
            max: default_port_max(),
        }
    }
}

/// Raw CNI section.
#[derive(Debug, Deserialize)]
struct RawCniConfig {
    config_path: Option<String>,
    #[serde(default = "default_slice_prefix")]
    slice_prefix: u8,
}

fn default_slice_prefix() -> u8 {
    24
}

/// Raw root configuration file.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    agent: RawAgentConfig,
    #[serde(default)]
    ports: RawPortsConfig,
    #[serde(default)]
    cni: Option<RawCniConfig>,
}

/// Container engine the agent drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Containerd,
    Docker,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Containerd => "containerd",
            Self::Docker => "docker",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Validated agent configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub backend: BackendKind,
    pub namespace: String,
    pub network: String,
    pub container_port: u16,
    pub runtime: String,
    /// Explicit snapshotter; `None` resolves from the runtime.
    pub snapshotter_override: Option<String>,
    pub rollback_timeout: Duration,
}

impl AgentConfig {
    /// Snapshotter the containerd backend will use.
    pub fn snapshotter(&self) -> String {
        resolve_snapshotter(&self.runtime, self.snapshotter_override.as_deref())
    }

    pub fn containerd_settings(&self) -> ContainerdSettings {
        ContainerdSettings {
            namespace: self.namespace.clone(),
            runtime: self.runtime.clone(),
            snapshotter_override: self.snapshotter_override.clone(),
        }
    }
}

/// Validated host port pool bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

/// Validated CNI settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CniSettings {
    pub config_path: PathBuf,
    pub slice_prefix: u8,
}

/// Complete validated configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub agent: AgentConfig,
    pub ports: PortRange,
    pub cni: Option<CniSettings>,
}

impl Config {
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            network: self.agent.network.clone(),
            container_port: self.agent.container_port,
            rollback_timeout: self.agent.rollback_timeout,
        }
    }
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    /// Returns HardValidationError for any invalid fields.
    pub fn load_file(path: impl AsRef<Path>) -> EmberResult<Config> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(EmberError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| EmberError::Io {
            context: "reading config file",
            source: e,
        })?;

        Self::load_string(&content)
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> EmberResult<Config> {
        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| EmberError::ConfigParse {
                message: format!("YAML parse error: {}", e),
            })?;

        Self::validate(raw)
    }

    /// Validate raw configuration and convert to validated types.
    fn validate(raw: RawConfig) -> EmberResult<Config> {
        let agent = Self::validate_agent(raw.agent)?;
        let ports = Self::validate_ports(raw.ports)?;
        let cni = raw.cni.map(Self::validate_cni).transpose()?;

        // containerd attaches networks only through CNI
        if agent.backend == BackendKind::Containerd && cni.is_none() {
            return Err(HardValidationError::MissingRequiredField {
                field: "cni",
                context: "config (required by the containerd backend)".to_string(),
            }
            .into());
        }

        Ok(Config { agent, ports, cni })
    }

    fn validate_agent(raw: RawAgentConfig) -> EmberResult<AgentConfig> {
        let backend = match raw.backend.as_str() {
            "containerd" => BackendKind::Containerd,
            "docker" => BackendKind::Docker,
            other => {
                return Err(HardValidationError::InvalidFieldValue {
                    field: "backend",
                    value: other.to_string(),
                    reason: "Must be one of: containerd, docker".to_string(),
                }
                .into())
            }
        };

        if raw.namespace.trim().is_empty() {
            return Err(HardValidationError::MissingRequiredField {
                field: "namespace",
                context: "agent".to_string(),
            }
            .into());
        }

        if raw.network.trim().is_empty() {
            return Err(HardValidationError::MissingRequiredField {
                field: "network",
                context: "agent".to_string(),
            }
            .into());
        }

        if raw.container_port == 0 {
            return Err(HardValidationError::InvalidPort {
                port: 0,
                reason: "container_port must be non-zero".to_string(),
            }
            .into());
        }

        if raw.rollback_timeout_ms == 0 || raw.rollback_timeout_ms > MAX_ROLLBACK_TIMEOUT_MS {
            return Err(HardValidationError::InvalidFieldValue {
                field: "rollback_timeout_ms",
                value: raw.rollback_timeout_ms.to_string(),
                reason: format!("Must be between 1 and {}", MAX_ROLLBACK_TIMEOUT_MS),
            }
            .into());
        }

        let snapshotter = raw.snapshotter.trim();
        let snapshotter_override = (!snapshotter.is_empty()).then(|| snapshotter.to_string());

        Ok(AgentConfig {
            backend,
            namespace: raw.namespace,
            network: raw.network,
            container_port: raw.container_port,
            runtime: raw.runtime,
            snapshotter_override,
            rollback_timeout: Duration::from_millis(raw.rollback_timeout_ms),
        })
    }

    fn validate_ports(raw: RawPortsConfig) -> EmberResult<PortRange> {
        for port in [raw.min, raw.max] {
            if port == 0 {
                return Err(HardValidationError::InvalidPort {
                    port,
                    reason: "Port 0 is reserved and cannot be used".to_string(),
                }
                .into());
            }
        }

        if raw.min > raw.max {
            return Err(HardValidationError::InvalidFieldValue {
                field: "ports",
                value: format!("{}-{}", raw.min, raw.max),
                reason: "min must not exceed max".to_string(),
            }
            .into());
        }

        Ok(PortRange {
            min: raw.min,
            max: raw.max,
        })
    }

    fn validate_cni(raw: RawCniConfig) -> EmberResult<CniSettings> {
        let config_path = raw
            .config_path
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| HardValidationError::MissingRequiredField {
                field: "config_path",
                context: "cni".to_string(),
            })?;

        if !(MIN_SLICE_PREFIX..=MAX_SLICE_PREFIX).contains(&raw.slice_prefix) {
            return Err(HardValidationError::InvalidFieldValue {
                field: "slice_prefix",
                value: raw.slice_prefix.to_string(),
                reason: format!(
                    "Must be between {} and {}",
                    MIN_SLICE_PREFIX, MAX_SLICE_PREFIX
                ),
            }
            .into());
        }

        Ok(CniSettings {
            config_path: PathBuf::from(config_path),
            slice_prefix: raw.slice_prefix,
        })
    }
}
