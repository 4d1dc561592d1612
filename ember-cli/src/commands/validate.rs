// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `ember validate` command - Validate configuration file.

use ember_core::{Config, ConfigLoader};
use serde_json::json;

pub async fn execute(file: &str, as_json: bool) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(file = %file, "Validating configuration");

    match ConfigLoader::load_file(file) {
        Ok(config) if as_json => {
            println!("{}", serde_json::to_string_pretty(&summary(&config))?);
            Ok(())
        }
        Ok(config) => {
            let agent = &config.agent;
            println!("✓ Configuration is valid");
            println!();
            println!("Agent Settings:");
            println!("  Backend:            {}", agent.backend);
            println!("  Namespace:          {}", agent.namespace);
            println!("  Network:            {}", agent.network);
            println!("  Container Port:     {}", agent.container_port);
            println!("  Runtime:            {}", agent.runtime);
            println!("  Snapshotter:        {}", agent.snapshotter());
            println!(
                "  Rollback Timeout:   {}ms",
                agent.rollback_timeout.as_millis()
            );
            println!();
            println!(
                "Host Ports: {}-{} ({} ports)",
                config.ports.min,
                config.ports.max,
                usize::from(config.ports.max - config.ports.min) + 1
            );
            match &config.cni {
                Some(cni) => println!(
                    "CNI: {} (/{} slices)",
                    cni.config_path.display(),
                    cni.slice_prefix
                ),
                None => println!("CNI: not configured"),
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}

/// Resolved settings as a JSON document.
fn summary(config: &Config) -> serde_json::Value {
    let agent = &config.agent;
    json!({
        "backend": agent.backend.name(),
        "namespace": agent.namespace,
        "network": agent.network,
        "container_port": agent.container_port,
        "runtime": agent.runtime,
        "snapshotter": agent.snapshotter(),
        "rollback_timeout_ms": agent.rollback_timeout.as_millis() as u64,
        "ports": { "min": config.ports.min, "max": config.ports.max },
        "cni": config.cni.as_ref().map(|cni| json!({
            "config_path": cni.config_path.display().to_string(),
            "slice_prefix": cni.slice_prefix,
        })),
    })
}
