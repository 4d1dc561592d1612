// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `ember cni` command - Render a per-instance CNI configuration.

use ember_core::apply_cni_subnet_bytes;

use super::CommandError;

pub async fn execute(
    conflist: &str,
    subnet: &str,
    output: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(conflist = %conflist, subnet = %subnet, "Rendering CNI configuration");

    let rendered = render(conflist, subnet)?;
    match output {
        Some(path) => {
            tokio::fs::write(path, &rendered)
                .await
                .map_err(|source| CommandError::Write {
                    path: path.to_string(),
                    source,
                })?;
            println!("✓ Wrote {}", path);
        }
        None => println!("{}", String::from_utf8_lossy(&rendered)),
    }
    Ok(())
}

fn render(conflist: &str, subnet: &str) -> Result<Vec<u8>, CommandError> {
    let base = std::fs::read(conflist).map_err(|source| CommandError::Read {
        path: conflist.to_string(),
        source,
    })?;
    Ok(apply_cni_subnet_bytes(&base, subnet)?)
}
