// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `ember snapshotter` command - Show snapshotter resolution.

use ember_core::resolve_snapshotter;

pub async fn execute(
    runtime: &str,
    override_snapshotter: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let snapshotter = resolve_snapshotter(runtime, override_snapshotter);
    tracing::debug!(runtime = %runtime, snapshotter = %snapshotter, "Resolved snapshotter");

    println!("{}", snapshotter);
    Ok(())
}
