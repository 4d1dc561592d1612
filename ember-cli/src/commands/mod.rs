// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! CLI command modules.

use thiserror::Error;

use ember_core::CniError;

pub mod cni;
pub mod snapshotter;
pub mod validate;

/// Failures of commands that touch files directly.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Cni(#[from] CniError),
}
