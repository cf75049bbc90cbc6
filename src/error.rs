// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Unified error types for the staging agent.
//!
//! Transient conditions (service unreachable, rate limiting) are handled
//! inside the retry loops and never show up here. What does show up is
//! either fatal for the calling operation or explicitly surfaced to the
//! caller so it can pick a fallback.
//!
//! # Example
//!
//! ```rust
//! use staging_agent::{Error, StorageDescriptor};
//!
//! let err = StorageDescriptor::parse("ftp://host/file").unwrap_err();
//! assert!(matches!(err, Error::InvalidUri { .. }));
//! assert_eq!(err.exit_code(), 2);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::common::config::AgentConfig;

/// The main error type for staging operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A storage locator could not be parsed.
    ///
    /// This is an input error; the binary exits with
    /// [`AgentConfig::EXIT_INVALID_INPUT`].
    #[error("Invalid storage URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    /// A command kept failing after the outer retry budget was spent.
    #[error("'{command}' failed after {attempts} retries")]
    RetriesExhausted {
        command: String,
        attempts: u32,
        exit_code: i32,
    },

    /// The orchestration service stayed unreachable past the configured limit.
    #[error("Service unreachable for {elapsed:?} (limit {limit:?})")]
    ServiceDisconnected { elapsed: Duration, limit: Duration },

    /// The manifest could not be decoded.
    #[error("Manifest error in {path}: {message}")]
    Manifest { path: PathBuf, message: String },

    /// A manifest entry references a mount base that pass one never recorded.
    #[error("No mount recorded for '{mount_base}' (storage path '{storage_path}')")]
    UnresolvedMount {
        mount_base: String,
        storage_path: String,
    },

    /// The supervised sync subprocess exited unsuccessfully.
    #[error("Sync session exited with status {code:?}")]
    SyncExited { code: Option<i32> },

    /// The agent was asked to stop before the operation finished.
    #[error("Interrupted before completion")]
    Interrupted,

    /// A subprocess pipe could not be captured.
    #[error("Failed to capture {0} of child process")]
    MissingPipe(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn invalid_uri(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidUri {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    /// Process exit status the binary should use for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidUri { .. } => AgentConfig::EXIT_INVALID_INPUT,
            Error::RetriesExhausted { exit_code, .. } => *exit_code,
            Error::Interrupted => AgentConfig::EXIT_INTERRUPTED,
            _ => AgentConfig::EXIT_FAILURE,
        }
    }
}

/// A specialized Result type for staging operations.
pub type Result<T> = std::result::Result<T, Error>;
