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

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use super::config::{CacheSettings, MountConfig};
use crate::common::OutputSink;
use crate::error::Result;
use crate::process::exec_buffered;
use crate::storage::{CredentialProvider, StorageDescriptor};

/// Turns a storage descriptor into a read-only local mount.
pub struct MountOrchestrator {
    config: MountConfig,
    sink: Arc<dyn OutputSink>,
}

impl MountOrchestrator {
    pub fn new(config: MountConfig, sink: Arc<dyn OutputSink>) -> Self {
        Self { config, sink }
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    /// Mount `descriptor` at `local_path`.
    ///
    /// Returns whether the mount point is still empty afterwards. An empty
    /// result means nothing was staged (missing credentials, or every
    /// attempt came back empty) and the caller has to fall back.
    ///
    /// A legitimately empty remote prefix looks the same as a failed mount.
    pub async fn mount(
        &self,
        descriptor: &StorageDescriptor,
        credentials: &dyn CredentialProvider,
        local_path: &Path,
        cache: &CacheSettings,
    ) -> Result<bool> {
        let profile = descriptor.profile_key();
        let Some(credential) = credentials.lookup(&profile) else {
            self.sink.write_line(&format!(
                "No credentials found for profile '{profile}', skipping mount of {descriptor}"
            ));
            return Ok(true);
        };

        tokio::fs::create_dir_all(local_path).await?;
        if let Some((cache_dir, _)) = cache.enabled() {
            tokio::fs::create_dir_all(cache_dir).await?;
        }

        let mut spec = self
            .config
            .mount_command
            .clone()
            .args(self.config.mount_args(descriptor, local_path, cache));
        for (key, value) in credential.env_vars() {
            spec = spec.env(key, value);
        }

        for attempt in 1..=self.config.attempts {
            debug!("Mounting {descriptor} at {} (attempt {attempt})", local_path.display());

            match exec_buffered(&spec).await {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    let message = format!("{}{}", output.stderr, output.stdout);
                    if message.contains("already mounted") {
                        self.sink.write_line(&format!(
                            "{} is already mounted, checking contents",
                            local_path.display()
                        ));
                    } else if message.to_lowercase().contains("timeout") {
                        self.sink.write_line(&format!(
                            "Mounting {descriptor} timed out (attempt {attempt}/{}), retrying",
                            self.config.attempts
                        ));
                        continue;
                    } else {
                        self.sink.write_line(&format!(
                            "Mounting {descriptor} failed with status {} (attempt {attempt}/{}): {}",
                            output.status,
                            self.config.attempts,
                            message.trim()
                        ));
                    }
                }
                Err(e) => {
                    self.sink.write_line(&format!(
                        "Could not run mount client for {descriptor}: {e}"
                    ));
                }
            }

            if !dir_is_empty(local_path).await {
                self.sink
                    .write_line(&format!("Mounted {descriptor} at {}", local_path.display()));
                return Ok(false);
            }

            self.sink.write_line(&format!(
                "Mount of {descriptor} is empty (attempt {attempt}/{}), unmounting",
                self.config.attempts
            ));
            self.unmount(local_path).await;
        }

        Ok(true)
    }

    /// Best-effort unmount; failures are only logged.
    pub async fn unmount(&self, local_path: &Path) {
        let spec = self.config.unmount_spec(local_path);
        match exec_buffered(&spec).await {
            Ok(output) if output.success() => {}
            Ok(output) => debug!(
                "'{}' exited with {}: {}",
                spec.display(),
                output.status,
                output.stderr.trim()
            ),
            Err(e) => warn!("Failed to run '{}': {e}", spec.display()),
        }
    }
}

/// A directory that cannot be listed counts as empty.
async fn dir_is_empty(path: &Path) -> bool {
    match tokio::fs::read_dir(path).await {
        Ok(mut entries) => !matches!(entries.next_entry().await, Ok(Some(_))),
        Err(e) => {
            debug!("Cannot list {}: {e}", path.display());
            true
        }
    }
}
