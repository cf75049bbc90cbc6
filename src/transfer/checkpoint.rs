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

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::data_cli::Transfer;
use crate::common::StopSignal;
use crate::error::Result;

/// Periodically uploads a working directory, with a final flush on stop.
#[derive(Clone)]
pub struct CheckpointUploader {
    transfer: Arc<dyn Transfer>,
    path: PathBuf,
    destination: String,
    frequency: Duration,
    regex: Option<String>,
}

impl CheckpointUploader {
    pub fn new(
        transfer: Arc<dyn Transfer>,
        path: impl Into<PathBuf>,
        destination: impl Into<String>,
        frequency: Duration,
    ) -> Self {
        Self {
            transfer,
            path: path.into(),
            destination: destination.into(),
            frequency,
            regex: None,
        }
    }

    pub fn with_regex(mut self, regex: impl Into<String>) -> Self {
        self.regex = Some(regex.into());
        self
    }

    /// Upload every `frequency` until `stop` is raised, then upload once
    /// more. Returns the number of completed uploads.
    ///
    /// A failed periodic upload is logged and the timer restarts; a failed
    /// final upload is returned.
    pub async fn run(&self, stop: &StopSignal) -> Result<u32> {
        let mut uploads = 0;

        while !stop.sleep(self.frequency).await {
            match self.upload().await {
                Ok(()) => uploads += 1,
                Err(e) => warn!(
                    "Checkpoint upload of {} failed, will retry next interval: {e}",
                    self.path.display()
                ),
            }
        }

        info!("Stop requested, flushing final checkpoint to {}", self.destination);
        self.upload().await?;
        Ok(uploads + 1)
    }

    /// Run on a dedicated background task.
    pub fn spawn(self, stop: StopSignal) -> JoinHandle<Result<u32>> {
        tokio::spawn(async move { self.run(&stop).await })
    }

    async fn upload(&self) -> Result<()> {
        self.transfer
            .upload(&self.path, &self.destination, self.regex.as_deref())
            .await
            .map(|_| ())
    }
}
