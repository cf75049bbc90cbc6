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

//! The task setup flow: resolve a manifest, mount what it needs, link it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::common::OutputSink;
use crate::error::Result;
use crate::manifest::{LinkReport, ManifestLinker};
use crate::mount::{CacheSettings, MountOrchestrator};
use crate::storage::{CredentialProvider, StorageDescriptor};
use crate::transfer::Transfer;

/// Outcome of one staging run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    /// Mount bases the manifest needed.
    pub mount_bases: usize,
    pub mounted: usize,
    /// Bases served by a download after their mount came back empty.
    pub downloaded: usize,
    /// Bases with nothing staged; their entries are skipped when linking.
    pub unstaged: usize,
    pub link: LinkReport,
}

pub struct Stager {
    linker: ManifestLinker,
    orchestrator: MountOrchestrator,
    credentials: Arc<dyn CredentialProvider>,
    cache: CacheSettings,
    fallback: Option<Arc<dyn Transfer>>,
    sink: Arc<dyn OutputSink>,
}

impl Stager {
    pub fn new(
        linker: ManifestLinker,
        orchestrator: MountOrchestrator,
        credentials: Arc<dyn CredentialProvider>,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        Self {
            linker,
            orchestrator,
            credentials,
            cache: CacheSettings::default(),
            fallback: None,
            sink,
        }
    }

    pub fn with_cache(mut self, cache: CacheSettings) -> Self {
        self.cache = cache;
        self
    }

    /// Download a mount base's prefix when its mount comes back empty.
    pub fn with_download_fallback(mut self, transfer: Arc<dyn Transfer>) -> Self {
        self.fallback = Some(transfer);
        self
    }

    /// Resolve `manifest`, mount every base under `mount_root`, and link the
    /// entries into `destination`.
    pub async fn stage_manifest(
        &self,
        manifest: &Path,
        hash_root: Option<&str>,
        destination: &Path,
        mount_root: &Path,
    ) -> Result<StageReport> {
        let index = self.linker.resolve_locations(manifest, hash_root).await?;
        let mut report = StageReport {
            mount_bases: index.len(),
            ..Default::default()
        };

        for entry in index.snapshot() {
            let prefix = entry.mount_prefix();
            let descriptor = StorageDescriptor::parse(&prefix)?;
            let folder_name = mount_folder_name(&entry.mount_base);
            let mount_point = mount_root.join(&folder_name);

            let empty = self
                .orchestrator
                .mount(
                    &descriptor,
                    self.credentials.as_ref(),
                    &mount_point,
                    &self.cache,
                )
                .await?;
            if !empty {
                index.set_local_folder(&entry.mount_base, mount_point);
                report.mounted += 1;
                continue;
            }

            match &self.fallback {
                Some(transfer) => {
                    let folder = download_folder(mount_root, &folder_name);
                    self.sink.write_line(&format!(
                        "Mount of {prefix} is empty, downloading it to {}",
                        folder.display()
                    ));
                    transfer.download(&prefix, &folder, None).await?;
                    index.set_local_folder(&entry.mount_base, folder);
                    report.downloaded += 1;
                }
                None => {
                    self.sink
                        .write_line(&format!("Nothing staged for {}", entry.mount_base));
                    report.unstaged += 1;
                }
            }
        }

        report.link = self
            .linker
            .link_manifest(manifest, &index, destination)
            .await?;
        info!(
            "Staged {} into {}: {} mounted, {} downloaded, {} unstaged",
            manifest.display(),
            destination.display(),
            report.mounted,
            report.downloaded,
            report.unstaged
        );
        Ok(report)
    }
}

/// Filesystem-safe folder name for a mount base: `s3://bucket` -> `s3_bucket`.
pub fn mount_folder_name(mount_base: &str) -> String {
    let mut name = String::with_capacity(mount_base.len());
    for c in mount_base.replace("://", "_").chars() {
        name.push(if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
            c
        } else {
            '_'
        });
    }
    name
}

fn download_folder(mount_root: &Path, folder_name: &str) -> PathBuf {
    mount_root.join(format!("{folder_name}_download"))
}
