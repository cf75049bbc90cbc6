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

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use crate::error::Result;
use crate::storage::StorageDescriptor;

/// What the index knows about one mount base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_base: String,
    /// Local folder serving this base. `None` until a mount (or download
    /// fallback) succeeded.
    pub local_folder: Option<PathBuf>,
    /// Longest common prefix of every URI recorded for this base.
    pub uri_prefix: String,
}

impl MountEntry {
    /// The recorded prefix cut back to a whole directory, never shorter
    /// than `<mount_base>/`.
    pub fn mount_prefix(&self) -> String {
        let base_dir = format!("{}/", self.mount_base);
        let truncated = truncate_to_separator(&self.uri_prefix);
        if truncated.len() < base_dir.len() {
            base_dir
        } else {
            truncated.to_string()
        }
    }

    /// Local path serving `storage_path`, if this base is mounted and the
    /// path lives under the recorded prefix.
    pub fn source_for(&self, storage_path: &str) -> Option<PathBuf> {
        let folder = self.local_folder.as_ref()?;
        let relative = storage_path.strip_prefix(&self.mount_prefix())?;
        Some(folder.join(relative))
    }
}

/// Concurrency-safe map from mount base to its best mount folder and prefix.
///
/// A single map-wide lock serializes updates. The lock is held only for the
/// in-memory read or update.
#[derive(Debug, Default)]
pub struct MountIndex {
    entries: Mutex<HashMap<String, MountEntry>>,
}

impl MountIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, MountEntry>> {
        // A poisoned map still holds consistent entries: every update is a
        // single insert or field assignment.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Parse `uri` and fold it into its mount base's prefix.
    ///
    /// Returns the mount base the URI belongs to.
    pub fn record(&self, uri: &str) -> Result<String> {
        let descriptor = StorageDescriptor::parse(uri)?;
        Ok(self.record_descriptor(&descriptor))
    }

    pub fn record_descriptor(&self, descriptor: &StorageDescriptor) -> String {
        let mount_base = descriptor.mount_base();
        let uri = descriptor.uri();

        let mut entries = self.entries();
        match entries.get_mut(&mount_base) {
            Some(entry) => {
                let shared = longest_common_prefix(&entry.uri_prefix, uri);
                entry.uri_prefix = truncate_to_separator(shared).to_string();
            }
            None => {
                entries.insert(
                    mount_base.clone(),
                    MountEntry {
                        mount_base: mount_base.clone(),
                        local_folder: None,
                        uri_prefix: uri.to_string(),
                    },
                );
            }
        }
        mount_base
    }

    pub fn lookup(&self, mount_base: &str) -> Option<MountEntry> {
        self.entries().get(mount_base).cloned()
    }

    /// Record the local folder serving `mount_base`. Returns false when the
    /// base was never recorded.
    pub fn set_local_folder(&self, mount_base: &str, folder: PathBuf) -> bool {
        match self.entries().get_mut(mount_base) {
            Some(entry) => {
                entry.local_folder = Some(folder);
                true
            }
            None => false,
        }
    }

    /// All recorded entries, sorted by mount base.
    pub fn snapshot(&self) -> Vec<MountEntry> {
        let mut entries: Vec<MountEntry> = self.entries().values().cloned().collect();
        entries.sort_by(|a, b| a.mount_base.cmp(&b.mount_base));
        entries
    }

    pub fn mount_bases(&self) -> Vec<String> {
        self.snapshot().into_iter().map(|e| e.mount_base).collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

/// Longest shared leading substring, split on a char boundary.
fn longest_common_prefix<'a>(a: &'a str, b: &str) -> &'a str {
    let len = a
        .char_indices()
        .zip(b.chars())
        .take_while(|((_, ca), cb)| ca == cb)
        .last()
        .map(|((idx, ca), _)| idx + ca.len_utf8())
        .unwrap_or(0);
    &a[..len]
}

/// Cut `prefix` back to (and including) its last `/`.
fn truncate_to_separator(prefix: &str) -> &str {
    match prefix.rfind('/') {
        Some(idx) => &prefix[..=idx],
        None => "",
    }
}
