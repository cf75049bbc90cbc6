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

use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::reader::{spawn_manifest_reader, ManifestEntry};
use crate::common::config::{AgentConfig, EnvConfig};
use crate::error::{Error, Result};
use crate::mount::MountIndex;
use crate::storage::StorageDescriptor;

/// Counts from a symlink pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkReport {
    pub linked: usize,
    /// Entries whose mount produced no local folder.
    pub skipped: usize,
    /// Entries abandoned after a directory or link error.
    pub failed: usize,
}

#[derive(Debug, Default)]
struct LinkCounters {
    linked: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
}

impl LinkCounters {
    fn report(&self) -> LinkReport {
        LinkReport {
            linked: self.linked.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Resolves a manifest into mount points and a tree of symlinks.
///
/// Both passes stream the manifest through a bounded queue shared by
/// `parallelism` workers. Entry order is not preserved.
#[derive(Debug, Clone)]
pub struct ManifestLinker {
    parallelism: usize,
    queue_depth: usize,
}

impl Default for ManifestLinker {
    fn default() -> Self {
        Self::new(EnvConfig::default_parallelism())
    }
}

impl ManifestLinker {
    pub fn new(parallelism: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
            queue_depth: AgentConfig::MANIFEST_QUEUE_DEPTH,
        }
    }

    pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth.max(1);
        self
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Pass one: collect the mount bases the manifest needs.
    ///
    /// Entries under `hash_root` are not recorded individually; the hash
    /// root itself is recorded once if any entry used it.
    pub async fn resolve_locations(
        &self,
        manifest: &Path,
        hash_root: Option<&str>,
    ) -> Result<Arc<MountIndex>> {
        let index = Arc::new(MountIndex::new());
        let hash_used = Arc::new(AtomicBool::new(false));
        let hash_root = hash_root.filter(|root| !root.is_empty()).map(str::to_string);

        {
            let index = Arc::clone(&index);
            let hash_used = Arc::clone(&hash_used);
            let hash_root = hash_root.clone();
            self.run_pool(manifest, move |entry| {
                let index = Arc::clone(&index);
                let hash_used = Arc::clone(&hash_used);
                let hash_root = hash_root.clone();
                async move {
                    if let Some(root) = &hash_root {
                        if entry.storage_path.starts_with(root.as_str()) {
                            hash_used.store(true, Ordering::Relaxed);
                            return Ok(());
                        }
                    }
                    index.record(&entry.storage_path)?;
                    Ok(())
                }
            })
            .await?;
        }

        if let Some(root) = hash_root {
            if hash_used.load(Ordering::Relaxed) {
                index.record(&root)?;
            }
        }

        info!(
            "Resolved {} mount base(s) from {}",
            index.len(),
            manifest.display()
        );
        Ok(index)
    }

    /// Pass two: link every entry of `manifest` under `destination`.
    ///
    /// An entry whose mount base is missing from `index` aborts the pass.
    /// Entries on an unmounted base are skipped, and per-entry filesystem
    /// errors are logged and counted.
    pub async fn link_manifest(
        &self,
        manifest: &Path,
        index: &Arc<MountIndex>,
        destination: &Path,
    ) -> Result<LinkReport> {
        let counters = Arc::new(LinkCounters::default());

        {
            let counters = Arc::clone(&counters);
            let index = Arc::clone(index);
            let destination = destination.to_path_buf();
            self.run_pool(manifest, move |entry| {
                link_entry(
                    entry,
                    Arc::clone(&index),
                    destination.clone(),
                    Arc::clone(&counters),
                )
            })
            .await?;
        }

        let report = counters.report();
        info!(
            "Linked {} file(s) into {} ({} skipped, {} failed)",
            report.linked,
            destination.display(),
            report.skipped,
            report.failed
        );
        Ok(report)
    }

    /// Feed `manifest` through `parallelism` workers running `handle`.
    ///
    /// The first worker error stops the other workers at their next entry
    /// and is returned after all of them exit.
    async fn run_pool<F, Fut>(&self, manifest: &Path, handle: F) -> Result<()>
    where
        F: Fn(ManifestEntry) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (rx, reader) = spawn_manifest_reader(manifest.to_path_buf(), self.queue_depth);
        let rx = Arc::new(Mutex::new(rx));
        let aborted = Arc::new(AtomicBool::new(false));

        let workers: Vec<_> = (0..self.parallelism)
            .map(|_| {
                let rx = Arc::clone(&rx);
                let aborted = Arc::clone(&aborted);
                let handle = handle.clone();
                tokio::spawn(async move {
                    loop {
                        if aborted.load(Ordering::Relaxed) {
                            return Ok(());
                        }
                        let next = rx.lock().await.recv().await;
                        let Some(entry) = next else {
                            return Ok(());
                        };
                        if let Err(e) = handle(entry).await {
                            aborted.store(true, Ordering::Relaxed);
                            return Err(e);
                        }
                    }
                })
            })
            .collect();

        let mut first_error = None;
        for joined in join_all(workers).await {
            let outcome = joined.map_err(|e| Error::Io(std::io::Error::other(e)))?;
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }
        // Closing the queue lets a reader blocked on a full queue finish.
        rx.lock().await.close();

        let read = reader
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        if let Some(e) = first_error {
            return Err(e);
        }
        let count = read?;
        debug!("Processed {count} manifest entries from {}", manifest.display());
        Ok(())
    }
}

async fn link_entry(
    entry: ManifestEntry,
    index: Arc<MountIndex>,
    destination: PathBuf,
    counters: Arc<LinkCounters>,
) -> Result<()> {
    let descriptor = StorageDescriptor::parse(&entry.storage_path)?;
    let mount_base = descriptor.mount_base();
    let mount = index.lookup(&mount_base).ok_or_else(|| Error::UnresolvedMount {
        mount_base: mount_base.clone(),
        storage_path: entry.storage_path.clone(),
    })?;

    if mount.local_folder.is_none() {
        counters.skipped.fetch_add(1, Ordering::Relaxed);
        return Ok(());
    }

    let Some(source) = mount.source_for(&entry.storage_path) else {
        warn!(
            "{} is outside mount prefix {}, not linking",
            entry.storage_path,
            mount.mount_prefix()
        );
        counters.failed.fetch_add(1, Ordering::Relaxed);
        return Ok(());
    };

    let relative = Path::new(entry.relative_path.trim_start_matches('/'));
    if relative.components().any(|c| matches!(c, Component::ParentDir)) {
        warn!(
            "{} escapes {}, not linking",
            entry.relative_path,
            destination.display()
        );
        counters.failed.fetch_add(1, Ordering::Relaxed);
        return Ok(());
    }
    let target = destination.join(relative);
    if let Some(parent) = target.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!("Failed to create {}: {e}", parent.display());
            counters.failed.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
    }

    match tokio::fs::symlink(&source, &target).await {
        Ok(()) => {
            counters.linked.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            warn!(
                "Failed to link {} -> {}: {e}",
                target.display(),
                source.display()
            );
            counters.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &Path, entries: &[(&str, &str)]) -> PathBuf {
        let json: Vec<serde_json::Value> = entries
            .iter()
            .map(|(rel, storage)| {
                serde_json::json!({ "relative_path": rel, "storage_path": storage })
            })
            .collect();
        let path = dir.join("manifest.json");
        std::fs::write(&path, serde_json::to_vec(&json).unwrap()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_resolve_groups_by_mount_base() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_manifest(
            dir.path(),
            &[
                ("a", "s3://data/set/one/a"),
                ("b", "s3://data/set/two/b"),
                ("c", "gs://other/c"),
            ],
        );

        let index = ManifestLinker::new(3)
            .resolve_locations(&manifest, None)
            .await
            .unwrap();
        assert_eq!(index.mount_bases(), vec!["gs://other", "s3://data"]);
        assert_eq!(
            index.lookup("s3://data").unwrap().uri_prefix,
            "s3://data/set/"
        );
    }

    #[tokio::test]
    async fn test_resolve_records_hash_root_once() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_manifest(
            dir.path(),
            &[
                ("a", "s3://hashes/objects/aa/11"),
                ("b", "s3://hashes/objects/bb/22"),
                ("c", "s3://data/c"),
            ],
        );

        let index = ManifestLinker::new(2)
            .resolve_locations(&manifest, Some("s3://hashes/objects/"))
            .await
            .unwrap();
        assert_eq!(index.mount_bases(), vec!["s3://data", "s3://hashes"]);
        assert_eq!(
            index.lookup("s3://hashes").unwrap().uri_prefix,
            "s3://hashes/objects/"
        );
    }

    #[tokio::test]
    async fn test_unused_hash_root_is_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_manifest(dir.path(), &[("c", "s3://data/c")]);

        let index = ManifestLinker::new(2)
            .resolve_locations(&manifest, Some("s3://hashes/objects/"))
            .await
            .unwrap();
        assert_eq!(index.mount_bases(), vec!["s3://data"]);
    }

    #[tokio::test]
    async fn test_resolve_rejects_bad_uri() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_manifest(dir.path(), &[("a", "ftp://nope/a")]);

        let err = ManifestLinker::new(2)
            .resolve_locations(&manifest, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidUri { .. }));
    }

    #[tokio::test]
    async fn test_link_skips_unmounted_and_fails_on_unknown_base() {
        let dir = tempfile::tempdir().unwrap();
        let mounted = dir.path().join("mnt");
        std::fs::create_dir_all(&mounted).unwrap();
        let dest = dir.path().join("task");

        let index = Arc::new(MountIndex::new());
        index.record("s3://data/set/a").unwrap();
        index.record("s3://data/set/sub/b").unwrap();
        index.record("gs://cold/x").unwrap();
        index.set_local_folder("s3://data", mounted.clone());

        let manifest = write_manifest(
            dir.path(),
            &[
                ("inputs/a", "s3://data/set/a"),
                ("inputs/deep/b", "s3://data/set/sub/b"),
                ("cold/x", "gs://cold/x"),
            ],
        );
        let report = ManifestLinker::new(2)
            .link_manifest(&manifest, &index, &dest)
            .await
            .unwrap();
        assert_eq!(
            report,
            LinkReport {
                linked: 2,
                skipped: 1,
                failed: 0
            }
        );
        assert_eq!(
            std::fs::read_link(dest.join("inputs/deep/b")).unwrap(),
            mounted.join("sub/b")
        );

        let unknown = write_manifest(dir.path(), &[("z", "s3://elsewhere/z")]);
        let err = ManifestLinker::new(2)
            .link_manifest(&unknown, &index, &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnresolvedMount { .. }));
    }

    #[tokio::test]
    async fn test_link_entry_error_does_not_abort() {
        let dir = tempfile::tempdir().unwrap();
        let mounted = dir.path().join("mnt");
        std::fs::create_dir_all(&mounted).unwrap();
        let dest = dir.path().join("task");
        // A regular file where a parent directory is needed.
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("blocked"), b"x").unwrap();

        let index = Arc::new(MountIndex::new());
        index.record("s3://data/a").unwrap();
        index.record("s3://data/b").unwrap();
        index.set_local_folder("s3://data", mounted);

        let manifest = write_manifest(
            dir.path(),
            &[("blocked/a", "s3://data/a"), ("ok/b", "s3://data/b")],
        );
        let report = ManifestLinker::new(1)
            .link_manifest(&manifest, &index, &dest)
            .await
            .unwrap();
        assert_eq!(report.linked, 1);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_link_rejects_parent_components() {
        let dir = tempfile::tempdir().unwrap();
        let mounted = dir.path().join("mnt");
        std::fs::create_dir_all(&mounted).unwrap();
        let dest = dir.path().join("task");

        let index = Arc::new(MountIndex::new());
        index.record("s3://data/set/a").unwrap();
        index.record("s3://data/set/b").unwrap();
        index.set_local_folder("s3://data", mounted);

        let manifest = write_manifest(
            dir.path(),
            &[("../escaped", "s3://data/set/a"), ("ok/b", "s3://data/set/b")],
        );
        let report = ManifestLinker::new(2)
            .link_manifest(&manifest, &index, &dest)
            .await
            .unwrap();
        assert_eq!(
            report,
            LinkReport {
                linked: 1,
                skipped: 0,
                failed: 1
            }
        );
        assert!(std::fs::symlink_metadata(dir.path().join("escaped")).is_err());
        assert!(std::fs::symlink_metadata(dest.join("ok/b")).is_ok());
    }
}
