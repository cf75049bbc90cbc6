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

use std::cell::Cell;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::de::{Deserializer, SeqAccess, Visitor};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// One manifest element: where a file appears in the task tree, and the
/// storage object backing it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ManifestEntry {
    pub relative_path: String,
    pub storage_path: String,
}

/// Pushes each decoded array element into the work queue.
struct EntryForwarder<'a> {
    tx: &'a mpsc::Sender<ManifestEntry>,
    forwarded: &'a Cell<usize>,
}

impl<'de> Visitor<'de> for EntryForwarder<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON array of manifest entries")
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<(), A::Error>
    where
        A: SeqAccess<'de>,
    {
        while let Some(entry) = seq.next_element::<ManifestEntry>()? {
            // Blocks while the queue is full; fails once every worker is gone.
            if self.tx.blocking_send(entry).is_err() {
                return Ok(());
            }
            self.forwarded.set(self.forwarded.get() + 1);
        }
        Ok(())
    }
}

/// Decode `path` one element at a time into `tx`. Returns the number of
/// entries handed to the queue.
///
/// Must run on a blocking thread.
pub fn stream_manifest(path: &Path, tx: mpsc::Sender<ManifestEntry>) -> Result<usize> {
    let manifest_error = |message: String| Error::Manifest {
        path: path.to_path_buf(),
        message,
    };

    let file = File::open(path).map_err(|e| manifest_error(e.to_string()))?;
    let mut deserializer = serde_json::Deserializer::from_reader(BufReader::new(file));
    let forwarded = Cell::new(0);

    let outcome = (&mut deserializer)
        .deserialize_seq(EntryForwarder {
            tx: &tx,
            forwarded: &forwarded,
        })
        .and_then(|()| deserializer.end());

    match outcome {
        Ok(()) => Ok(forwarded.get()),
        // The consumers stopped early; the rest of the array is moot.
        Err(_) if tx.is_closed() => Ok(forwarded.get()),
        Err(e) => Err(manifest_error(e.to_string())),
    }
}

/// Start a blocking reader feeding a queue of `queue_depth` entries.
pub fn spawn_manifest_reader(
    path: PathBuf,
    queue_depth: usize,
) -> (mpsc::Receiver<ManifestEntry>, JoinHandle<Result<usize>>) {
    let (tx, rx) = mpsc::channel(queue_depth.max(1));
    let handle = tokio::task::spawn_blocking(move || stream_manifest(&path, tx));
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(contents: &str) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), contents).unwrap();
        file
    }

    #[tokio::test]
    async fn test_streams_all_entries() {
        let file = write_manifest(
            r#"[
                {"relative_path": "a.txt", "storage_path": "s3://b/a.txt"},
                {"relative_path": "d/b.txt", "storage_path": "s3://b/d/b.txt", "size": 12}
            ]"#,
        );
        let (mut rx, handle) = spawn_manifest_reader(file.path().to_path_buf(), 1);

        let mut entries = Vec::new();
        while let Some(entry) = rx.recv().await {
            entries.push(entry);
        }
        assert_eq!(handle.await.unwrap().unwrap(), 2);
        assert_eq!(
            entries[1],
            ManifestEntry {
                relative_path: "d/b.txt".to_string(),
                storage_path: "s3://b/d/b.txt".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_empty_array() {
        let file = write_manifest("[]");
        let (mut rx, handle) = spawn_manifest_reader(file.path().to_path_buf(), 4);
        assert!(rx.recv().await.is_none());
        assert_eq!(handle.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_manifest() {
        for contents in [
            r#"{"relative_path": "a"}"#,
            r#"[{"relative_path": "a"}]"#,
            r#"[{"relative_path": "a", "storage_path": "s3://b/a"}"#,
            r#"[] trailing"#,
        ] {
            let file = write_manifest(contents);
            let (mut rx, handle) = spawn_manifest_reader(file.path().to_path_buf(), 4);
            while rx.recv().await.is_some() {}
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, Error::Manifest { .. }), "{contents}");
        }
    }

    #[tokio::test]
    async fn test_missing_file() {
        let (_rx, handle) = spawn_manifest_reader(PathBuf::from("/nonexistent/manifest.json"), 4);
        assert!(matches!(
            handle.await.unwrap(),
            Err(Error::Manifest { .. })
        ));
    }

    #[tokio::test]
    async fn test_reader_stops_when_consumer_leaves() {
        let entries: Vec<String> = (0..100)
            .map(|i| format!(r#"{{"relative_path": "f{i}", "storage_path": "s3://b/f{i}"}}"#))
            .collect();
        let file = write_manifest(&format!("[{}]", entries.join(",")));
        let (mut rx, handle) = spawn_manifest_reader(file.path().to_path_buf(), 2);

        assert!(rx.recv().await.is_some());
        drop(rx);
        let forwarded = handle.await.unwrap().unwrap();
        assert!(forwarded < 100);
    }
}
