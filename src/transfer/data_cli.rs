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

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::common::config::{AgentConfig, EnvConfig};
use crate::common::OutputSink;
use crate::error::Result;
use crate::process::{CommandSpec, ProcessRunner, RunReport};
use crate::storage::StorageDescriptor;

/// Direction of a data-movement call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Download,
    Upload,
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::Download => "download",
            TransferKind::Upload => "upload",
        }
    }

    /// Exit status once the retry budget is spent.
    pub fn failure_exit_code(&self) -> i32 {
        match self {
            TransferKind::Download => AgentConfig::EXIT_DOWNLOAD_FAILED,
            TransferKind::Upload => AgentConfig::EXIT_UPLOAD_FAILED,
        }
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Moves a directory tree to or from object storage.
#[async_trait]
pub trait Transfer: Send + Sync {
    async fn download(&self, uri: &str, path: &Path, regex: Option<&str>) -> Result<RunReport>;

    async fn upload(&self, path: &Path, uri: &str, regex: Option<&str>) -> Result<RunReport>;
}

/// Front-end for the external data-movement CLI.
///
/// Every call goes through the streaming retry form of [`ProcessRunner`];
/// retries after an idle timeout add `--resume`.
#[derive(Clone)]
pub struct DataCli {
    command: CommandSpec,
    processes: usize,
    benchmark_dir: Option<PathBuf>,
    runner: ProcessRunner,
    sink: Arc<dyn OutputSink>,
}

impl DataCli {
    pub fn new(runner: ProcessRunner, sink: Arc<dyn OutputSink>) -> Self {
        Self {
            command: CommandSpec::new(AgentConfig::DATA_CLI_BINARY),
            processes: EnvConfig::default_parallelism(),
            benchmark_dir: None,
            runner,
            sink,
        }
    }

    pub fn with_command(mut self, command: CommandSpec) -> Self {
        self.command = command;
        self
    }

    pub fn with_processes(mut self, processes: usize) -> Self {
        self.processes = processes.max(1);
        self
    }

    pub fn with_benchmark_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.benchmark_dir = Some(dir.into());
        self
    }

    pub fn processes(&self) -> usize {
        self.processes
    }

    /// Where the artifact for a `kind` call started at `epoch_millis` goes.
    pub fn benchmark_path(&self, kind: TransferKind, epoch_millis: i64) -> Option<PathBuf> {
        self.benchmark_dir
            .as_ref()
            .map(|dir| dir.join(format!("{kind}_{epoch_millis}_benchmark.json")))
    }

    /// Arguments following the CLI binary.
    pub fn transfer_args(
        &self,
        kind: TransferKind,
        uri: &str,
        path: &Path,
        benchmark_out: Option<&Path>,
        regex: Option<&str>,
    ) -> Vec<String> {
        let mut args = vec![
            "data".to_string(),
            kind.as_str().to_string(),
            uri.to_string(),
            path.display().to_string(),
            "--processes".to_string(),
            self.processes.to_string(),
        ];
        if let Some(out) = benchmark_out {
            args.push("--benchmark-out".to_string());
            args.push(out.display().to_string());
        }
        if let Some(pattern) = regex.filter(|p| !p.is_empty()) {
            args.push("--regex".to_string());
            args.push(pattern.to_string());
        }
        args
    }

    async fn run(
        &self,
        kind: TransferKind,
        uri: &str,
        path: &Path,
        regex: Option<&str>,
    ) -> Result<RunReport> {
        StorageDescriptor::parse(uri)?;

        let benchmark_out = self.benchmark_path(kind, Utc::now().timestamp_millis());
        if let Some(dir) = &self.benchmark_dir {
            tokio::fs::create_dir_all(dir).await?;
        }

        let spec = self.command.clone().args(self.transfer_args(
            kind,
            uri,
            path,
            benchmark_out.as_deref(),
            regex,
        ));
        let resume = spec.clone().arg("--resume");

        info!("Starting {kind} of {uri} ({})", path.display());
        let report = self
            .runner
            .run_streaming(&spec, Some(&resume), self.sink.as_ref(), kind.failure_exit_code())
            .await?;
        info!("Finished {kind} of {uri}");
        Ok(report)
    }
}

#[async_trait]
impl Transfer for DataCli {
    async fn download(&self, uri: &str, path: &Path, regex: Option<&str>) -> Result<RunReport> {
        tokio::fs::create_dir_all(path).await?;
        self.run(TransferKind::Download, uri, path, regex).await
    }

    async fn upload(&self, path: &Path, uri: &str, regex: Option<&str>) -> Result<RunReport> {
        self.run(TransferKind::Upload, uri, path, regex).await
    }
}
