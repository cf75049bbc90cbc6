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

use clap::{Args, Parser, Subcommand};

use crate::common::config::AgentConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Resolve a manifest, mount the storage it references, and link it into the task tree.
    Stage(StageArgs),
    /// Download a storage URI into a local directory.
    Download(DownloadArgs),
    /// Upload a local directory to a storage URI.
    Upload(UploadArgs),
    /// Upload a directory periodically until interrupted, then flush once more.
    Checkpoint(CheckpointArgs),
    /// Supervise a file-sync command and report its liveness over a Unix socket.
    Sync(SyncArgs),
    /// Summarize the benchmark artifacts in a directory as JSON.
    BenchmarkSummary(BenchmarkSummaryArgs),
}

/// Settings shared by every command that drives the data-movement CLI.
#[derive(Args, Clone)]
pub struct RunnerArgs {
    /// Data-movement CLI binary.
    #[arg(long, default_value = AgentConfig::DATA_CLI_BINARY)]
    pub data_cli: String,
    /// Parallel processes per transfer. Defaults to the number of CPUs.
    #[arg(long)]
    pub processes: Option<usize>,
    /// Directory receiving one benchmark artifact per transfer.
    #[arg(long)]
    pub benchmark_dir: Option<PathBuf>,
    /// Attempts before a failing command is fatal.
    #[arg(long, default_value_t = AgentConfig::MAX_RETRIES)]
    pub max_retries: u32,
    /// Seconds a transfer may stay silent before it is killed and resumed.
    #[arg(long, default_value_t = AgentConfig::IDLE_TIMEOUT_SECS)]
    pub idle_timeout: u64,
    /// Orchestration service URL probed by the connection watchdog.
    #[arg(long)]
    pub service_url: Option<String>,
    /// Give up after the service has been unreachable this many seconds.
    #[arg(long)]
    pub disconnect_timeout: Option<u64>,
}

#[derive(Parser, Clone)]
pub struct StageArgs {
    /// JSON array of {relative_path, storage_path} entries.
    #[arg(long)]
    pub manifest: PathBuf,
    /// Root of the task's input tree.
    #[arg(long)]
    pub destination: PathBuf,
    /// Directory holding one mount point per mount base.
    #[arg(long)]
    pub mount_root: PathBuf,
    /// Storage prefix of content-addressed objects.
    #[arg(long)]
    pub hash_root: Option<String>,
    /// JSON file mapping profile keys to access keys. Falls back to AWS_* variables.
    #[arg(long)]
    pub credentials: Option<PathBuf>,
    /// Local cache directory for mounts.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
    /// Mount cache size in MiB; 0 disables the cache.
    #[arg(long, default_value_t = 0)]
    pub cache_size_mib: u64,
    /// Mount client binary.
    #[arg(long, default_value = AgentConfig::MOUNT_BINARY)]
    pub mount_binary: String,
    /// Manifest workers. Defaults to the number of CPUs.
    #[arg(long)]
    pub parallelism: Option<usize>,
    /// Download a mount base when its mount comes back empty.
    #[arg(long)]
    pub download_fallback: bool,
    #[command(flatten)]
    pub runner: RunnerArgs,
}

#[derive(Parser, Clone)]
pub struct DownloadArgs {
    pub uri: String,
    pub path: PathBuf,
    /// Only transfer objects matching this pattern.
    #[arg(long)]
    pub regex: Option<String>,
    #[command(flatten)]
    pub runner: RunnerArgs,
}

#[derive(Parser, Clone)]
pub struct UploadArgs {
    pub path: PathBuf,
    pub uri: String,
    /// Only transfer files matching this pattern.
    #[arg(long)]
    pub regex: Option<String>,
    #[command(flatten)]
    pub runner: RunnerArgs,
}

#[derive(Parser, Clone)]
pub struct CheckpointArgs {
    pub path: PathBuf,
    pub uri: String,
    /// Seconds between uploads.
    #[arg(short, long, default_value_t = 60)]
    pub frequency: u64,
    /// Only upload files matching this pattern.
    #[arg(long)]
    pub regex: Option<String>,
    #[command(flatten)]
    pub runner: RunnerArgs,
}

#[derive(Parser, Clone)]
pub struct SyncArgs {
    /// Unix socket receiving one JSON liveness line per interval.
    #[arg(short, long)]
    pub socket: PathBuf,
    /// Seconds between liveness reports.
    #[arg(short, long, default_value_t = AgentConfig::SYNC_LIVENESS_INTERVAL_SECS)]
    pub interval: u64,
    /// The sync command and its arguments.
    #[arg(last = true, required = true, num_args = 1..)]
    pub command: Vec<String>,
}

#[derive(Parser, Clone)]
pub struct BenchmarkSummaryArgs {
    pub dir: PathBuf,
}
