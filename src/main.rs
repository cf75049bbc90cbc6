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
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use staging_agent::cli::{
    CheckpointArgs, Cli, Commands, DownloadArgs, RunnerArgs, StageArgs, SyncArgs, UploadArgs,
};
use staging_agent::common::config::AgentConfig;
use staging_agent::common::{OutputSink, StopSignal, TracingSink};
use staging_agent::mount::{CacheSettings, MountConfig, MountOrchestrator};
use staging_agent::process::{spawn_watchdog, CommandSpec, ConnectionHealth, TcpProbe};
use staging_agent::storage::{CredentialProvider, EnvCredentials, StaticCredentials};
use staging_agent::transfer::aggregate_benchmarks;
use staging_agent::{
    CheckpointUploader, DataCli, Error, ManifestLinker, ProcessRunner, Result, RetryPolicy,
    Stager, SyncConfig, SyncSessionSupervisor, Transfer,
};

#[tokio::main]
async fn main() {
    // Logs go to stderr; stdout carries command output.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "staging_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let stop = StopSignal::new();

    // Set up signal handler for clean shutdown
    let on_ctrl_c = stop.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            on_ctrl_c.raise();
        }
    });

    // Also handle SIGTERM on Unix systems
    #[cfg(unix)]
    {
        let on_sigterm = stop.clone();
        tokio::spawn(async move {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    on_sigterm.raise();
                }
                Err(e) => warn!("Failed to listen for SIGTERM: {e}"),
            }
        });
    }

    let code = match run(cli.command, stop).await {
        Ok(()) => 0,
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(command: Commands, stop: StopSignal) -> Result<()> {
    match command {
        Commands::Stage(args) => until_stopped(stage(args, stop.clone()), &stop).await,
        Commands::Download(args) => until_stopped(download(args, stop.clone()), &stop).await,
        Commands::Upload(args) => until_stopped(upload(args, stop.clone()), &stop).await,
        Commands::Checkpoint(args) => checkpoint(args, stop).await,
        Commands::Sync(args) => sync(args, stop).await,
        Commands::BenchmarkSummary(args) => {
            let summary = aggregate_benchmarks(&args.dir)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
    }
}

/// Drop `operation` (and kill its children) once a stop signal arrives.
async fn until_stopped<T>(
    operation: impl Future<Output = Result<T>>,
    stop: &StopSignal,
) -> Result<T> {
    tokio::select! {
        result = operation => result,
        _ = stop.wait() => Err(Error::Interrupted),
    }
}

fn build_runner(args: &RunnerArgs, stop: &StopSignal) -> Result<ProcessRunner> {
    let mut health = ConnectionHealth::new(Duration::from_secs(
        AgentConfig::HEALTH_POLL_INTERVAL_SECS,
    ));
    if let Some(secs) = args.disconnect_timeout {
        health = health.with_disconnect_timeout(Duration::from_secs(secs));
    }
    let health = Arc::new(health);

    if let Some(url) = &args.service_url {
        let probe = TcpProbe::from_url(url)?;
        info!("Watching service reachability at {}", probe.address());
        spawn_watchdog(
            Arc::clone(&health),
            Arc::new(probe),
            Duration::from_secs(AgentConfig::WATCHDOG_PROBE_INTERVAL_SECS),
            stop.clone(),
        );
    }

    let policy = RetryPolicy::default()
        .with_max_retries(args.max_retries)
        .with_idle_timeout(Duration::from_secs(args.idle_timeout));
    Ok(ProcessRunner::new(health, policy))
}

fn build_data_cli(args: &RunnerArgs, stop: &StopSignal) -> Result<DataCli> {
    let mut cli = DataCli::new(build_runner(args, stop)?, Arc::new(TracingSink))
        .with_command(CommandSpec::new(&args.data_cli));
    if let Some(processes) = args.processes {
        cli = cli.with_processes(processes);
    }
    if let Some(dir) = &args.benchmark_dir {
        cli = cli.with_benchmark_dir(dir);
    }
    Ok(cli)
}

async fn stage(args: StageArgs, stop: StopSignal) -> Result<()> {
    let sink: Arc<dyn OutputSink> = Arc::new(TracingSink);
    let credentials: Arc<dyn CredentialProvider> = match &args.credentials {
        Some(path) => Arc::new(StaticCredentials::from_json_file(path)?),
        None => Arc::new(EnvCredentials),
    };
    let linker = args
        .parallelism
        .map_or_else(ManifestLinker::default, ManifestLinker::new);
    let orchestrator = MountOrchestrator::new(
        MountConfig::default().with_mount_command(CommandSpec::new(&args.mount_binary)),
        Arc::clone(&sink),
    );
    let cache = match &args.cache_dir {
        Some(dir) => CacheSettings::new(dir, args.cache_size_mib),
        None => CacheSettings::default(),
    };

    let mut stager =
        Stager::new(linker, orchestrator, credentials, Arc::clone(&sink)).with_cache(cache);
    if args.download_fallback {
        stager = stager.with_download_fallback(Arc::new(build_data_cli(&args.runner, &stop)?));
    }

    let report = stager
        .stage_manifest(
            &args.manifest,
            args.hash_root.as_deref(),
            &args.destination,
            &args.mount_root,
        )
        .await?;
    info!(
        "Linked {} file(s); {} skipped, {} failed",
        report.link.linked, report.link.skipped, report.link.failed
    );
    Ok(())
}

async fn download(args: DownloadArgs, stop: StopSignal) -> Result<()> {
    let cli = build_data_cli(&args.runner, &stop)?;
    cli.download(&args.uri, &args.path, args.regex.as_deref())
        .await
        .map(|_| ())
}

async fn upload(args: UploadArgs, stop: StopSignal) -> Result<()> {
    let cli = build_data_cli(&args.runner, &stop)?;
    cli.upload(&args.path, &args.uri, args.regex.as_deref())
        .await
        .map(|_| ())
}

async fn checkpoint(args: CheckpointArgs, stop: StopSignal) -> Result<()> {
    let cli = build_data_cli(&args.runner, &stop)?;
    let mut uploader = CheckpointUploader::new(
        Arc::new(cli),
        args.path,
        args.uri,
        Duration::from_secs(args.frequency),
    );
    if let Some(regex) = args.regex {
        uploader = uploader.with_regex(regex);
    }
    let uploads = uploader.run(&stop).await?;
    info!("Checkpointing finished after {uploads} upload(s)");
    Ok(())
}

async fn sync(args: SyncArgs, stop: StopSignal) -> Result<()> {
    let Some((program, rest)) = args.command.split_first() else {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "missing sync command",
        )));
    };
    let supervisor = SyncSessionSupervisor::new(
        SyncConfig::new(CommandSpec::new(program).args(rest))
            .with_liveness_interval(Duration::from_secs(args.interval)),
    );

    let (tx, mut rx) = mpsc::channel::<bool>(16);
    let socket = args.socket.clone();
    let reporter = tokio::spawn(async move {
        let mut stream = match UnixStream::connect(&socket).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!("Cannot connect to {}: {e}", socket.display());
                None
            }
        };
        while let Some(alive) = rx.recv().await {
            let Some(conn) = stream.as_mut() else {
                continue;
            };
            let line = format!("{}\n", serde_json::json!({ "sync_alive": alive }));
            if let Err(e) = conn.write_all(line.as_bytes()).await {
                warn!("Liveness listener disconnected: {e}");
                stream = None;
            }
        }
    });

    let result = supervisor.run(tx, &stop).await;
    let _ = reporter.await;
    result
}
