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

//! Retrying execution of external commands.
//!
//! Two retry levels are layered here. The inner level is patient: while
//! the service is unreachable (exit code 10) or throttling us (exit code
//! 75) the runner waits and tries again forever, and none of those waits
//! touch the outer budget. The outer level is bounded: any other non-zero
//! exit, or an idle timeout on a streaming command, consumes one of
//! [`RetryPolicy::max_retries`] attempts. Spending all of them is fatal
//! for the calling operation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::command::{exec_buffered, terminate, CommandSpec};
use super::health::ConnectionHealth;
use crate::common::config::{AgentConfig, EnvConfig};
use crate::common::OutputSink;
use crate::error::{Error, Result};

/// Lines buffered between the pipe readers and the sink.
const LINE_CHANNEL_CAPACITY: usize = 256;

/// Outer retry budget and timing knobs.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts that may fail for real before the operation is fatal.
    pub max_retries: u32,
    /// Longest a streaming command may stay silent.
    pub idle_timeout: Duration,
    /// One unit of rate-limit backoff (one second in production).
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: AgentConfig::MAX_RETRIES,
            idle_timeout: Duration::from_secs(AgentConfig::IDLE_TIMEOUT_SECS),
            backoff_unit: Duration::from_millis(AgentConfig::BACKOFF_UNIT_MS),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_backoff_unit(mut self, backoff_unit: Duration) -> Self {
        self.backoff_unit = backoff_unit;
        self
    }
}

/// What happened across all attempts of one successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Attempts charged to the outer budget.
    pub failed_attempts: u32,
    /// Rate-limited exits (not charged).
    pub rate_limited: u32,
    /// Service-unreachable exits (not charged).
    pub service_waits: u32,
    /// Idle timeouts (charged).
    pub timeouts: u32,
    /// Whether the retry variant was ever used.
    pub used_retry_variant: bool,
}

/// Output of a successful buffered run.
#[derive(Debug, Clone)]
pub struct BufferedRun {
    pub stdout: String,
    pub report: RunReport,
}

/// Which command line the next attempt runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandState {
    Normal,
    RetryingWithVariant,
}

/// Result of a single attempt.
#[derive(Debug)]
enum Attempt<T> {
    Succeeded(T),
    Exited(Option<i32>),
    TimedOut,
}

/// Executes external commands under the shared two-level retry policy.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    health: Arc<ConnectionHealth>,
    policy: RetryPolicy,
}

impl ProcessRunner {
    pub fn new(health: Arc<ConnectionHealth>, policy: RetryPolicy) -> Self {
        Self { health, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn health(&self) -> &Arc<ConnectionHealth> {
        &self.health
    }

    /// Run `command`, forwarding every output line to `sink` as it arrives.
    ///
    /// A silent command is killed after the idle timeout. After a timeout,
    /// later attempts run `retry_variant` when one is given (for example the
    /// same transfer with `--resume`).
    pub async fn run_streaming(
        &self,
        command: &CommandSpec,
        retry_variant: Option<&CommandSpec>,
        sink: &dyn OutputSink,
        failure_exit_code: i32,
    ) -> Result<RunReport> {
        let idle_timeout = self.policy.idle_timeout;
        let (_, report) = self
            .retry_loop(
                command,
                retry_variant.is_some(),
                sink,
                failure_exit_code,
                move |state| {
                    let spec = match (state, retry_variant) {
                        (CommandState::RetryingWithVariant, Some(variant)) => variant,
                        _ => command,
                    };
                    stream_once(spec, sink, idle_timeout)
                },
            )
            .await?;
        Ok(report)
    }

    /// Run `command`, buffering its output, and return stdout on success.
    pub async fn run_buffered(
        &self,
        command: &CommandSpec,
        sink: &dyn OutputSink,
        failure_exit_code: i32,
    ) -> Result<BufferedRun> {
        let (stdout, report) = self
            .retry_loop(command, false, sink, failure_exit_code, move |_| async move {
                let output = exec_buffered(command).await?;
                if output.success() {
                    return Ok(Attempt::Succeeded(output.stdout));
                }
                for line in output.stderr.lines().filter(|l| !l.trim().is_empty()) {
                    sink.write_line(line);
                }
                Ok(Attempt::Exited(Some(output.status)))
            })
            .await?;
        Ok(BufferedRun { stdout, report })
    }

    async fn retry_loop<T, F, Fut>(
        &self,
        command: &CommandSpec,
        has_variant: bool,
        sink: &dyn OutputSink,
        failure_exit_code: i32,
        mut attempt: F,
    ) -> Result<(T, RunReport)>
    where
        F: FnMut(CommandState) -> Fut,
        Fut: Future<Output = Result<Attempt<T>>>,
    {
        let label = command.display();
        let mut report = RunReport::default();
        let mut state = CommandState::Normal;
        let mut backoff_count: u32 = 0;
        let mut announced_wait = false;

        loop {
            self.health.wait_until_healthy().await?;

            debug!("Running '{label}' ({state:?})");
            match attempt(state).await? {
                Attempt::Succeeded(value) => return Ok((value, report)),
                Attempt::Exited(Some(AgentConfig::EXIT_SERVICE_UNREACHABLE)) => {
                    report.service_waits += 1;
                    if !announced_wait {
                        sink.write_line("Service unreachable, waiting for it to come back...");
                        announced_wait = true;
                    }
                    tokio::time::sleep(self.health.poll_interval()).await;
                    continue;
                }
                Attempt::Exited(Some(AgentConfig::EXIT_RATE_LIMITED)) => {
                    let units =
                        EnvConfig::rate_limit_backoff_units(backoff_count, rand::random::<f64>());
                    let delay = self.policy.backoff_unit.mul_f64(units);
                    if backoff_count % AgentConfig::RATE_LIMIT_NOTICE_EVERY == 0 {
                        sink.write_line(&format!(
                            "Rate limited, backing off for {:.1}s (occurrence {})",
                            delay.as_secs_f64(),
                            backoff_count + 1
                        ));
                    }
                    backoff_count += 1;
                    report.rate_limited += 1;
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Attempt::Exited(code) => {
                    report.failed_attempts += 1;
                    let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                    sink.write_line(&format!(
                        "'{label}' exited with {code} (attempt {}/{})",
                        report.failed_attempts, self.policy.max_retries
                    ));
                }
                Attempt::TimedOut => {
                    report.failed_attempts += 1;
                    report.timeouts += 1;
                    sink.write_line(&format!(
                        "'{label}' timed out after {:?} without output (attempt {}/{})",
                        self.policy.idle_timeout, report.failed_attempts, self.policy.max_retries
                    ));
                    if has_variant {
                        state = CommandState::RetryingWithVariant;
                        report.used_retry_variant = true;
                    }
                }
            }

            if report.failed_attempts >= self.policy.max_retries {
                let message = format!(
                    "'{label}' failed after {} retries",
                    self.policy.max_retries
                );
                warn!("{message}");
                sink.write_line(&message);
                return Err(Error::RetriesExhausted {
                    command: label,
                    attempts: self.policy.max_retries,
                    exit_code: failure_exit_code,
                });
            }
        }
    }
}

/// Read errors tolerated in a row before a pipe reader gives up.
const MAX_READ_ERRORS: u32 = 3;

/// Forward lines from one pipe into the shared channel until it closes.
///
/// Lines are decoded lossily so a stray non-UTF-8 file name cannot stop the
/// reader and leave the child writing into a closed pipe.
fn spawn_line_reader<R>(reader: R, tx: mpsc::Sender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut errors = 0;
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    errors = 0;
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    errors += 1;
                    warn!("Error reading child output: {e}");
                    if errors >= MAX_READ_ERRORS {
                        break;
                    }
                }
            }
        }
    })
}

/// One streaming attempt with the idle-timeout watchdog.
async fn stream_once(
    spec: &CommandSpec,
    sink: &dyn OutputSink,
    idle_timeout: Duration,
) -> Result<Attempt<()>> {
    let mut child = spec.to_command().spawn()?;
    let stdout = child.stdout.take().ok_or(Error::MissingPipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(Error::MissingPipe("stderr"))?;

    let (tx, mut rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    let readers = [
        spawn_line_reader(stdout, tx.clone()),
        spawn_line_reader(stderr, tx),
    ];

    loop {
        match tokio::time::timeout(idle_timeout, rx.recv()).await {
            Ok(Some(line)) => sink.write_line(&line),
            // Both pipes closed
            Ok(None) => break,
            Err(_) => {
                terminate(&mut child).await;
                for reader in readers {
                    reader.abort();
                }
                return Ok(Attempt::TimedOut);
            }
        }
    }

    let status = child.wait().await?;
    if status.success() {
        Ok(Attempt::Succeeded(()))
    } else {
        Ok(Attempt::Exited(status.code()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::MemorySink;

    fn fast_runner(max_retries: u32) -> ProcessRunner {
        ProcessRunner::new(
            Arc::new(ConnectionHealth::new(Duration::from_millis(10))),
            RetryPolicy::default()
                .with_max_retries(max_retries)
                .with_idle_timeout(Duration::from_secs(5))
                .with_backoff_unit(Duration::from_millis(1)),
        )
    }

    /// `sh -c` script that bumps a counter file and exits per attempt.
    fn counting_script(counter: &std::path::Path, body: &str) -> CommandSpec {
        let script = format!(
            "n=$(cat \"$1\" 2>/dev/null || echo 0); n=$((n+1)); echo $n > \"$1\"; {body}"
        );
        CommandSpec::new("sh")
            .arg("-c")
            .arg(script)
            .arg("sh")
            .arg(counter.display().to_string())
    }

    #[tokio::test]
    async fn test_streaming_forwards_lines() {
        let sink = MemorySink::new();
        let spec = CommandSpec::new("sh").args(["-c", "echo one; echo two >&2; echo three"]);
        let report = fast_runner(3).run_streaming(&spec, None, &sink, 9).await.unwrap();
        assert_eq!(report, RunReport::default());
        let lines = sink.lines();
        for expected in ["one", "two", "three"] {
            assert!(lines.iter().any(|l| l == expected), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn test_streaming_survives_non_utf8_output() {
        let sink = MemorySink::new();
        let spec = CommandSpec::new("sh").args([
            "-c",
            "printf 'bad \\377 name\\n'; echo after-bad; i=0; \
             while [ $i -lt 5000 ]; do echo line-$i; i=$((i+1)); done; echo done",
        ]);
        let report = fast_runner(2).run_streaming(&spec, None, &sink, 9).await.unwrap();
        assert_eq!(report.failed_attempts, 0);
        let lines = sink.lines();
        assert!(lines.iter().any(|l| l.starts_with("bad ") && l.ends_with(" name")));
        assert!(lines.iter().any(|l| l == "after-bad"));
        assert!(lines.iter().any(|l| l == "line-4999"));
        assert_eq!(lines.last().map(String::as_str), Some("done"));
    }

    #[tokio::test]
    async fn test_buffered_returns_stdout() {
        let sink = MemorySink::new();
        let spec = CommandSpec::new("sh").args(["-c", "echo payload"]);
        let run = fast_runner(3).run_buffered(&spec, &sink, 9).await.unwrap();
        assert_eq!(run.stdout.trim(), "payload");
        assert_eq!(run.report.failed_attempts, 0);
    }

    #[tokio::test]
    async fn test_rate_limit_does_not_consume_budget() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        let spec = counting_script(&counter, "if [ $n -le 2 ]; then exit 75; fi; echo ok");
        let sink = MemorySink::new();

        let run = fast_runner(1).run_buffered(&spec, &sink, 9).await.unwrap();
        assert_eq!(run.stdout.trim(), "ok");
        assert_eq!(run.report.rate_limited, 2);
        assert_eq!(run.report.failed_attempts, 0);
        // first occurrence only; the second is throttled
        assert_eq!(sink.count_containing("Rate limited"), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_notice_repeats_every_fifth_occurrence() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        let spec = counting_script(&counter, "if [ $n -le 6 ]; then exit 75; fi; echo ok");
        let sink = MemorySink::new();

        let run = fast_runner(1).run_buffered(&spec, &sink, 9).await.unwrap();
        assert_eq!(run.report.rate_limited, 6);
        // occurrences 1 and 6
        assert_eq!(sink.count_containing("Rate limited"), 2);
        assert_eq!(sink.count_containing("(occurrence 6)"), 1);
    }

    #[tokio::test]
    async fn test_waits_for_healthy_connection_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        let spec = counting_script(&counter, "echo ran");
        let runner = fast_runner(1);
        runner.health().mark_disconnected();

        let health = Arc::clone(runner.health());
        let probe_counter = counter.clone();
        let reconnect = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let spawned_early = probe_counter.exists();
            health.mark_connected();
            spawned_early
        });

        let sink = MemorySink::new();
        let report = runner.run_streaming(&spec, None, &sink, 9).await.unwrap();
        assert!(!reconnect.await.unwrap(), "command ran while disconnected");
        assert_eq!(report.failed_attempts, 0);
        assert_eq!(std::fs::read_to_string(&counter).unwrap().trim(), "1");
        assert!(sink.lines().iter().any(|l| l == "ran"));
    }

    #[tokio::test]
    async fn test_service_unreachable_waits_without_budget() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        let spec = counting_script(&counter, "if [ $n -le 3 ]; then exit 10; fi; echo back");
        let sink = MemorySink::new();

        let report = fast_runner(1)
            .run_streaming(&spec, None, &sink, 9)
            .await
            .unwrap();
        assert_eq!(report.service_waits, 3);
        assert_eq!(report.failed_attempts, 0);
        assert_eq!(sink.count_containing("Service unreachable"), 1);
        assert!(sink.lines().iter().any(|l| l == "back"));
    }

    #[tokio::test]
    async fn test_exhausted_budget_is_fatal() {
        let sink = MemorySink::new();
        let spec = CommandSpec::new("sh").args(["-c", "exit 3"]);
        let err = fast_runner(2)
            .run_buffered(&spec, &sink, 42)
            .await
            .unwrap_err();
        match err {
            Error::RetriesExhausted {
                attempts,
                exit_code,
                ..
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(exit_code, 42);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(sink.count_containing("failed after 2 retries"), 1);
    }

    #[tokio::test]
    async fn test_timeout_switches_to_retry_variant() {
        let runner = ProcessRunner::new(
            Arc::new(ConnectionHealth::new(Duration::from_millis(10))),
            RetryPolicy::default()
                .with_max_retries(3)
                .with_idle_timeout(Duration::from_millis(200)),
        );
        let sink = MemorySink::new();
        let stalled = CommandSpec::new("sh").args(["-c", "sleep 30"]);
        let resume = CommandSpec::new("sh").args(["-c", "echo resumed"]);

        let started = std::time::Instant::now();
        let report = runner
            .run_streaming(&stalled, Some(&resume), &sink, 9)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(report.timeouts, 1);
        assert_eq!(report.failed_attempts, 1);
        assert!(report.used_retry_variant);
        assert!(sink.lines().iter().any(|l| l == "resumed"));
    }

    #[tokio::test]
    async fn test_plain_failure_keeps_original_command() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        let spec = counting_script(&counter, "if [ $n -le 1 ]; then exit 1; fi; echo original");
        let variant = CommandSpec::new("sh").args(["-c", "echo variant"]);
        let sink = MemorySink::new();

        let report = fast_runner(3)
            .run_streaming(&spec, Some(&variant), &sink, 9)
            .await
            .unwrap();
        assert_eq!(report.failed_attempts, 1);
        assert!(!report.used_retry_variant);
        assert!(sink.lines().iter().any(|l| l == "original"));
    }
}
