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

//! Supervision of a long-lived file-sync subprocess.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::common::config::AgentConfig;
use crate::common::StopSignal;
use crate::error::{Error, Result};
use crate::process::command::terminate;
use crate::process::CommandSpec;

/// Configuration for a supervised sync session
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub command: CommandSpec,
    pub liveness_interval: Duration,
}

impl SyncConfig {
    pub fn new(command: CommandSpec) -> Self {
        Self {
            command,
            liveness_interval: Duration::from_secs(AgentConfig::SYNC_LIVENESS_INTERVAL_SECS),
        }
    }

    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }
}

enum SessionEnd {
    Exited(ExitStatus),
    Stopped,
}

/// Runs the sync command in its own process group and reports whether it is
/// alive on every liveness tick.
pub struct SyncSessionSupervisor {
    config: SyncConfig,
}

impl SyncSessionSupervisor {
    pub fn new(config: SyncConfig) -> Self {
        Self { config }
    }

    /// Supervise until the command exits or `stop` is raised.
    ///
    /// `false` is reported once when the session ends. A listener that
    /// hangs up or stops reading does not end the session; reports it
    /// cannot take are dropped.
    pub async fn run(&self, liveness: mpsc::Sender<bool>, stop: &StopSignal) -> Result<()> {
        let mut command = self.config.command.to_command();
        // Sync output goes straight to the agent's own streams.
        command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        let mut child = command.spawn()?;
        let pid = child.id();
        info!(
            "Started sync session '{}' (pid {pid:?})",
            self.config.command.display()
        );

        let mut ticker = tokio::time::interval(self.config.liveness_interval);
        let end = loop {
            tokio::select! {
                status = child.wait() => break SessionEnd::Exited(status?),
                _ = stop.wait() => break SessionEnd::Stopped,
                _ = ticker.tick() => {
                    let alive = pid.is_some_and(process_alive);
                    match liveness.try_send(alive) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            debug!("Liveness listener is behind, dropping report")
                        }
                        Err(TrySendError::Closed(_)) => debug!("Liveness listener went away"),
                    }
                }
            }
        };

        // A stalled listener must not hold up teardown.
        if tokio::time::timeout(self.config.liveness_interval, liveness.send(false))
            .await
            .is_err()
        {
            debug!("Liveness listener stalled, final report dropped");
        }
        match end {
            SessionEnd::Stopped => {
                info!("Stopping sync session");
                terminate(&mut child).await;
                Ok(())
            }
            SessionEnd::Exited(status) if status.success() => {
                info!("Sync session finished");
                Ok(())
            }
            SessionEnd::Exited(status) => {
                warn!("Sync session exited with {status}");
                Err(Error::SyncExited {
                    code: status.code(),
                })
            }
        }
    }
}

/// Signal-0 probe: true while `pid` exists.
fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs only the existence and permission check.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(script: &str) -> SyncSessionSupervisor {
        SyncSessionSupervisor::new(
            SyncConfig::new(CommandSpec::new("sh").args(["-c", script]))
                .with_liveness_interval(Duration::from_millis(50)),
        )
    }

    #[tokio::test]
    async fn test_reports_alive_then_false_on_stop() {
        let (tx, mut rx) = mpsc::channel(64);
        let stop = StopSignal::new();
        let raiser = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            raiser.raise();
        });

        supervisor("sleep 30").run(tx, &stop).await.unwrap();

        let mut reports = Vec::new();
        while let Some(alive) = rx.recv().await {
            reports.push(alive);
        }
        assert!(reports.len() >= 3);
        assert_eq!(reports.last(), Some(&false));
        assert!(reports[..reports.len() - 1].iter().all(|alive| *alive));
    }

    #[tokio::test]
    async fn test_failed_exit_propagates() {
        let (tx, _rx) = mpsc::channel(64);
        let err = supervisor("exit 7")
            .run(tx, &StopSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SyncExited { code: Some(7) }));
    }

    #[tokio::test]
    async fn test_listener_gone_does_not_stop_session() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        supervisor("sleep 0.2")
            .run(tx, &StopSignal::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stalled_listener_does_not_block_stop() {
        let (tx, _rx) = mpsc::channel(1);
        let stop = StopSignal::new();
        let raiser = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            raiser.raise();
        });

        let sup = SyncSessionSupervisor::new(
            SyncConfig::new(CommandSpec::new("sh").args(["-c", "sleep 30"]))
                .with_liveness_interval(Duration::from_millis(20)),
        );
        let result = tokio::time::timeout(Duration::from_secs(3), sup.run(tx, &stop)).await;
        assert!(matches!(result, Ok(Ok(()))), "supervisor did not stop");
    }

    #[test]
    fn test_process_alive() {
        assert!(process_alive(std::process::id()));
    }
}
