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

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::common::config::AgentConfig;
use crate::common::StopSignal;
use crate::error::{Error, Result};

#[derive(Debug)]
struct HealthState {
    connected: bool,
    disconnected_at: Option<Instant>,
}

/// Connection health shared by every retry loop.
///
/// Starts healthy. While broken, outbound calls wait instead of attempting.
#[derive(Debug)]
pub struct ConnectionHealth {
    state: Mutex<HealthState>,
    poll_interval: Duration,
    disconnect_timeout: Option<Duration>,
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self::new(Duration::from_secs(AgentConfig::HEALTH_POLL_INTERVAL_SECS))
    }
}

impl ConnectionHealth {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(HealthState {
                connected: true,
                disconnected_at: None,
            }),
            poll_interval,
            disconnect_timeout: None,
        }
    }

    /// Give up waiting once the service has been gone this long.
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = Some(timeout);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut HealthState) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn is_connected(&self) -> bool {
        self.with_state(|s| s.connected)
    }

    /// Flip to broken. The disconnect timestamp is kept from the first flip.
    pub fn mark_disconnected(&self) {
        self.with_state(|s| {
            if s.connected {
                s.connected = false;
                s.disconnected_at = Some(Instant::now());
            }
        });
    }

    pub fn mark_connected(&self) {
        self.with_state(|s| {
            s.connected = true;
            s.disconnected_at = None;
        });
    }

    /// How long the service has been unreachable, if it is.
    pub fn disconnected_for(&self) -> Option<Duration> {
        self.with_state(|s| s.disconnected_at.map(|at| at.elapsed()))
    }

    /// Sleep in poll-interval steps until the flag is healthy again.
    pub async fn wait_until_healthy(&self) -> Result<()> {
        loop {
            let elapsed = match self.disconnected_for() {
                None => return Ok(()),
                Some(elapsed) => elapsed,
            };
            if let Some(limit) = self.disconnect_timeout {
                if elapsed >= limit {
                    return Err(Error::ServiceDisconnected { elapsed, limit });
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Reachability check for the orchestration service.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

/// Considers the service reachable when a TCP connection opens in time.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    address: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            timeout: Duration::from_secs(AgentConfig::WATCHDOG_PROBE_TIMEOUT_SECS),
        }
    }

    /// Probe the host and port of a service URL such as `https://svc:8443`.
    pub fn from_url(service_url: &str) -> Result<Self> {
        let url = url::Url::parse(service_url)
            .map_err(|e| Error::invalid_uri(service_url, e.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::invalid_uri(service_url, "missing host"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::invalid_uri(service_url, "missing port"))?;
        Ok(Self::new(format!("{host}:{port}")))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn probe(&self) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(&self.address)).await,
            Ok(Ok(_))
        )
    }
}

/// Background task keeping [`ConnectionHealth`] in step with a probe.
pub fn spawn_watchdog(
    health: Arc<ConnectionHealth>,
    probe: Arc<dyn HealthProbe>,
    interval: Duration,
    stop: StopSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while !stop.is_raised() {
            let reachable = probe.probe().await;
            let was_connected = health.is_connected();
            if reachable {
                if !was_connected {
                    info!("Service reachable again, resuming outbound calls");
                }
                health.mark_connected();
            } else {
                if was_connected {
                    warn!("Service unreachable, pausing outbound calls");
                }
                health.mark_disconnected();
            }
            if stop.sleep(interval).await {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_starts_healthy() {
        let health = ConnectionHealth::default();
        assert!(health.is_connected());
        assert!(health.disconnected_for().is_none());
    }

    #[test]
    fn test_disconnect_timestamp_kept_from_first_flip() {
        let health = ConnectionHealth::new(Duration::from_millis(10));
        health.mark_disconnected();
        std::thread::sleep(Duration::from_millis(20));
        health.mark_disconnected();
        assert!(health.disconnected_for().unwrap() >= Duration::from_millis(20));
        health.mark_connected();
        assert!(health.is_connected());
        assert!(health.disconnected_for().is_none());
    }

    #[tokio::test]
    async fn test_wait_blocks_until_reconnected() {
        let health = Arc::new(ConnectionHealth::new(Duration::from_millis(10)));
        health.mark_disconnected();

        let flipper = health.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flipper.mark_connected();
        });

        let started = Instant::now();
        health.wait_until_healthy().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_wait_gives_up_after_disconnect_timeout() {
        let health = ConnectionHealth::new(Duration::from_millis(10))
            .with_disconnect_timeout(Duration::from_millis(30));
        health.mark_disconnected();
        let err = health.wait_until_healthy().await.unwrap_err();
        assert!(matches!(err, Error::ServiceDisconnected { .. }));
    }

    #[test]
    fn test_tcp_probe_from_url() {
        let probe = TcpProbe::from_url("https://service.example.com").unwrap();
        assert_eq!(probe.address(), "service.example.com:443");
        let probe = TcpProbe::from_url("http://10.0.0.1:8000/api").unwrap();
        assert_eq!(probe.address(), "10.0.0.1:8000");
        assert!(TcpProbe::from_url("not a url").is_err());
    }

    struct FlagProbe(Arc<AtomicBool>);

    #[async_trait]
    impl HealthProbe for FlagProbe {
        async fn probe(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_watchdog_flips_health() {
        let health = Arc::new(ConnectionHealth::new(Duration::from_millis(5)));
        let reachable = Arc::new(AtomicBool::new(false));
        let stop = StopSignal::new();
        let handle = spawn_watchdog(
            health.clone(),
            Arc::new(FlagProbe(reachable.clone())),
            Duration::from_millis(10),
            stop.clone(),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!health.is_connected());

        reachable.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(health.is_connected());

        stop.raise();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("watchdog should stop")
            .unwrap();
    }
}
