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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::common::config::AgentConfig;

/// Shared stop flag polled by background tasks.
///
/// Cloning shares the flag. Raising is one-way.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    raised: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking on the stop tick to check the flag.
    /// Returns true if the signal was raised before the time ran out.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let tick = Duration::from_millis(AgentConfig::CHECKPOINT_STOP_TICK_MS);
        let deadline = Instant::now() + duration;
        loop {
            if self.is_raised() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep((deadline - now).min(tick)).await;
        }
    }

    /// Resolve once the signal is raised.
    pub async fn wait(&self) {
        let tick = Duration::from_millis(AgentConfig::CHECKPOINT_STOP_TICK_MS);
        while !self.is_raised() {
            tokio::time::sleep(tick).await;
        }
    }
}
