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

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

static BENCHMARK_FILE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<op>.+)_(?P<ts>\d+)_benchmark\.json$").expect("valid benchmark file pattern")
});

/// Statistics written by one download or upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkMetrics {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub end_time: DateTime<Utc>,
    pub bytes_transferred: u64,
    pub file_count: u64,
}

/// Totals for one operation kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OperationTotals {
    pub operations: usize,
    pub bytes_transferred: u64,
    pub file_count: u64,
    pub busy_millis: i64,
}

/// Aggregate over every benchmark artifact in a directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BenchmarkSummary {
    pub operations: usize,
    pub bytes_transferred: u64,
    pub file_count: u64,
    pub earliest_start: Option<DateTime<Utc>>,
    pub latest_end: Option<DateTime<Utc>>,
    /// Total bytes over the wall-clock span from earliest start to latest end.
    pub throughput_bytes_per_sec: f64,
    pub by_operation: BTreeMap<String, OperationTotals>,
}

impl BenchmarkSummary {
    fn add(&mut self, operation: &str, metrics: &BenchmarkMetrics) {
        self.operations += 1;
        self.bytes_transferred += metrics.bytes_transferred;
        self.file_count += metrics.file_count;
        self.earliest_start = Some(match self.earliest_start {
            Some(t) => t.min(metrics.start_time),
            None => metrics.start_time,
        });
        self.latest_end = Some(match self.latest_end {
            Some(t) => t.max(metrics.end_time),
            None => metrics.end_time,
        });

        let totals = self.by_operation.entry(operation.to_string()).or_default();
        totals.operations += 1;
        totals.bytes_transferred += metrics.bytes_transferred;
        totals.file_count += metrics.file_count;
        totals.busy_millis += (metrics.end_time - metrics.start_time).num_milliseconds().max(0);
    }

    fn finish(mut self) -> Self {
        if let (Some(start), Some(end)) = (self.earliest_start, self.latest_end) {
            let span = (end - start).num_milliseconds();
            if span > 0 {
                self.throughput_bytes_per_sec =
                    self.bytes_transferred as f64 * 1000.0 / span as f64;
            }
        }
        self
    }
}

/// Operation kind encoded in a benchmark artifact name, if it is one.
pub fn benchmark_operation(file_name: &str) -> Option<&str> {
    BENCHMARK_FILE
        .captures(file_name)
        .and_then(|c| c.name("op"))
        .map(|m| m.as_str())
}

/// Read every `<operation>_<epochMillis>_benchmark.json` in `dir`.
///
/// Unreadable or malformed artifacts are skipped with a warning.
pub fn aggregate_benchmarks(dir: &Path) -> Result<BenchmarkSummary> {
    let mut summary = BenchmarkSummary::default();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(operation) = file_name.to_str().and_then(benchmark_operation) else {
            continue;
        };

        let metrics = std::fs::read(entry.path())
            .map_err(Error::from)
            .and_then(|bytes| Ok(serde_json::from_slice::<BenchmarkMetrics>(&bytes)?));
        match metrics {
            Ok(metrics) => {
                debug!("Read benchmark {}", entry.path().display());
                summary.add(operation, &metrics);
            }
            Err(e) => warn!("Skipping benchmark {}: {e}", entry.path().display()),
        }
    }

    Ok(summary.finish())
}
