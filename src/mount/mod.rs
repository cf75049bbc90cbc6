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

//! Object-storage mounts.
//!
//! [`MountIndex`] collapses the storage URIs a task needs into the fewest
//! mount points, and [`MountOrchestrator`] brings each of them up as a
//! read-only local view.

pub mod config;
pub mod index;
pub mod orchestrator;

pub use config::{CacheSettings, MountConfig};
pub use index::{MountEntry, MountIndex};
pub use orchestrator::MountOrchestrator;
