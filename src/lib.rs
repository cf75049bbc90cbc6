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

pub mod cli;
pub mod common;
pub mod error;
pub mod manifest;
pub mod mount;
pub mod process;
pub mod stage;
pub mod storage;
pub mod sync;
pub mod transfer;

pub use error::{Error, Result};
pub use manifest::{LinkReport, ManifestEntry, ManifestLinker};
pub use mount::{MountIndex, MountOrchestrator};
pub use process::{ConnectionHealth, ProcessRunner, RetryPolicy};
pub use stage::{StageReport, Stager};
pub use storage::StorageDescriptor;
pub use sync::{SyncConfig, SyncSessionSupervisor};
pub use transfer::{CheckpointUploader, DataCli, Transfer};
