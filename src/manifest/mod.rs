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

//! Manifest resolution.
//!
//! A manifest is a JSON array of `{relative_path, storage_path}` objects.
//! It is never loaded whole: [`reader`] decodes one element at a time into
//! a bounded queue that the [`ManifestLinker`] workers drain.

pub mod linker;
pub mod reader;

pub use linker::{LinkReport, ManifestLinker};
pub use reader::{spawn_manifest_reader, ManifestEntry};
