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

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::error::Result;

pub const ACCESS_KEY_ENV: &str = "AWS_ACCESS_KEY_ID";
pub const SECRET_KEY_ENV: &str = "AWS_SECRET_ACCESS_KEY";

/// Access key pair for one storage profile.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credential {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl Credential {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
        }
    }

    /// Environment variables handed to the mount client.
    pub fn env_vars(&self) -> [(&'static str, String); 2] {
        [
            (ACCESS_KEY_ENV, self.access_key_id.clone()),
            (SECRET_KEY_ENV, self.secret_access_key.clone()),
        ]
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Credential lookup by profile key.
pub trait CredentialProvider: Send + Sync {
    fn lookup(&self, profile_key: &str) -> Option<Credential>;
}

/// In-memory profile map, optionally loaded from a JSON file of the form
/// `{"s3://bucket": {"access_key_id": "..", "secret_access_key": ".."}}`.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    profiles: HashMap<String, Credential>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, profile_key: impl Into<String>, credential: Credential) -> Self {
        self.profiles.insert(profile_key.into(), credential);
        self
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let profiles: HashMap<String, Credential> = serde_json::from_str(&data)?;
        Ok(Self { profiles })
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl CredentialProvider for StaticCredentials {
    fn lookup(&self, profile_key: &str) -> Option<Credential> {
        self.profiles.get(profile_key).cloned()
    }
}

/// Uses the agent's own `AWS_*` environment for every profile.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentials;

impl CredentialProvider for EnvCredentials {
    fn lookup(&self, _profile_key: &str) -> Option<Credential> {
        let access = std::env::var(ACCESS_KEY_ENV).ok()?;
        let secret = std::env::var(SECRET_KEY_ENV).ok()?;
        Some(Credential::new(access, secret))
    }
}
