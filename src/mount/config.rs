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

use std::path::{Path, PathBuf};

use crate::common::config::AgentConfig;
use crate::process::CommandSpec;
use crate::storage::StorageDescriptor;

/// Local read cache for a mount.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheSettings {
    pub path: Option<PathBuf>,
    pub size_mib: u64,
}

impl CacheSettings {
    pub fn new(path: impl Into<PathBuf>, size_mib: u64) -> Self {
        Self {
            path: Some(path.into()),
            size_mib,
        }
    }

    /// Cache flags are only passed for a positive size with a directory.
    pub fn enabled(&self) -> Option<(&Path, u64)> {
        match &self.path {
            Some(path) if self.size_mib > 0 => Some((path.as_path(), self.size_mib)),
            _ => None,
        }
    }
}

/// Configuration for the mount client
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Mount client invocation; mount arguments are appended.
    pub mount_command: CommandSpec,
    /// Unmount invocation; the mount point is appended.
    pub unmount_command: CommandSpec,
    /// Mount attempts before reporting the mount as empty
    pub attempts: u32,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            mount_command: CommandSpec::new(AgentConfig::MOUNT_BINARY),
            unmount_command: CommandSpec::new(AgentConfig::UNMOUNT_BINARY).arg("-u"),
            attempts: AgentConfig::MOUNT_ATTEMPTS,
        }
    }
}

impl MountConfig {
    pub fn with_mount_command(mut self, command: CommandSpec) -> Self {
        self.mount_command = command;
        self
    }

    pub fn with_unmount_command(mut self, command: CommandSpec) -> Self {
        self.unmount_command = command;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Get the command-line arguments for the mount client
    pub fn mount_args(
        &self,
        descriptor: &StorageDescriptor,
        local_path: &Path,
        cache: &CacheSettings,
    ) -> Vec<String> {
        let mut args = vec![
            descriptor.bucket().to_string(),
            local_path.display().to_string(),
            "--read-only".to_string(),
            "--auto-unmount".to_string(),
            "--allow-other".to_string(),
        ];

        if descriptor.supports_path_style() {
            args.push("--force-path-style".to_string());
        }

        if let Some((cache_dir, size_mib)) = cache.enabled() {
            args.extend([
                "--cache".to_string(),
                cache_dir.display().to_string(),
                "--metadata-ttl".to_string(),
                "indefinite".to_string(),
                "--max-cache-size".to_string(),
                size_mib.to_string(),
            ]);
        }

        if let Some(endpoint) = descriptor.auth_endpoint() {
            args.push("--endpoint-url".to_string());
            args.push(endpoint);
        }

        let prefix = descriptor.directory_prefix();
        if !prefix.is_empty() {
            args.push(format!("--prefix={prefix}"));
        }

        args
    }

    pub fn unmount_spec(&self, local_path: &Path) -> CommandSpec {
        self.unmount_command
            .clone()
            .arg(local_path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MountConfig::default();
        assert_eq!(config.mount_command.program, "mount-s3");
        assert_eq!(config.attempts, 3);
        assert_eq!(
            config.unmount_spec(Path::new("/mnt/x")).display(),
            "fusermount -u /mnt/x"
        );
    }

    #[test]
    fn test_s3_args_without_cache() {
        let d = StorageDescriptor::parse("s3://bucket/data/set").unwrap();
        let args = MountConfig::default().mount_args(
            &d,
            Path::new("/mnt/s3_bucket"),
            &CacheSettings::default(),
        );
        assert_eq!(
            args,
            vec![
                "bucket",
                "/mnt/s3_bucket",
                "--read-only",
                "--auto-unmount",
                "--allow-other",
                "--force-path-style",
                "--prefix=data/set/",
            ]
        );
    }

    #[test]
    fn test_swift_args_with_cache() {
        let d = StorageDescriptor::parse("swift://h.example.com/AUTH_1/bkt/").unwrap();
        let args = MountConfig::default().mount_args(
            &d,
            Path::new("/mnt/m"),
            &CacheSettings::new("/cache", 512),
        );
        let joined = args.join(" ");
        assert!(joined.contains("--cache /cache --metadata-ttl indefinite --max-cache-size 512"));
        assert!(joined.contains("--endpoint-url https://h.example.com"));
        // empty object path means no prefix flag
        assert!(!joined.contains("--prefix"));
    }

    #[test]
    fn test_zero_cache_size_skips_cache_flags() {
        let d = StorageDescriptor::parse("gs://b/p/").unwrap();
        let args =
            MountConfig::default().mount_args(&d, Path::new("/m"), &CacheSettings::new("/c", 0));
        assert!(!args.contains(&"--cache".to_string()));
    }

    #[test]
    fn test_tos_skips_path_style() {
        let d = StorageDescriptor::parse("tos://endpoint.example.com/bkt/x/").unwrap();
        let args = MountConfig::default().mount_args(&d, Path::new("/m"), &CacheSettings::default());
        assert!(!args.contains(&"--force-path-style".to_string()));
        assert!(args.contains(&"--prefix=x/".to_string()));
    }
}
