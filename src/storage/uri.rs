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

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Fixed auth endpoint for Google Cloud Storage's S3-compatible API.
pub const GCS_ENDPOINT: &str = "https://storage.googleapis.com";

/// Storage backends understood by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageScheme {
    /// `s3://<bucket>/<path>`
    S3,
    /// `swift://<host>/<namespace>/<bucket>/<path>`
    Swift,
    /// `gs://<bucket>/<path>`
    Gcs,
    /// `tos://<endpoint>/<bucket>/<path>`
    Tos,
}

impl StorageScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageScheme::S3 => "s3",
            StorageScheme::Swift => "swift",
            StorageScheme::Gcs => "gs",
            StorageScheme::Tos => "tos",
        }
    }

    fn from_prefix(scheme: &str) -> Option<Self> {
        match scheme {
            "s3" => Some(StorageScheme::S3),
            "swift" => Some(StorageScheme::Swift),
            "gs" => Some(StorageScheme::Gcs),
            "tos" => Some(StorageScheme::Tos),
            _ => None,
        }
    }
}

/// A parsed storage locator.
///
/// Immutable once parsed. Every variant keeps the original URI string and
/// derives a profile key, a mount base and an optional auth endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StorageDescriptor {
    S3 {
        uri: String,
        bucket: String,
        path: String,
    },
    Swift {
        uri: String,
        host: String,
        namespace: String,
        bucket: String,
        path: String,
    },
    Gcs {
        uri: String,
        bucket: String,
        path: String,
    },
    Tos {
        uri: String,
        host: String,
        bucket: String,
        path: String,
    },
}

impl StorageDescriptor {
    /// Parse a storage URI.
    ///
    /// Pure: no I/O, same input gives the same output.
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| Error::invalid_uri(uri, "missing '://' separator"))?;
        let scheme = StorageScheme::from_prefix(scheme)
            .ok_or_else(|| Error::invalid_uri(uri, format!("unsupported scheme '{scheme}'")))?;

        let (host, remainder) = match rest.split_once('/') {
            Some((host, remainder)) => (host, remainder),
            None => (rest, ""),
        };
        if host.is_empty() {
            return Err(Error::invalid_uri(uri, "missing host"));
        }

        let descriptor = match scheme {
            StorageScheme::S3 => StorageDescriptor::S3 {
                uri: uri.to_string(),
                bucket: host.to_string(),
                path: remainder.to_string(),
            },
            StorageScheme::Gcs => StorageDescriptor::Gcs {
                uri: uri.to_string(),
                bucket: host.to_string(),
                path: remainder.to_string(),
            },
            StorageScheme::Swift => {
                let mut parts = remainder.splitn(3, '/');
                let namespace = parts.next().unwrap_or_default();
                let bucket = parts.next().unwrap_or_default();
                let path = parts.next().unwrap_or_default();
                if namespace.is_empty() {
                    return Err(Error::invalid_uri(uri, "missing namespace segment"));
                }
                if bucket.is_empty() {
                    return Err(Error::invalid_uri(uri, "missing bucket segment"));
                }
                StorageDescriptor::Swift {
                    uri: uri.to_string(),
                    host: host.to_string(),
                    namespace: namespace.to_string(),
                    bucket: bucket.to_string(),
                    path: path.to_string(),
                }
            }
            StorageScheme::Tos => {
                let (bucket, path) = remainder.split_once('/').unwrap_or((remainder, ""));
                if bucket.is_empty() {
                    return Err(Error::invalid_uri(uri, "missing bucket segment"));
                }
                StorageDescriptor::Tos {
                    uri: uri.to_string(),
                    host: host.to_string(),
                    bucket: bucket.to_string(),
                    path: path.to_string(),
                }
            }
        };
        Ok(descriptor)
    }

    pub fn scheme(&self) -> StorageScheme {
        match self {
            StorageDescriptor::S3 { .. } => StorageScheme::S3,
            StorageDescriptor::Swift { .. } => StorageScheme::Swift,
            StorageDescriptor::Gcs { .. } => StorageScheme::Gcs,
            StorageDescriptor::Tos { .. } => StorageScheme::Tos,
        }
    }

    pub fn uri(&self) -> &str {
        match self {
            StorageDescriptor::S3 { uri, .. }
            | StorageDescriptor::Swift { uri, .. }
            | StorageDescriptor::Gcs { uri, .. }
            | StorageDescriptor::Tos { uri, .. } => uri,
        }
    }

    pub fn bucket(&self) -> &str {
        match self {
            StorageDescriptor::S3 { bucket, .. }
            | StorageDescriptor::Swift { bucket, .. }
            | StorageDescriptor::Gcs { bucket, .. }
            | StorageDescriptor::Tos { bucket, .. } => bucket,
        }
    }

    /// Object path inside the bucket, without a leading slash.
    pub fn path(&self) -> &str {
        match self {
            StorageDescriptor::S3 { path, .. }
            | StorageDescriptor::Swift { path, .. }
            | StorageDescriptor::Gcs { path, .. }
            | StorageDescriptor::Tos { path, .. } => path,
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        match self {
            StorageDescriptor::Swift { namespace, .. } => Some(namespace),
            _ => None,
        }
    }

    pub fn host(&self) -> Option<&str> {
        match self {
            StorageDescriptor::Swift { host, .. } | StorageDescriptor::Tos { host, .. } => {
                Some(host)
            }
            _ => None,
        }
    }

    /// Key used to look up credentials for this location.
    pub fn profile_key(&self) -> String {
        match self {
            StorageDescriptor::S3 { bucket, .. } => format!("s3://{bucket}"),
            StorageDescriptor::Gcs { bucket, .. } => format!("gs://{bucket}"),
            StorageDescriptor::Swift {
                host, namespace, ..
            } => format!("swift://{host}/{namespace}"),
            StorageDescriptor::Tos { host, bucket, .. } => format!("tos://{host}/{bucket}"),
        }
    }

    /// The coarsest grouping that one local mount can serve (bucket level).
    pub fn mount_base(&self) -> String {
        match self {
            StorageDescriptor::S3 { bucket, .. } => format!("s3://{bucket}"),
            StorageDescriptor::Gcs { bucket, .. } => format!("gs://{bucket}"),
            StorageDescriptor::Swift {
                host,
                namespace,
                bucket,
                ..
            } => format!("swift://{host}/{namespace}/{bucket}"),
            StorageDescriptor::Tos { host, bucket, .. } => format!("tos://{host}/{bucket}"),
        }
    }

    pub fn auth_endpoint(&self) -> Option<String> {
        match self {
            StorageDescriptor::S3 { .. } => None,
            StorageDescriptor::Gcs { .. } => Some(GCS_ENDPOINT.to_string()),
            StorageDescriptor::Swift { host, .. } | StorageDescriptor::Tos { host, .. } => {
                Some(format!("https://{host}"))
            }
        }
    }

    /// Whether the mount client may force path-style addressing.
    ///
    /// TOS only serves virtual-hosted requests.
    pub fn supports_path_style(&self) -> bool {
        !matches!(self, StorageDescriptor::Tos { .. })
    }

    /// Object path as a directory prefix: empty, or ending in `/`.
    pub fn directory_prefix(&self) -> String {
        let path = self.path();
        if path.is_empty() || path.ends_with('/') {
            path.to_string()
        } else {
            format!("{path}/")
        }
    }
}

impl FromStr for StorageDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        StorageDescriptor::parse(s)
    }
}

impl fmt::Display for StorageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.uri())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_s3() {
        let d = StorageDescriptor::parse("s3://my-bucket/a/b.txt").unwrap();
        assert_eq!(d.scheme(), StorageScheme::S3);
        assert_eq!(d.bucket(), "my-bucket");
        assert_eq!(d.path(), "a/b.txt");
        assert_eq!(d.auth_endpoint(), None);
        assert_eq!(d.profile_key(), "s3://my-bucket");
        assert_eq!(d.mount_base(), "s3://my-bucket");
        assert_eq!(d.uri(), "s3://my-bucket/a/b.txt");
    }

    #[test]
    fn test_parse_s3_bucket_only() {
        let d = StorageDescriptor::parse("s3://my-bucket").unwrap();
        assert_eq!(d.bucket(), "my-bucket");
        assert_eq!(d.path(), "");
        assert_eq!(d.directory_prefix(), "");
    }

    #[test]
    fn test_parse_swift() {
        let d = StorageDescriptor::parse("swift://host.example.com/AUTH_1234/my-bucket/some/object.bin")
            .unwrap();
        assert_eq!(d.namespace(), Some("AUTH_1234"));
        assert_eq!(d.bucket(), "my-bucket");
        assert_eq!(d.path(), "some/object.bin");
        assert_eq!(
            d.auth_endpoint().as_deref(),
            Some("https://host.example.com")
        );
        assert_eq!(d.profile_key(), "swift://host.example.com/AUTH_1234");
        assert_eq!(
            d.mount_base(),
            "swift://host.example.com/AUTH_1234/my-bucket"
        );
    }

    #[test]
    fn test_parse_gcs() {
        let d = StorageDescriptor::parse("gs://media/videos/clip.mp4").unwrap();
        assert_eq!(d.bucket(), "media");
        assert_eq!(d.path(), "videos/clip.mp4");
        assert_eq!(d.auth_endpoint().as_deref(), Some(GCS_ENDPOINT));
        assert!(d.supports_path_style());
    }

    #[test]
    fn test_parse_tos() {
        let d = StorageDescriptor::parse("tos://tos-cn-beijing.volces.com/bkt/x/y/").unwrap();
        assert_eq!(d.host(), Some("tos-cn-beijing.volces.com"));
        assert_eq!(d.bucket(), "bkt");
        assert_eq!(d.path(), "x/y/");
        assert_eq!(
            d.auth_endpoint().as_deref(),
            Some("https://tos-cn-beijing.volces.com")
        );
        assert_eq!(d.mount_base(), "tos://tos-cn-beijing.volces.com/bkt");
        assert!(!d.supports_path_style());
    }

    #[test]
    fn test_parse_errors() {
        for bad in [
            "ftp://host/file",
            "no-scheme",
            "s3:///path",
            "swift://host/AUTH_1",
            "swift://host//bucket/x",
            "tos://endpoint",
            "tos://endpoint/",
        ] {
            let err = StorageDescriptor::parse(bad).unwrap_err();
            assert!(
                matches!(err, Error::InvalidUri { .. }),
                "expected InvalidUri for {bad}"
            );
        }
    }

    #[test]
    fn test_directory_prefix() {
        let d = StorageDescriptor::parse("s3://b/dir/file").unwrap();
        assert_eq!(d.directory_prefix(), "dir/file/");
        let d = StorageDescriptor::parse("s3://b/dir/").unwrap();
        assert_eq!(d.directory_prefix(), "dir/");
    }

    #[test]
    fn test_from_str_and_display() {
        let d: StorageDescriptor = "gs://b/p".parse().unwrap();
        assert_eq!(d.to_string(), "gs://b/p");
    }
}
