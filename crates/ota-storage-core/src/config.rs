// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Environment-driven configuration for the storage and download layers.
//!
//! Relative file names are resolved against [`StorageConfig::path`], so a
//! deployment usually only needs to set `OTA_STORAGE_PATH`.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root directory of the client storage.
const ENV_STORAGE_PATH: &str = "OTA_STORAGE_PATH";
/// SQLite database file, relative to the storage directory unless absolute.
const ENV_SQLDB_PATH: &str = "OTA_STORAGE_SQLDB_PATH";
/// Directory holding downloaded images.
const ENV_IMAGES_PATH: &str = "OTA_STORAGE_IMAGES_PATH";
/// Metadata directory of the legacy filesystem layout.
const ENV_METADATA_PATH: &str = "OTA_STORAGE_METADATA_PATH";
/// Busy window (milliseconds) for the writer lock and SQLite busy handler.
const ENV_BUSY_TIMEOUT_MS: &str = "OTA_STORAGE_BUSY_TIMEOUT_MS";
/// Base URL of the image repository.
const ENV_REPO_SERVER: &str = "OTA_REPO_SERVER";
/// Allows `http://` image URLs.
const ENV_ALLOW_PLAINTEXT: &str = "OTA_ALLOW_PLAINTEXT";
/// Free space kept untouched by downloads, in bytes.
const ENV_RESERVED_SPACE: &str = "OTA_FETCH_RESERVED_SPACE";

const DEFAULT_STORAGE_PATH: &str = "/var/sota";
const DEFAULT_SQLDB_PATH: &str = "sql.db";
const DEFAULT_IMAGES_PATH: &str = "images";
const DEFAULT_METADATA_PATH: &str = "metadata";
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 2000;

/// Default free-space safety margin: 1 MiB.
pub const DEFAULT_RESERVED_SPACE: u64 = 1024 * 1024;
/// Default size of the buffer used when reading blobs back.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Locations and timing used by the storage layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Storage root; created with owner-only permissions.
    pub path: PathBuf,
    pub sqldb_path: PathBuf,
    pub images_path: PathBuf,
    /// Legacy metadata directory, only read during the one-time migration.
    pub metadata_path: PathBuf,
    pub uptane_public_key_path: PathBuf,
    pub uptane_private_key_path: PathBuf,
    pub tls_cacert_path: PathBuf,
    pub tls_clientcert_path: PathBuf,
    pub tls_pkey_path: PathBuf,
    /// Bounded wait before reporting the store as busy.
    pub busy_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::with_path(DEFAULT_STORAGE_PATH)
    }
}

impl StorageConfig {
    /// Default layout rooted at `path`.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sqldb_path: PathBuf::from(DEFAULT_SQLDB_PATH),
            images_path: PathBuf::from(DEFAULT_IMAGES_PATH),
            metadata_path: PathBuf::from(DEFAULT_METADATA_PATH),
            uptane_public_key_path: PathBuf::from("ecukey.pub"),
            uptane_private_key_path: PathBuf::from("ecukey.der"),
            tls_cacert_path: PathBuf::from("root.crt"),
            tls_clientcert_path: PathBuf::from("client.pem"),
            tls_pkey_path: PathBuf::from("pkey.pem"),
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }

    /// Builds settings from the current process environment.
    pub fn from_os_env() -> Self {
        Self::from_env_iter(env::vars())
    }

    /// Builds settings from an iterator of key/value pairs (typically for tests).
    pub fn from_env_iter<I, K, V>(iter: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map = collect_env(iter);
        let path = map
            .get(ENV_STORAGE_PATH)
            .and_then(|value| sanitize_non_empty(value))
            .unwrap_or_else(|| DEFAULT_STORAGE_PATH.to_string());
        let mut config = Self::with_path(path);
        if let Some(value) = map.get(ENV_SQLDB_PATH).and_then(|v| sanitize_non_empty(v)) {
            config.sqldb_path = PathBuf::from(value);
        }
        if let Some(value) = map.get(ENV_IMAGES_PATH).and_then(|v| sanitize_non_empty(v)) {
            config.images_path = PathBuf::from(value);
        }
        if let Some(value) = map.get(ENV_METADATA_PATH).and_then(|v| sanitize_non_empty(v)) {
            config.metadata_path = PathBuf::from(value);
        }
        let busy_ms = parse_u64(
            map.get(ENV_BUSY_TIMEOUT_MS).map(String::as_str),
            DEFAULT_BUSY_TIMEOUT_MS,
        );
        config.busy_timeout = Duration::from_millis(busy_ms);
        config
    }

    /// Absolute location of the SQLite file.
    pub fn sqldb_file(&self) -> PathBuf {
        self.resolve(&self.sqldb_path)
    }

    pub fn images_dir(&self) -> PathBuf {
        self.resolve(&self.images_path)
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.resolve(&self.metadata_path)
    }

    /// Resolves a legacy flat file (e.g. `device_id`) against the storage root.
    pub fn legacy_file(&self, name: impl AsRef<Path>) -> PathBuf {
        self.resolve(name.as_ref())
    }

    fn resolve(&self, relative: &Path) -> PathBuf {
        // `join` keeps absolute overrides as-is.
        self.path.join(relative)
    }
}

/// Settings for the download engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    /// Image repository base URL used when a target carries no explicit URI.
    pub repo_server: Option<String>,
    pub reserved_space: u64,
    pub buffer_size: usize,
    pub allow_plaintext: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            repo_server: None,
            reserved_space: DEFAULT_RESERVED_SPACE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            allow_plaintext: false,
        }
    }
}

impl FetchConfig {
    pub fn from_os_env() -> Self {
        Self::from_env_iter(env::vars())
    }

    pub fn from_env_iter<I, K, V>(iter: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map = collect_env(iter);
        Self {
            repo_server: map
                .get(ENV_REPO_SERVER)
                .and_then(|value| sanitize_non_empty(value))
                .map(|value| value.trim_end_matches('/').to_string()),
            reserved_space: parse_u64(
                map.get(ENV_RESERVED_SPACE).map(String::as_str),
                DEFAULT_RESERVED_SPACE,
            ),
            buffer_size: DEFAULT_BUFFER_SIZE,
            allow_plaintext: parse_bool(map.get(ENV_ALLOW_PLAINTEXT).map(String::as_str), false),
        }
    }
}

fn collect_env<I, K, V>(iter: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    iter.into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Helper trimming whitespace and discarding empty values.
fn sanitize_non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parses boolean values from strings, falling back to the provided default.
fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value.map(|s| s.trim().to_ascii_lowercase()) {
        Some(ref v) if ["1", "true", "t", "yes", "y"].contains(&v.as_str()) => true,
        Some(ref v) if ["0", "false", "f", "no", "n"].contains(&v.as_str()) => false,
        _ => default,
    }
}

fn parse_u64(value: Option<&str>, default: u64) -> u64 {
    value
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Defaults follow the standard device layout.
    #[test]
    fn storage_config_defaults() {
        let config = StorageConfig::from_env_iter::<Vec<(String, String)>, _, _>(vec![]);
        assert_eq!(config.path, PathBuf::from("/var/sota"));
        assert_eq!(config.sqldb_file(), PathBuf::from("/var/sota/sql.db"));
        assert_eq!(config.images_dir(), PathBuf::from("/var/sota/images"));
        assert_eq!(config.metadata_dir(), PathBuf::from("/var/sota/metadata"));
        assert_eq!(config.busy_timeout, Duration::from_millis(2000));
    }

    #[test]
    fn storage_config_honours_overrides() {
        let config = StorageConfig::from_env_iter([
            (ENV_STORAGE_PATH, " /data/ota "),
            (ENV_SQLDB_PATH, "/srv/client.db"),
            (ENV_IMAGES_PATH, "blobs"),
            (ENV_BUSY_TIMEOUT_MS, "250"),
        ]);
        assert_eq!(config.path, PathBuf::from("/data/ota"));
        // absolute override escapes the storage root
        assert_eq!(config.sqldb_file(), PathBuf::from("/srv/client.db"));
        assert_eq!(config.images_dir(), PathBuf::from("/data/ota/blobs"));
        assert_eq!(config.busy_timeout, Duration::from_millis(250));
    }

    #[test]
    fn malformed_numbers_fall_back_to_defaults() {
        let config = StorageConfig::from_env_iter([(ENV_BUSY_TIMEOUT_MS, "soon")]);
        assert_eq!(config.busy_timeout, Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS));
        let fetch = FetchConfig::from_env_iter([(ENV_RESERVED_SPACE, "-5")]);
        assert_eq!(fetch.reserved_space, DEFAULT_RESERVED_SPACE);
    }

    #[test]
    fn fetch_config_reads_server_and_plaintext_flag() {
        let fetch = FetchConfig::from_env_iter([
            (ENV_REPO_SERVER, "https://repo.example.com/"),
            (ENV_ALLOW_PLAINTEXT, "Yes"),
        ]);
        assert_eq!(fetch.repo_server.as_deref(), Some("https://repo.example.com"));
        assert!(fetch.allow_plaintext);
        assert_eq!(fetch.buffer_size, DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn parse_bool_permits_common_variants() {
        assert!(parse_bool(Some("true"), false));
        assert!(parse_bool(Some("1"), false));
        assert!(!parse_bool(Some("no"), true));
        assert!(parse_bool(Some("maybe"), true));
        assert!(!parse_bool(None, false));
    }
}
