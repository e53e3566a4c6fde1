// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Persistence and image acquisition for an OTA update client.
//!
//! The crate stores trust metadata, device identity and installation state
//! in SQLite, keeps update images in a resumable blob store, and downloads
//! images with content verification. [`open_storage`] is the entry point;
//! [`Fetcher`] drives downloads into the returned [`SqlStorage`].

pub mod blob;
pub mod config;
pub mod device;
pub mod error;
pub mod fetcher;
pub mod hasher;
pub mod http;
pub mod installed;
pub mod legacy;
pub mod metadata;
pub mod migrations;
pub mod schema;
pub mod sql;
pub mod storage;
pub mod telemetry;
pub mod types;

pub use blob::{ReadHandle, StoredTarget, TargetFile, WriteHandle};
pub use config::{FetchConfig, StorageConfig};
pub use device::TlsCredentials;
pub use error::{Result, StorageError};
pub use fetcher::{FetchError, FetchOutcome, Fetcher, FsSpaceProbe, SpaceProbe, TargetStatus};
pub use hasher::MultiHasher;
pub use http::{HttpClient, HttpClientOptions, HttpError, Transport, TransferOutcome};
pub use legacy::{migrate_legacy, LegacyStorage};
pub use metadata::extract_version_untrusted;
pub use migrations::CURRENT_SCHEMA_VERSION;
pub use schema::{rollback_database, SchemaVersion};
pub use sql::SqlStorage;
pub use storage::{open_storage, StorageRead};
pub use telemetry::{
    CountingTelemetry, FetchTelemetry, NoopTelemetry, TelemetryCounters, TelemetrySnapshot,
};
pub use types::{
    DeviceInstallationResult, EcuSerials, EcuState, Hash, HashType, InstallationResult,
    InstalledVersionUpdateMode, MisconfiguredEcu, RepositoryType, Role, RootVersion, Target,
    TargetDescription,
};

/// Re-exported so callers can cancel downloads without depending on `tokio-util` directly.
pub use tokio_util::sync::CancellationToken;

#[cfg(test)]
mod tests {
    use super::*;

    /// The download stack can be assembled from crate-root items alone.
    #[test]
    fn engine_types_are_reexported() {
        let config = FetchConfig {
            repo_server: Some("https://repo.example.com".to_string()),
            ..FetchConfig::default()
        };
        let fetcher = Fetcher::from_config(config)
            .unwrap()
            .with_telemetry(std::sync::Arc::new(CountingTelemetry::default()));
        let target = Target::new("app.img", 1, vec![Hash::new(HashType::Sha256, "aa")]);
        assert_eq!(
            fetcher.target_url(&target).unwrap(),
            "https://repo.example.com/targets/app.img"
        );
        assert!(!CancellationToken::new().is_cancelled());
    }
}
