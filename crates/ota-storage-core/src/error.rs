// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy shared by every storage component.
//!
//! Fatal variants (unsafe permissions, invalid or too-new schemas, readonly
//! migrations) abort startup; the remaining ones are operation-local and leave
//! the store usable for a later retry.

use std::path::PathBuf;

use crate::schema::SchemaVersion;

/// Errors emitted by the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage directory {0} has unsafe permissions (group or world writable)")]
    UnsafePermissions(PathBuf),

    #[error("storage in {0} is busy: another writer holds the lock")]
    Busy(PathBuf),

    #[error("sqlite database file is invalid or its version row is malformed")]
    InvalidSchema,

    #[error("database schema version {found} is newer than the supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    #[error("database is opened readonly but needs migration from {found} to version {target}")]
    ReadonlyMigration { found: SchemaVersion, target: i64 },

    #[error("migration from version {from} to {to} failed: {source}")]
    Migration {
        from: i64,
        to: i64,
        #[source]
        source: rusqlite::Error,
    },

    #[error("no rollback script stored for version {0}")]
    MissingRollback(i64),

    #[error("cannot mark the device registered without exactly one device_info row (found {0})")]
    DeviceNotProvisioned(i64),

    #[error("target '{0}' not found in storage")]
    TargetNotFound(String),

    #[error("write to target '{filename}' exceeds its declared length {length}")]
    BlobOverflow { filename: String, length: u64 },

    #[error("target '{filename}' cannot be committed: {written} of {length} bytes written")]
    BlobIncomplete {
        filename: String,
        written: u64,
        length: u64,
    },

    #[error("target '{0}' declares no hash")]
    MissingHash(String),

    #[error("legacy filesystem storage cannot be migrated: {0}")]
    LegacyMigration(String),

    #[error("storage connection lock poisoned")]
    Poisoned,
}

/// Convenience alias for storage results.
pub type Result<T> = std::result::Result<T, StorageError>;

impl StorageError {
    /// Returns `true` for errors that must abort client startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StorageError::UnsafePermissions(_)
                | StorageError::InvalidSchema
                | StorageError::SchemaTooNew { .. }
                | StorageError::ReadonlyMigration { .. }
                | StorageError::Migration { .. }
                | StorageError::LegacyMigration(_)
        )
    }
}
