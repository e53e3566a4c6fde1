// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Entry point used by the rest of the update client.
//!
//! [`open_storage`] picks the SQL store, migrating a legacy flat-file layout
//! into it the first time. Both layouts implement [`StorageRead`], the read
//! surface that diagnostics and the migration consume.

use std::fs;
use std::io;

use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::legacy::{migrate_legacy, LegacyStorage};
use crate::sql::SqlStorage;
use crate::types::{EcuSerials, RepositoryType, Role, RootVersion};

/// Read operations available on every storage layout.
pub trait StorageRead {
    fn load_root(&self, repo: RepositoryType, version: RootVersion) -> Result<Option<Vec<u8>>>;
    fn load_non_root(&self, repo: RepositoryType, role: Role) -> Result<Option<Vec<u8>>>;
    fn load_device_id(&self) -> Result<Option<String>>;
    fn load_ecu_registered(&self) -> Result<bool>;
    fn load_ecu_serials(&self) -> Result<Option<EcuSerials>>;
    fn load_primary_keys(&self) -> Result<Option<(String, String)>>;
}

impl StorageRead for SqlStorage {
    fn load_root(&self, repo: RepositoryType, version: RootVersion) -> Result<Option<Vec<u8>>> {
        SqlStorage::load_root(self, repo, version)
    }

    fn load_non_root(&self, repo: RepositoryType, role: Role) -> Result<Option<Vec<u8>>> {
        SqlStorage::load_non_root(self, repo, role)
    }

    fn load_device_id(&self) -> Result<Option<String>> {
        SqlStorage::load_device_id(self)
    }

    fn load_ecu_registered(&self) -> Result<bool> {
        SqlStorage::load_ecu_registered(self)
    }

    fn load_ecu_serials(&self) -> Result<Option<EcuSerials>> {
        SqlStorage::load_ecu_serials(self)
    }

    fn load_primary_keys(&self) -> Result<Option<(String, String)>> {
        SqlStorage::load_primary_keys(self)
    }
}

impl StorageRead for LegacyStorage {
    fn load_root(&self, repo: RepositoryType, version: RootVersion) -> Result<Option<Vec<u8>>> {
        LegacyStorage::load_root(self, repo, version)
    }

    fn load_non_root(&self, repo: RepositoryType, role: Role) -> Result<Option<Vec<u8>>> {
        LegacyStorage::load_non_root(self, repo, role)
    }

    fn load_device_id(&self) -> Result<Option<String>> {
        LegacyStorage::load_device_id(self)
    }

    fn load_ecu_registered(&self) -> Result<bool> {
        Ok(LegacyStorage::load_ecu_registered(self))
    }

    fn load_ecu_serials(&self) -> Result<Option<EcuSerials>> {
        LegacyStorage::load_ecu_serials(self)
    }

    fn load_primary_keys(&self) -> Result<Option<(String, String)>> {
        LegacyStorage::load_primary_keys(self)
    }
}

/// Opens the storage described by `config`.
///
/// When no database exists yet but legacy files do, they are migrated into
/// a new database and removed. A readonly open cannot migrate and fails.
/// If the migration fails the new database file is deleted so the next
/// start retries from the untouched legacy files.
pub fn open_storage(config: StorageConfig, readonly: bool) -> Result<SqlStorage> {
    let db_path = config.sqldb_file();
    if SqlStorage::db_exists(&config) {
        tracing::info!(path = %db_path.display(), readonly, "using existing sql storage");
        return SqlStorage::open(config, readonly);
    }

    let legacy = LegacyStorage::new(config.clone());
    if !legacy.is_present() {
        tracing::info!(path = %db_path.display(), "no storage found, bootstrapping sql storage");
        return SqlStorage::open(config, readonly);
    }
    if readonly {
        return Err(StorageError::LegacyMigration(
            "legacy storage found but the database is opened readonly".to_string(),
        ));
    }

    tracing::info!(path = %config.path.display(), "found legacy filesystem storage");
    let storage = SqlStorage::open(config, false)?;
    match migrate_legacy(&legacy, &storage) {
        Ok(_) => Ok(storage),
        Err(err) => {
            tracing::error!(error = %err, "legacy storage migration failed");
            drop(storage);
            match fs::remove_file(&db_path) {
                Err(remove) if remove.kind() != io::ErrorKind::NotFound => {
                    tracing::warn!(path = %db_path.display(), error = %remove, "could not remove partial database");
                }
                _ => {}
            }
            Err(StorageError::LegacyMigration(err.to_string()))
        }
    }
}
