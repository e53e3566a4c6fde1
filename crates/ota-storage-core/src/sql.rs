// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Relational store owning the SQLite connection and the writer lock.
//!
//! Table-specific operations live in sibling modules (`metadata`, `device`,
//! `installed`, `blob`) as further `impl SqlStorage` blocks; they all go
//! through [`SqlStorage::read`] and [`SqlStorage::write`] so that every
//! failure is logged where it happens and every multi-statement write runs in
//! one transaction.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, Transaction};

use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::schema::{self, SchemaVersion, StorageLock};

/// SQLite-backed storage for trust metadata, device state and images.
///
/// A writable instance holds the advisory lock of its storage directory for
/// its whole lifetime; readonly instances take no lock and can coexist with
/// a writer.
#[derive(Debug)]
pub struct SqlStorage {
    config: StorageConfig,
    readonly: bool,
    conn: Mutex<Connection>,
    // dropped after the connection
    _lock: Option<StorageLock>,
}

impl SqlStorage {
    /// Opens (and if needed creates or migrates) the database described by `config`.
    pub fn open(config: StorageConfig, readonly: bool) -> Result<Self> {
        let db_path = config.sqldb_file();
        let lock = if readonly {
            None
        } else {
            schema::prepare_directory(&config.path)?;
            if let Some(parent) = db_path.parent().filter(|parent| *parent != config.path.as_path()) {
                schema::prepare_directory(parent)?;
            }
            Some(StorageLock::acquire(&config.path, config.busy_timeout)?)
        };
        let conn = schema::open_database(&db_path, readonly, config.busy_timeout)?;
        tracing::debug!(path = %db_path.display(), readonly, "opened sql storage");
        let storage = Self {
            config,
            readonly,
            conn: Mutex::new(conn),
            _lock: lock,
        };
        if !readonly {
            storage.clean_meta_version()?;
        }
        Ok(storage)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn db_path(&self) -> PathBuf {
        self.config.sqldb_file()
    }

    /// Returns `true` if a database file already exists at the configured location.
    pub fn db_exists(config: &StorageConfig) -> bool {
        config.sqldb_file().exists()
    }

    /// Schema version of the open database.
    pub fn schema_version(&self) -> Result<SchemaVersion> {
        let conn = self.lock()?;
        Ok(schema::read_version(&conn))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    /// Runs a read-only query, logging failures under `op`.
    pub(crate) fn read<T>(
        &self,
        op: &'static str,
        query: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let conn = self.lock()?;
        query(&conn).map_err(|err| {
            tracing::error!(op, error = %err, "storage read failed");
            err
        })
    }

    /// Runs `mutation` inside a transaction committed only when it succeeds.
    pub(crate) fn write<T>(
        &self,
        op: &'static str,
        mutation: impl FnOnce(&Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.lock()?;
        let result = conn
            .transaction()
            .map_err(StorageError::from)
            .and_then(|tx| {
                let value = mutation(&tx)?;
                tx.commit()?;
                Ok(value)
            });
        result.map_err(|err| {
            tracing::error!(op, error = %err, "storage write failed");
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;
    use tracing_test::traced_test;

    use super::*;
    use crate::migrations::CURRENT_SCHEMA_VERSION;

    fn config(dir: &TempDir) -> StorageConfig {
        let mut config = StorageConfig::with_path(dir.path());
        config.busy_timeout = Duration::from_millis(100);
        config
    }

    #[test]
    fn open_creates_current_schema() {
        let dir = TempDir::new().unwrap();
        let storage = SqlStorage::open(config(&dir), false).unwrap();
        assert_eq!(
            storage.schema_version().unwrap(),
            SchemaVersion::Version(CURRENT_SCHEMA_VERSION)
        );
        assert!(SqlStorage::db_exists(storage.config()));
        assert!(dir.path().join(schema::LOCK_FILE_NAME).exists());
    }

    #[test]
    fn second_writer_is_busy_but_readers_coexist() {
        let dir = TempDir::new().unwrap();
        let writer = SqlStorage::open(config(&dir), false).unwrap();
        let err = SqlStorage::open(config(&dir), false).unwrap_err();
        assert!(matches!(err, StorageError::Busy(_)));
        let reader = SqlStorage::open(config(&dir), true).unwrap();
        assert!(reader.is_readonly());
        drop(writer);
        SqlStorage::open(config(&dir), false).unwrap();
    }

    #[test]
    #[traced_test]
    fn failed_transaction_leaves_no_trace() {
        let dir = TempDir::new().unwrap();
        let storage = SqlStorage::open(config(&dir), false).unwrap();
        let err = storage
            .write("test", |tx| {
                tx.execute("INSERT INTO need_reboot(unique_mark, flag) VALUES (0, 1)", [])?;
                tx.execute("INSERT INTO no_such_table VALUES (1)", [])?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::Db(_)));
        assert!(!storage.load_need_reboot().unwrap());
        assert!(logs_contain("storage write failed"));
    }
}
