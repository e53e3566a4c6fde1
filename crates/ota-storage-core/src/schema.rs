// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Owns the on-disk SQLite file: directory permissions, the writer lock,
//! connection setup and schema migrations.
//!
//! Opening follows a fixed decision table. An empty file is bootstrapped with
//! the current schema, an older version is migrated forward, and the current
//! version is used as-is; every change happens inside a single transaction.
//! Newer or unreadable versions are rejected, as is any migration requested
//! on a readonly connection.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs4::FileExt;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};

use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::migrations::{
    CURRENT_SCHEMA, CURRENT_SCHEMA_VERSION, ROLLBACK_MIGRATIONS, SCHEMA_MIGRATIONS,
};

/// Advisory lock file guarding writers, created in the storage directory.
pub const LOCK_FILE_NAME: &str = "storage.lock";

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Version found in an existing database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaVersion {
    /// No tables yet.
    Empty,
    /// Not a database, or the version row is missing or malformed.
    Invalid,
    Version(i64),
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaVersion::Empty => f.write_str("empty"),
            SchemaVersion::Invalid => f.write_str("invalid"),
            SchemaVersion::Version(version) => write!(f, "{version}"),
        }
    }
}

/// Reads the schema version without modifying the file.
pub fn read_version(conn: &Connection) -> SchemaVersion {
    let tables = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table'",
        [],
        |row| row.get::<_, i64>(0),
    );
    match tables {
        Ok(0) => return SchemaVersion::Empty,
        Ok(_) => {}
        Err(err) => {
            tracing::warn!(error = %err, "cannot list database tables");
            return SchemaVersion::Invalid;
        }
    }
    match conn.query_row("SELECT version FROM version LIMIT 1", [], |row| {
        row.get::<_, i64>(0)
    }) {
        Ok(version) if version >= 0 => SchemaVersion::Version(version),
        Ok(version) => {
            tracing::warn!(version, "negative schema version");
            SchemaVersion::Invalid
        }
        Err(err) => {
            tracing::warn!(error = %err, "cannot read schema version");
            SchemaVersion::Invalid
        }
    }
}

/// Creates `dir` with owner-only permissions, or validates an existing one.
///
/// A group or world writable directory is refused; a group or world readable
/// one is tightened to `0700`.
pub fn prepare_directory(dir: &Path) -> Result<()> {
    if !dir.exists() {
        create_private_dir(dir)?;
        tracing::debug!(path = %dir.display(), "created storage directory");
    }
    check_permissions(dir)
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    Ok(())
}

#[cfg(unix)]
fn check_permissions(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(dir)?.permissions().mode();
    if mode & 0o022 != 0 {
        tracing::error!(path = %dir.display(), mode = %format_args!("{:o}", mode & 0o777), "storage directory is writable by others");
        return Err(StorageError::UnsafePermissions(dir.to_path_buf()));
    }
    if mode & 0o044 != 0 {
        tracing::warn!(path = %dir.display(), "storage directory readable by others, restricting to owner");
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_permissions(_dir: &Path) -> Result<()> {
    Ok(())
}

/// Exclusive advisory lock held by the single writer of a storage directory.
///
/// Dropping it releases the lock. The lock file itself stays in place: a
/// writer blocked in [`StorageLock::acquire`] keeps its handle open, and it
/// must keep contending on the same inode as any writer arriving later.
#[derive(Debug)]
pub struct StorageLock {
    path: PathBuf,
    _file: File,
}

impl StorageLock {
    /// Acquires the lock in `dir`, retrying until `wait` elapses.
    pub fn acquire(dir: &Path, wait: Duration) -> Result<Self> {
        let path = dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        let deadline = Instant::now() + wait;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "acquired storage lock");
                    return Ok(Self { path, _file: file });
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        tracing::warn!(path = %path.display(), "storage lock still held after busy window");
                        return Err(StorageError::Busy(dir.to_path_buf()));
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Opens a connection with the flags and pragmas used by the store.
pub fn open_connection(path: &Path, readonly: bool, busy_timeout: Duration) -> Result<Connection> {
    let flags = if readonly {
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_FULL_MUTEX
    } else {
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX
    };
    let conn = Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(busy_timeout)?;
    if !readonly {
        conn.execute_batch("PRAGMA synchronous = FULL;")?;
    }
    Ok(conn)
}

/// Opens the database at `path` and brings its schema to the current version.
pub fn open_database(path: &Path, readonly: bool, busy_timeout: Duration) -> Result<Connection> {
    if readonly && !path.exists() {
        return Err(StorageError::ReadonlyMigration {
            found: SchemaVersion::Empty,
            target: CURRENT_SCHEMA_VERSION,
        });
    }
    let mut conn = open_connection(path, readonly, busy_timeout).map_err(not_a_database)?;
    migrate(&mut conn, readonly)?;
    Ok(conn)
}

fn not_a_database(err: StorageError) -> StorageError {
    match err {
        StorageError::Db(rusqlite::Error::SqliteFailure(failure, _))
            if failure.code == rusqlite::ErrorCode::NotADatabase =>
        {
            StorageError::InvalidSchema
        }
        other => other,
    }
}

/// Applies the open decision table to an established connection.
pub fn migrate(conn: &mut Connection, readonly: bool) -> Result<()> {
    let found = read_version(conn);
    match found {
        SchemaVersion::Invalid => Err(StorageError::InvalidSchema),
        SchemaVersion::Version(version) if version == CURRENT_SCHEMA_VERSION => Ok(()),
        SchemaVersion::Version(version) if version > CURRENT_SCHEMA_VERSION => {
            tracing::error!(version, supported = CURRENT_SCHEMA_VERSION, "database schema is newer than this client");
            Err(StorageError::SchemaTooNew {
                found: version,
                supported: CURRENT_SCHEMA_VERSION,
            })
        }
        _ if readonly => Err(StorageError::ReadonlyMigration {
            found,
            target: CURRENT_SCHEMA_VERSION,
        }),
        SchemaVersion::Empty => bootstrap(conn),
        SchemaVersion::Version(_) => migrate_to(conn, CURRENT_SCHEMA_VERSION),
    }
}

fn bootstrap(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(CURRENT_SCHEMA)
        .map_err(|source| StorageError::Migration {
            from: -1,
            to: CURRENT_SCHEMA_VERSION,
            source,
        })?;
    store_rollback_scripts(&tx, CURRENT_SCHEMA_VERSION)?;
    tx.commit()?;
    tracing::info!(version = CURRENT_SCHEMA_VERSION, "bootstrapped database schema");
    Ok(())
}

/// Runs forward migrations up to `target` in a single transaction.
///
/// Exposed to the crate so tests can build databases at every historical version.
pub(crate) fn migrate_to(conn: &mut Connection, target: i64) -> Result<()> {
    let start = match read_version(conn) {
        SchemaVersion::Empty => 0,
        SchemaVersion::Version(version) => version + 1,
        SchemaVersion::Invalid => return Err(StorageError::InvalidSchema),
    };
    if start > target {
        return Ok(());
    }
    let tx = conn.transaction()?;
    for (version, script) in SCHEMA_MIGRATIONS
        .iter()
        .enumerate()
        .map(|(index, script)| (index as i64, script))
        .filter(|(version, _)| (start..=target).contains(version))
    {
        tx.execute_batch(script)
            .map_err(|source| StorageError::Migration {
                from: version - 1,
                to: version,
                source,
            })?;
        tracing::debug!(version, "applied schema migration");
    }
    store_rollback_scripts(&tx, target)?;
    tx.commit()?;
    tracing::info!(from = start - 1, to = target, "migrated database schema");
    Ok(())
}

fn store_rollback_scripts(tx: &Transaction<'_>, up_to: i64) -> Result<()> {
    let mut statement =
        tx.prepare("INSERT OR REPLACE INTO rollback_migrations(version_from, migration) VALUES (?1, ?2)")?;
    for (version, script) in ROLLBACK_MIGRATIONS.iter().enumerate().skip(1) {
        let version = version as i64;
        if version > up_to {
            break;
        }
        statement.execute(params![version, script])?;
    }
    Ok(())
}

/// Downgrades the schema to `target` using the inverse scripts stored in the file.
///
/// Scripts are applied in descending order inside one transaction and each
/// consumed script is deleted; a missing script aborts without changes.
pub fn rollback_to(conn: &mut Connection, target: i64) -> Result<()> {
    let current = match read_version(conn) {
        SchemaVersion::Version(version) => version,
        SchemaVersion::Empty => return Ok(()),
        SchemaVersion::Invalid => return Err(StorageError::InvalidSchema),
    };
    if target >= current {
        return Ok(());
    }
    let tx = conn.transaction()?;
    for version in ((target.max(0) + 1)..=current).rev() {
        let script: Option<String> = tx
            .query_row(
                "SELECT migration FROM rollback_migrations WHERE version_from = ?1",
                params![version],
                |row| row.get(0),
            )
            .optional()?;
        let script = script.ok_or(StorageError::MissingRollback(version))?;
        tx.execute_batch(&script)
            .map_err(|source| StorageError::Migration {
                from: version,
                to: version - 1,
                source,
            })?;
        tx.execute(
            "DELETE FROM rollback_migrations WHERE version_from = ?1",
            params![version],
        )?;
    }
    tx.commit()?;
    tracing::info!(from = current, to = target, "rolled back database schema");
    Ok(())
}

/// Offline downgrade of the database described by `config`.
///
/// Takes the same writer lock as [`crate::SqlStorage::open`], so it cannot run
/// next to a client even when the database lives outside the storage root.
pub fn rollback_database(config: &StorageConfig, target: i64) -> Result<()> {
    let _lock = StorageLock::acquire(&config.path, config.busy_timeout)?;
    let mut conn = open_connection(&config.sqldb_file(), false, config.busy_timeout)?;
    rollback_to(&mut conn, target)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::TempDir;

    use super::*;

    fn shape(conn: &Connection) -> BTreeMap<String, Vec<String>> {
        let mut statement = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        let tables: Vec<String> = statement
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        tables
            .into_iter()
            .map(|table| {
                let mut info = conn
                    .prepare(&format!("PRAGMA table_info({table})"))
                    .unwrap();
                let columns = info
                    .query_map([], |row| row.get::<_, String>(1))
                    .unwrap()
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .unwrap();
                (table, columns)
            })
            .collect()
    }

    fn bootstrapped_shape() -> BTreeMap<String, Vec<String>> {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn, false).unwrap();
        shape(&conn)
    }

    #[test]
    fn empty_file_is_bootstrapped_to_current_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sql.db");
        let conn = open_database(&path, false, Duration::from_millis(100)).unwrap();
        assert_eq!(read_version(&conn), SchemaVersion::Version(CURRENT_SCHEMA_VERSION));
        let stored: i64 = conn
            .query_row("SELECT count(*) FROM rollback_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(stored, CURRENT_SCHEMA_VERSION);
    }

    /// Each historical version migrates to the same layout as a fresh bootstrap.
    #[test]
    fn forward_migration_from_every_version_matches_bootstrap() {
        let expected = bootstrapped_shape();
        for version in 0..CURRENT_SCHEMA_VERSION {
            let mut conn = Connection::open_in_memory().unwrap();
            migrate_to(&mut conn, version).unwrap();
            assert_eq!(read_version(&conn), SchemaVersion::Version(version));
            migrate(&mut conn, false).unwrap();
            assert_eq!(read_version(&conn), SchemaVersion::Version(CURRENT_SCHEMA_VERSION));
            assert_eq!(shape(&conn), expected, "layout after migrating from {version}");
        }
    }

    #[test]
    fn forward_migration_keeps_existing_rows() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate_to(&mut conn, 2).unwrap();
        conn.execute_batch(
            "INSERT INTO meta VALUES (x'7b7d', 1, 0, 1);
             INSERT INTO installed_versions(ecu_serial, sha256, name, hashes, length, is_current, is_pending)
                 VALUES ('ecu1', 'aa', 'fw.bin', 'sha256:aa', 10, 1, 0);",
        )
        .unwrap();
        migrate(&mut conn, false).unwrap();
        let root_count: i64 = conn
            .query_row("SELECT count(*) FROM meta", [], |row| row.get(0))
            .unwrap();
        assert_eq!(root_count, 1);
        let (name, was_installed): (String, bool) = conn
            .query_row(
                "SELECT name, was_installed FROM installed_versions",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(name, "fw.bin");
        assert!(was_installed);
    }

    #[test]
    fn rollback_reaches_every_older_version_and_migrates_back() {
        let expected = bootstrapped_shape();
        for target in 0..CURRENT_SCHEMA_VERSION {
            let mut conn = Connection::open_in_memory().unwrap();
            migrate(&mut conn, false).unwrap();
            rollback_to(&mut conn, target).unwrap();
            assert_eq!(read_version(&conn), SchemaVersion::Version(target));
            migrate(&mut conn, false).unwrap();
            assert_eq!(shape(&conn), expected, "layout after rollback to {target}");
        }
    }

    #[test]
    fn rollback_without_stored_script_changes_nothing() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn, false).unwrap();
        conn.execute("DELETE FROM rollback_migrations WHERE version_from = 2", [])
            .unwrap();
        let err = rollback_to(&mut conn, 0).unwrap_err();
        assert!(matches!(err, StorageError::MissingRollback(2)));
        assert_eq!(read_version(&conn), SchemaVersion::Version(CURRENT_SCHEMA_VERSION));
    }

    #[test]
    fn newer_schema_is_fatal() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn, false).unwrap();
        conn.execute("UPDATE version SET version = ?1", params![CURRENT_SCHEMA_VERSION + 1])
            .unwrap();
        let err = migrate(&mut conn, false).unwrap_err();
        assert!(matches!(err, StorageError::SchemaTooNew { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn garbage_file_is_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sql.db");
        fs::write(&path, b"definitely not a database, just some text padding it out").unwrap();
        let err = open_database(&path, false, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, StorageError::InvalidSchema));
    }

    #[test]
    fn readonly_open_of_outdated_file_fails_without_touching_it() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sql.db");
        {
            let mut conn = open_connection(&path, false, Duration::from_millis(100)).unwrap();
            migrate_to(&mut conn, 1).unwrap();
        }
        let before = fs::read(&path).unwrap();
        let err = open_database(&path, true, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(
            err,
            StorageError::ReadonlyMigration {
                found: SchemaVersion::Version(1),
                target: CURRENT_SCHEMA_VERSION
            }
        ));
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn readonly_open_of_missing_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sql.db");
        let err = open_database(&path, true, Duration::from_millis(100)).unwrap_err();
        assert!(err.is_fatal());
        assert!(!path.exists());
    }

    #[test]
    fn second_writer_is_reported_busy() {
        let dir = TempDir::new().unwrap();
        let first = StorageLock::acquire(dir.path(), Duration::from_millis(100)).unwrap();
        let started = Instant::now();
        let err = StorageLock::acquire(dir.path(), Duration::from_millis(150)).unwrap_err();
        assert!(matches!(err, StorageError::Busy(_)));
        assert!(started.elapsed() >= Duration::from_millis(150));
        drop(first);
        assert!(dir.path().join(LOCK_FILE_NAME).exists());
        StorageLock::acquire(dir.path(), Duration::from_millis(100)).unwrap();
    }

    #[test]
    fn waiting_writer_excludes_later_writers() {
        let dir = TempDir::new().unwrap();
        let first = StorageLock::acquire(dir.path(), Duration::from_millis(100)).unwrap();
        let waiter = {
            let path = dir.path().to_path_buf();
            thread::spawn(move || StorageLock::acquire(&path, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(200));
        drop(first);
        let second = waiter.join().unwrap().unwrap();

        let err = StorageLock::acquire(dir.path(), Duration::from_millis(150)).unwrap_err();
        assert!(matches!(err, StorageError::Busy(_)));
        drop(second);
        StorageLock::acquire(dir.path(), Duration::from_millis(100)).unwrap();
    }

    #[test]
    fn rollback_locks_the_storage_root() {
        let root = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        let mut config = StorageConfig::with_path(root.path());
        config.sqldb_path = elsewhere.path().join("sql.db");
        config.busy_timeout = Duration::from_millis(100);
        drop(open_database(&config.sqldb_file(), false, config.busy_timeout).unwrap());

        let held = StorageLock::acquire(root.path(), Duration::from_millis(100)).unwrap();
        let err = rollback_database(&config, 1).unwrap_err();
        assert!(matches!(err, StorageError::Busy(_)));
        drop(held);
        rollback_database(&config, 1).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn world_writable_directory_is_refused() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let storage = dir.path().join("sota");
        fs::create_dir(&storage).unwrap();
        fs::set_permissions(&storage, fs::Permissions::from_mode(0o777)).unwrap();
        let err = prepare_directory(&storage).unwrap_err();
        assert!(matches!(err, StorageError::UnsafePermissions(_)));
    }

    #[cfg(unix)]
    #[test]
    fn readable_directory_is_tightened() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let storage = dir.path().join("sota");
        fs::create_dir(&storage).unwrap();
        fs::set_permissions(&storage, fs::Permissions::from_mode(0o755)).unwrap();
        prepare_directory(&storage).unwrap();
        let mode = fs::metadata(&storage).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[cfg(unix)]
    #[test]
    fn missing_directory_is_created_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let storage = dir.path().join("a").join("b");
        prepare_directory(&storage).unwrap();
        let mode = fs::metadata(&storage).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
    }
}
