// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trust metadata persistence.
//!
//! Root documents form a chain and every version is kept. The other roles
//! are latest-only: a write replaces the previous row inside the same
//! transaction, so readers never observe a gap. Payloads are opaque bytes;
//! verification happens before they reach this module.

use rusqlite::types::ValueRef;
use rusqlite::{params, OptionalExtension, Row};

use crate::error::Result;
use crate::sql::SqlStorage;
use crate::types::{RepositoryType, Role, RootVersion, LATEST_VERSION};

/// Reads `signed.version` from a metadata document without verifying it.
pub fn extract_version_untrusted(payload: &[u8]) -> Option<i64> {
    let document: serde_json::Value = serde_json::from_slice(payload).ok()?;
    document.get("signed")?.get("version")?.as_i64()
}

/// Accepts both BLOB and TEXT columns; older writers stored documents as text.
fn meta_bytes(row: &Row<'_>, index: usize) -> rusqlite::Result<Vec<u8>> {
    match row.get_ref(index)? {
        ValueRef::Blob(bytes) | ValueRef::Text(bytes) => Ok(bytes.to_vec()),
        other => Err(rusqlite::Error::InvalidColumnType(
            index,
            "meta".to_string(),
            other.data_type(),
        )),
    }
}

impl SqlStorage {
    /// Stores a root document; other root versions are never touched.
    pub fn store_root(&self, payload: &[u8], repo: RepositoryType, version: i64) -> Result<()> {
        self.write("store_root", |tx| {
            tx.execute(
                "DELETE FROM meta WHERE repo = ?1 AND meta_type = ?2 AND version = ?3",
                params![repo.as_i64(), Role::Root.as_i64(), version],
            )?;
            tx.execute(
                "INSERT INTO meta(meta, repo, meta_type, version) VALUES (?1, ?2, ?3, ?4)",
                params![payload, repo.as_i64(), Role::Root.as_i64(), version],
            )?;
            Ok(())
        })?;
        tracing::debug!(repo = %repo, version, "stored root metadata");
        Ok(())
    }

    /// Stores the latest document of a non-root role, replacing the previous one.
    ///
    /// A root payload passed here is kept as a chain entry under its
    /// self-declared version instead.
    pub fn store_non_root(&self, payload: &[u8], repo: RepositoryType, role: Role) -> Result<()> {
        if role == Role::Root {
            let version = extract_version_untrusted(payload).unwrap_or(LATEST_VERSION);
            return self.store_root(payload, repo, version);
        }
        self.write("store_non_root", |tx| {
            tx.execute(
                "DELETE FROM meta WHERE repo = ?1 AND meta_type = ?2",
                params![repo.as_i64(), role.as_i64()],
            )?;
            tx.execute(
                "INSERT INTO meta(meta, repo, meta_type, version) VALUES (?1, ?2, ?3, ?4)",
                params![payload, repo.as_i64(), role.as_i64(), LATEST_VERSION],
            )?;
            Ok(())
        })?;
        tracing::debug!(repo = %repo, role = %role, "stored metadata");
        Ok(())
    }

    /// Loads a root document; `Ok(None)` when that version is not stored.
    pub fn load_root(&self, repo: RepositoryType, version: RootVersion) -> Result<Option<Vec<u8>>> {
        self.read("load_root", |conn| {
            let found = match version {
                RootVersion::Latest => conn
                    .query_row(
                        "SELECT meta FROM meta WHERE repo = ?1 AND meta_type = ?2 ORDER BY version DESC LIMIT 1",
                        params![repo.as_i64(), Role::Root.as_i64()],
                        |row| meta_bytes(row, 0),
                    )
                    .optional()?,
                RootVersion::Exact(version) => conn
                    .query_row(
                        "SELECT meta FROM meta WHERE repo = ?1 AND meta_type = ?2 AND version = ?3",
                        params![repo.as_i64(), Role::Root.as_i64(), version],
                        |row| meta_bytes(row, 0),
                    )
                    .optional()?,
            };
            Ok(found)
        })
    }

    pub fn load_latest_root(&self, repo: RepositoryType) -> Result<Option<Vec<u8>>> {
        self.load_root(repo, RootVersion::Latest)
    }

    /// Highest stored root version of `repo`.
    pub fn latest_root_version(&self, repo: RepositoryType) -> Result<Option<i64>> {
        self.read("latest_root_version", |conn| {
            Ok(conn.query_row(
                "SELECT MAX(version) FROM meta WHERE repo = ?1 AND meta_type = ?2",
                params![repo.as_i64(), Role::Root.as_i64()],
                |row| row.get::<_, Option<i64>>(0),
            )?)
        })
    }

    pub fn load_non_root(&self, repo: RepositoryType, role: Role) -> Result<Option<Vec<u8>>> {
        if role == Role::Root {
            return self.load_latest_root(repo);
        }
        self.read("load_non_root", |conn| {
            Ok(conn
                .query_row(
                    "SELECT meta FROM meta WHERE repo = ?1 AND meta_type = ?2 LIMIT 1",
                    params![repo.as_i64(), role.as_i64()],
                    |row| meta_bytes(row, 0),
                )
                .optional()?)
        })
    }

    /// Removes every non-root document of `repo`; root versions stay.
    pub fn clear_non_root_meta(&self, repo: RepositoryType) -> Result<()> {
        self.write("clear_non_root_meta", |tx| {
            tx.execute(
                "DELETE FROM meta WHERE repo = ?1 AND meta_type != ?2",
                params![repo.as_i64(), Role::Root.as_i64()],
            )?;
            Ok(())
        })
    }

    /// Removes all metadata of both repositories, delegations included.
    pub fn clear_metadata(&self) -> Result<()> {
        self.write("clear_metadata", |tx| {
            tx.execute("DELETE FROM meta", [])?;
            tx.execute("DELETE FROM delegations", [])?;
            Ok(())
        })?;
        tracing::info!("cleared all stored metadata");
        Ok(())
    }

    /// Stores a delegated targets document, replacing any previous one of that role.
    pub fn store_delegation(&self, payload: &[u8], role_name: &str) -> Result<()> {
        self.write("store_delegation", |tx| {
            tx.execute(
                "INSERT OR REPLACE INTO delegations(meta, role_name) VALUES (?1, ?2)",
                params![payload, role_name],
            )?;
            Ok(())
        })
    }

    pub fn load_delegation(&self, role_name: &str) -> Result<Option<Vec<u8>>> {
        self.read("load_delegation", |conn| {
            Ok(conn
                .query_row(
                    "SELECT meta FROM delegations WHERE role_name = ?1 LIMIT 1",
                    params![role_name],
                    |row| meta_bytes(row, 0),
                )
                .optional()?)
        })
    }

    /// All delegations as `(role_name, payload)`, ordered by role name.
    pub fn load_all_delegations(&self) -> Result<Vec<(String, Vec<u8>)>> {
        self.read("load_all_delegations", |conn| {
            let mut statement =
                conn.prepare("SELECT role_name, meta FROM delegations ORDER BY role_name")?;
            let rows = statement
                .query_map([], |row| Ok((row.get::<_, String>(0)?, meta_bytes(row, 1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn delete_delegation(&self, role_name: &str) -> Result<()> {
        self.write("delete_delegation", |tx| {
            tx.execute("DELETE FROM delegations WHERE role_name = ?1", params![role_name])?;
            Ok(())
        })
    }

    pub fn clear_delegations(&self) -> Result<()> {
        self.write("clear_delegations", |tx| {
            tx.execute("DELETE FROM delegations", [])?;
            Ok(())
        })
    }

    /// Repairs root rows stored with the latest-only sentinel version.
    ///
    /// Rows whose payload has no readable version are left as they are.
    pub(crate) fn clean_meta_version(&self) -> Result<()> {
        let repaired = self.write("clean_meta_version", |tx| {
            let mut statement = tx.prepare(
                "SELECT rowid, meta, repo FROM meta WHERE meta_type = ?1 AND version = ?2",
            )?;
            let broken = statement
                .query_map(params![Role::Root.as_i64(), LATEST_VERSION], |row| {
                    Ok((row.get::<_, i64>(0)?, meta_bytes(row, 1)?, row.get::<_, i64>(2)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut repaired = 0usize;
            for (rowid, payload, repo) in broken {
                let Some(version) = extract_version_untrusted(&payload) else {
                    tracing::warn!(repo, "root metadata without a readable version");
                    continue;
                };
                tx.execute(
                    "DELETE FROM meta WHERE repo = ?1 AND meta_type = ?2 AND version = ?3",
                    params![repo, Role::Root.as_i64(), version],
                )?;
                tx.execute(
                    "UPDATE meta SET version = ?1 WHERE rowid = ?2",
                    params![version, rowid],
                )?;
                repaired += 1;
            }
            Ok(repaired)
        })?;
        if repaired > 0 {
            tracing::info!(repaired, "repaired root metadata versions");
        }
        Ok(())
    }
}

/// Maps a metadata file name of the legacy layout (`3.root.json`, `targets.json`) to a role.
pub(crate) fn parse_role_file(name: &str) -> Option<(Role, Option<i64>)> {
    let stem = name.strip_suffix(".json")?;
    let (version, role) = match stem.split_once('.') {
        Some((version, role)) => (Some(version.parse::<i64>().ok()?), role),
        None => (None, stem),
    };
    let role = match role {
        "root" => Role::Root,
        "snapshot" => Role::Snapshot,
        "targets" => Role::Targets,
        "timestamp" => Role::Timestamp,
        _ => return None,
    };
    Some((role, version))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::config::StorageConfig;

    fn storage(dir: &TempDir) -> SqlStorage {
        let mut config = StorageConfig::with_path(dir.path());
        config.busy_timeout = Duration::from_millis(100);
        SqlStorage::open(config, false).unwrap()
    }

    fn root(version: i64) -> Vec<u8> {
        format!(r#"{{"signed":{{"_type":"Root","version":{version}}},"signatures":[]}}"#).into_bytes()
    }

    /// Older root versions survive and `Latest` picks the highest version.
    #[test]
    fn root_chain_is_retained() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        storage.store_root(&root(1), RepositoryType::Director, 1).unwrap();
        storage.store_root(&root(2), RepositoryType::Director, 2).unwrap();

        assert_eq!(
            storage.load_root(RepositoryType::Director, RootVersion::Latest).unwrap(),
            Some(root(2))
        );
        assert_eq!(
            storage.load_root(RepositoryType::Director, RootVersion::Exact(1)).unwrap(),
            Some(root(1))
        );
        assert_eq!(storage.latest_root_version(RepositoryType::Director).unwrap(), Some(2));
        assert_eq!(storage.load_latest_root(RepositoryType::Image).unwrap(), None);
        assert_eq!(storage.latest_root_version(RepositoryType::Image).unwrap(), None);
    }

    #[test]
    fn latest_root_ignores_insertion_order() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        storage.store_root(&root(3), RepositoryType::Image, 3).unwrap();
        storage.store_root(&root(1), RepositoryType::Image, 1).unwrap();
        assert_eq!(storage.load_latest_root(RepositoryType::Image).unwrap(), Some(root(3)));
    }

    #[test]
    fn storing_the_same_root_version_replaces_it() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        storage.store_root(b"first", RepositoryType::Image, 1).unwrap();
        storage.store_root(b"second", RepositoryType::Image, 1).unwrap();
        assert_eq!(
            storage.load_root(RepositoryType::Image, RootVersion::Exact(1)).unwrap(),
            Some(b"second".to_vec())
        );
    }

    #[test]
    fn non_root_is_latest_only_and_idempotent() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        storage.store_non_root(b"targets-v1", RepositoryType::Image, Role::Targets).unwrap();
        storage.store_non_root(b"targets-v1", RepositoryType::Image, Role::Targets).unwrap();
        storage.store_non_root(b"targets-v2", RepositoryType::Image, Role::Targets).unwrap();

        let rows: i64 = storage
            .read("count", |conn| {
                Ok(conn.query_row(
                    "SELECT count(*) FROM meta WHERE meta_type = ?1",
                    params![Role::Targets.as_i64()],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(rows, 1);
        assert_eq!(
            storage.load_non_root(RepositoryType::Image, Role::Targets).unwrap(),
            Some(b"targets-v2".to_vec())
        );
        assert_eq!(storage.load_non_root(RepositoryType::Director, Role::Targets).unwrap(), None);
    }

    #[test]
    fn clear_non_root_keeps_roots_and_other_repo() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        storage.store_root(&root(1), RepositoryType::Director, 1).unwrap();
        storage.store_non_root(b"ts", RepositoryType::Director, Role::Timestamp).unwrap();
        storage.store_non_root(b"snap", RepositoryType::Image, Role::Snapshot).unwrap();

        storage.clear_non_root_meta(RepositoryType::Director).unwrap();
        assert_eq!(storage.load_non_root(RepositoryType::Director, Role::Timestamp).unwrap(), None);
        assert!(storage.load_latest_root(RepositoryType::Director).unwrap().is_some());
        assert!(storage.load_non_root(RepositoryType::Image, Role::Snapshot).unwrap().is_some());

        storage.clear_metadata().unwrap();
        assert_eq!(storage.load_latest_root(RepositoryType::Director).unwrap(), None);
        assert_eq!(storage.load_non_root(RepositoryType::Image, Role::Snapshot).unwrap(), None);
    }

    #[test]
    fn delegations_are_latest_only_per_role() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        storage.store_delegation(b"a1", "role-a").unwrap();
        storage.store_delegation(b"a2", "role-a").unwrap();
        storage.store_delegation(b"b1", "role-b").unwrap();
        assert_eq!(storage.load_delegation("role-a").unwrap(), Some(b"a2".to_vec()));
        assert_eq!(
            storage.load_all_delegations().unwrap(),
            vec![
                ("role-a".to_string(), b"a2".to_vec()),
                ("role-b".to_string(), b"b1".to_vec())
            ]
        );
        storage.delete_delegation("role-a").unwrap();
        assert_eq!(storage.load_delegation("role-a").unwrap(), None);
        storage.clear_delegations().unwrap();
        assert!(storage.load_all_delegations().unwrap().is_empty());
    }

    #[test]
    fn sentinel_root_rows_are_repaired_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let storage = storage(&dir);
            storage
                .write("seed", |tx| {
                    tx.execute(
                        "INSERT INTO meta(meta, repo, meta_type, version) VALUES (?1, ?2, ?3, ?4)",
                        params![root(5), RepositoryType::Image.as_i64(), Role::Root.as_i64(), LATEST_VERSION],
                    )?;
                    Ok(())
                })
                .unwrap();
        }
        let storage = storage(&dir);
        assert_eq!(
            storage.load_root(RepositoryType::Image, RootVersion::Exact(5)).unwrap(),
            Some(root(5))
        );
        assert_eq!(
            storage.load_root(RepositoryType::Image, RootVersion::Exact(LATEST_VERSION)).unwrap(),
            None
        );
    }

    #[test]
    fn text_payloads_are_readable() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        storage
            .write("seed", |tx| {
                tx.execute(
                    "INSERT INTO meta(meta, repo, meta_type, version) VALUES ('{}', 0, 1, -1)",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        assert_eq!(
            storage.load_non_root(RepositoryType::Image, Role::Snapshot).unwrap(),
            Some(b"{}".to_vec())
        );
    }

    #[test]
    fn untrusted_version_extraction() {
        assert_eq!(extract_version_untrusted(&root(7)), Some(7));
        assert_eq!(extract_version_untrusted(b"{\"signed\":{}}"), None);
        assert_eq!(extract_version_untrusted(b"not json"), None);
    }

    #[test]
    fn legacy_role_file_names() {
        assert_eq!(parse_role_file("3.root.json"), Some((Role::Root, Some(3))));
        assert_eq!(parse_role_file("root.json"), Some((Role::Root, None)));
        assert_eq!(parse_role_file("targets.json"), Some((Role::Targets, None)));
        assert_eq!(parse_role_file("x.root.json"), None);
        assert_eq!(parse_role_file("root.json.bak"), None);
    }
}
