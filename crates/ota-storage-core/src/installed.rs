// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Installed-version log and installation results.
//!
//! `installed_versions` doubles as an installation log: rows are only ever
//! flagged, never deleted, except by [`SqlStorage::clear_installed_versions`].
//! Each ECU has at most one current and at most one pending row.

use rusqlite::{params, OptionalExtension, Row, Transaction};

use crate::error::Result;
use crate::sql::SqlStorage;
use crate::types::{
    decode_hashes, encode_hashes, DeviceInstallationResult, InstallationResult,
    InstalledVersionUpdateMode, Target,
};

const TARGET_COLUMNS: &str = "name, hashes, length, correlation_id, custom_meta";

fn target_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Target> {
    let name: String = row.get(offset)?;
    let hashes: String = row.get(offset + 1)?;
    let length: i64 = row.get(offset + 2)?;
    let correlation_id: String = row.get(offset + 3)?;
    let custom: String = row.get(offset + 4)?;
    let mut target = Target::new(name, length.max(0) as u64, decode_hashes(&hashes))
        .with_correlation_id(correlation_id);
    if !custom.is_empty() {
        match serde_json::from_str(&custom) {
            Ok(value) => target = target.with_custom(value),
            Err(err) => tracing::warn!(error = %err, "ignoring unreadable custom metadata"),
        }
    }
    Ok(target)
}

/// Resolves an empty serial to the primary ECU; stays empty if none is known yet.
fn resolve_serial(tx: &Transaction<'_>, ecu_serial: &str) -> Result<String> {
    if !ecu_serial.is_empty() {
        return Ok(ecu_serial.to_string());
    }
    let primary: Option<String> = tx
        .query_row(
            "SELECT serial FROM ecu_serials WHERE is_primary = 1 LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(primary.unwrap_or_default())
}

impl SqlStorage {
    /// Records `target` for `ecu_serial` and updates the current/pending flags.
    ///
    /// An empty serial means the primary ECU. When the primary is not known
    /// yet the row is stored with an empty serial and attached later by
    /// [`SqlStorage::store_ecu_serials`]. Saving the most recently logged
    /// image again updates that row instead of appending a new one.
    pub fn save_installed_version(
        &self,
        ecu_serial: &str,
        target: &Target,
        mode: InstalledVersionUpdateMode,
    ) -> Result<()> {
        let custom = match target.custom() {
            Some(value) => serde_json::to_string(value)?,
            None => String::new(),
        };
        self.write("save_installed_version", |tx| {
            let serial = resolve_serial(tx, ecu_serial)?;
            let last: Option<(i64, String, String, bool)> = tx
                .query_row(
                    "SELECT id, sha256, name, was_installed FROM installed_versions WHERE ecu_serial = ?1 ORDER BY id DESC LIMIT 1",
                    params![serial],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;

            match mode {
                InstalledVersionUpdateMode::Current => {
                    tx.execute(
                        "UPDATE installed_versions SET is_current = 0, is_pending = 0 WHERE ecu_serial = ?1",
                        params![serial],
                    )?;
                }
                InstalledVersionUpdateMode::Pending => {
                    tx.execute(
                        "UPDATE installed_versions SET is_pending = 0 WHERE ecu_serial = ?1",
                        params![serial],
                    )?;
                }
                InstalledVersionUpdateMode::None => {}
            }

            let is_current = mode == InstalledVersionUpdateMode::Current;
            let is_pending = mode == InstalledVersionUpdateMode::Pending;
            match last {
                Some((id, sha256, name, was_installed))
                    if sha256 == target.sha256_hash() && name == target.filename() =>
                {
                    tx.execute(
                        "UPDATE installed_versions SET correlation_id = ?1, is_current = ?2, is_pending = ?3, was_installed = ?4 WHERE id = ?5",
                        params![
                            target.correlation_id(),
                            is_current,
                            is_pending,
                            was_installed || is_current,
                            id
                        ],
                    )?;
                }
                _ => {
                    tx.execute(
                        "INSERT INTO installed_versions(ecu_serial, sha256, name, hashes, length, custom_meta, correlation_id, is_current, is_pending, was_installed) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                        params![
                            serial,
                            target.sha256_hash(),
                            target.filename(),
                            encode_hashes(target.hashes()),
                            target.length() as i64,
                            custom,
                            target.correlation_id(),
                            is_current,
                            is_pending,
                            is_current
                        ],
                    )?;
                }
            }
            tracing::debug!(ecu = %serial, filename = %target.filename(), ?mode, "saved installed version");
            Ok(())
        })
    }

    /// Returns `(current, pending)` for one ECU (empty serial: the primary).
    pub fn load_installed_versions(
        &self,
        ecu_serial: &str,
    ) -> Result<(Option<Target>, Option<Target>)> {
        let serial = self.serial_or_primary(ecu_serial)?;
        self.read("load_installed_versions", |conn| {
            let load = |flag: &str| -> rusqlite::Result<Option<Target>> {
                conn.query_row(
                    &format!(
                        "SELECT {TARGET_COLUMNS} FROM installed_versions WHERE ecu_serial = ?1 AND {flag} = 1 ORDER BY id DESC LIMIT 1"
                    ),
                    params![serial],
                    |row| target_from_row(row, 0),
                )
                .optional()
            };
            Ok((load("is_current")?, load("is_pending")?))
        })
    }

    /// Every logged version of one ECU in insertion order.
    pub fn load_installation_log(&self, ecu_serial: &str, only_installed: bool) -> Result<Vec<Target>> {
        let serial = self.serial_or_primary(ecu_serial)?;
        self.read("load_installation_log", |conn| {
            let filter = if only_installed { " AND was_installed = 1" } else { "" };
            let mut statement = conn.prepare(&format!(
                "SELECT {TARGET_COLUMNS} FROM installed_versions WHERE ecu_serial = ?1{filter} ORDER BY id"
            ))?;
            let log = statement
                .query_map(params![serial], |row| target_from_row(row, 0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(log)
        })
    }

    pub fn has_pending_install(&self) -> Result<bool> {
        self.read("has_pending_install", |conn| {
            let pending: i64 = conn.query_row(
                "SELECT count(*) FROM installed_versions WHERE is_pending = 1",
                [],
                |row| row.get(0),
            )?;
            Ok(pending > 0)
        })
    }

    /// ECUs with a pending installation, as `(serial, target)`.
    pub fn get_pending_ecus(&self) -> Result<Vec<(String, Target)>> {
        self.read("get_pending_ecus", |conn| {
            let mut statement = conn.prepare(&format!(
                "SELECT ecu_serial, {TARGET_COLUMNS} FROM installed_versions WHERE is_pending = 1 ORDER BY id"
            ))?;
            let pending = statement
                .query_map([], |row| Ok((row.get::<_, String>(0)?, target_from_row(row, 1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(pending)
        })
    }

    pub fn clear_installed_versions(&self) -> Result<()> {
        self.write("clear_installed_versions", |tx| {
            tx.execute("DELETE FROM installed_versions", [])?;
            Ok(())
        })
    }

    pub fn save_ecu_installation_result(&self, ecu_serial: &str, result: &InstallationResult) -> Result<()> {
        self.write("save_ecu_installation_result", |tx| {
            tx.execute(
                "INSERT OR REPLACE INTO ecu_installation_results(ecu_serial, success, result_code, description) VALUES (?1, ?2, ?3, ?4)",
                params![ecu_serial, result.success, result.result_code, result.description],
            )?;
            Ok(())
        })
    }

    pub fn load_ecu_installation_results(&self) -> Result<Vec<(String, InstallationResult)>> {
        self.read("load_ecu_installation_results", |conn| {
            let mut statement = conn.prepare(
                "SELECT ecu_serial, success, result_code, description FROM ecu_installation_results ORDER BY rowid",
            )?;
            let results = statement
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        InstallationResult::new(row.get(1)?, row.get::<_, String>(2)?, row.get::<_, String>(3)?),
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(results)
        })
    }

    pub fn store_device_installation_result(&self, result: &DeviceInstallationResult) -> Result<()> {
        self.write("store_device_installation_result", |tx| {
            tx.execute(
                "INSERT OR REPLACE INTO device_installation_result(unique_mark, success, result_code, description, raw_report, correlation_id) VALUES (0, ?1, ?2, ?3, ?4, ?5)",
                params![
                    result.result.success,
                    result.result.result_code,
                    result.result.description,
                    result.raw_report,
                    result.correlation_id
                ],
            )?;
            Ok(())
        })
    }

    pub fn load_device_installation_result(&self) -> Result<Option<DeviceInstallationResult>> {
        self.read("load_device_installation_result", |conn| {
            Ok(conn
                .query_row(
                    "SELECT success, result_code, description, raw_report, correlation_id FROM device_installation_result LIMIT 1",
                    [],
                    |row| {
                        Ok(DeviceInstallationResult {
                            result: InstallationResult::new(
                                row.get(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                            ),
                            raw_report: row.get(3)?,
                            correlation_id: row.get(4)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    pub fn save_ecu_report_counter(&self, ecu_serial: &str, counter: i64) -> Result<()> {
        self.write("save_ecu_report_counter", |tx| {
            tx.execute(
                "INSERT OR REPLACE INTO ecu_report_counter(ecu_serial, counter) VALUES (?1, ?2)",
                params![ecu_serial, counter],
            )?;
            Ok(())
        })
    }

    pub fn load_ecu_report_counters(&self) -> Result<Vec<(String, i64)>> {
        self.read("load_ecu_report_counters", |conn| {
            let mut statement =
                conn.prepare("SELECT ecu_serial, counter FROM ecu_report_counter ORDER BY ecu_serial")?;
            let counters = statement
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(counters)
        })
    }

    /// Clears per-ECU and device results together.
    pub fn clear_installation_results(&self) -> Result<()> {
        self.write("clear_installation_results", |tx| {
            tx.execute("DELETE FROM ecu_installation_results", [])?;
            tx.execute("DELETE FROM device_installation_result", [])?;
            Ok(())
        })
    }

    fn serial_or_primary(&self, ecu_serial: &str) -> Result<String> {
        if !ecu_serial.is_empty() {
            return Ok(ecu_serial.to_string());
        }
        Ok(self.load_primary_serial()?.unwrap_or_default())
    }
}
