// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Device identity, credentials and ECU bookkeeping.
//!
//! Most tables hold at most one row (`unique_mark = 0`). An absent row
//! means "not provisioned yet" and is reported as `Ok(None)` or `false`.

use rusqlite::{params, OptionalExtension};

use crate::error::{Result, StorageError};
use crate::sql::SqlStorage;
use crate::types::{EcuSerials, EcuState, MisconfiguredEcu};

/// TLS client material; any part may be missing while provisioning is in progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsCredentials {
    pub ca: Option<Vec<u8>>,
    pub cert: Option<Vec<u8>>,
    pub pkey: Option<Vec<u8>>,
}

#[derive(Clone, Copy)]
enum TlsColumn {
    Ca,
    Cert,
    Pkey,
}

impl TlsColumn {
    fn name(self) -> &'static str {
        match self {
            TlsColumn::Ca => "ca_cert",
            TlsColumn::Cert => "client_cert",
            TlsColumn::Pkey => "client_pkey",
        }
    }
}

impl SqlStorage {
    pub fn store_primary_keys(&self, public: &str, private: &str) -> Result<()> {
        self.write("store_primary_keys", |tx| {
            tx.execute(
                "INSERT OR REPLACE INTO primary_keys(unique_mark, public, private) VALUES (0, ?1, ?2)",
                params![public, private],
            )?;
            Ok(())
        })
    }

    /// Returns `(public, private)` when both halves are stored.
    pub fn load_primary_keys(&self) -> Result<Option<(String, String)>> {
        self.read("load_primary_keys", |conn| {
            let keys = conn
                .query_row("SELECT public, private FROM primary_keys LIMIT 1", [], |row| {
                    Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?))
                })
                .optional()?;
            Ok(match keys {
                Some((Some(public), Some(private))) => Some((public, private)),
                _ => None,
            })
        })
    }

    pub fn load_primary_public(&self) -> Result<Option<String>> {
        self.load_primary_column("public")
    }

    pub fn load_primary_private(&self) -> Result<Option<String>> {
        self.load_primary_column("private")
    }

    fn load_primary_column(&self, column: &'static str) -> Result<Option<String>> {
        self.read("load_primary_key", |conn| {
            let value = conn
                .query_row(&format!("SELECT {column} FROM primary_keys LIMIT 1"), [], |row| {
                    row.get::<_, Option<String>>(0)
                })
                .optional()?;
            Ok(value.flatten())
        })
    }

    pub fn clear_primary_keys(&self) -> Result<()> {
        self.write("clear_primary_keys", |tx| {
            tx.execute("DELETE FROM primary_keys", [])?;
            Ok(())
        })
    }

    pub fn store_tls_creds(&self, ca: &[u8], cert: &[u8], pkey: &[u8]) -> Result<()> {
        self.write("store_tls_creds", |tx| {
            tx.execute(
                "INSERT OR REPLACE INTO tls_creds(unique_mark, ca_cert, client_cert, client_pkey) VALUES (0, ?1, ?2, ?3)",
                params![ca, cert, pkey],
            )?;
            Ok(())
        })
    }

    pub fn store_tls_ca(&self, ca: &[u8]) -> Result<()> {
        self.store_tls_column(TlsColumn::Ca, ca)
    }

    pub fn store_tls_cert(&self, cert: &[u8]) -> Result<()> {
        self.store_tls_column(TlsColumn::Cert, cert)
    }

    pub fn store_tls_pkey(&self, pkey: &[u8]) -> Result<()> {
        self.store_tls_column(TlsColumn::Pkey, pkey)
    }

    fn store_tls_column(&self, column: TlsColumn, value: &[u8]) -> Result<()> {
        let name = column.name();
        self.write("store_tls_column", |tx| {
            let rows: i64 = tx.query_row("SELECT count(*) FROM tls_creds", [], |row| row.get(0))?;
            if rows == 0 {
                tx.execute(
                    &format!("INSERT INTO tls_creds(unique_mark, {name}) VALUES (0, ?1)"),
                    params![value],
                )?;
            } else {
                tx.execute(&format!("UPDATE tls_creds SET {name} = ?1"), params![value])?;
            }
            Ok(())
        })
    }

    /// Loads the full credential set; `Ok(None)` when nothing was provisioned.
    pub fn load_tls_creds(&self) -> Result<Option<TlsCredentials>> {
        self.read("load_tls_creds", |conn| {
            Ok(conn
                .query_row(
                    "SELECT ca_cert, client_cert, client_pkey FROM tls_creds LIMIT 1",
                    [],
                    |row| {
                        Ok(TlsCredentials {
                            ca: row.get(0)?,
                            cert: row.get(1)?,
                            pkey: row.get(2)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    pub fn load_tls_ca(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.load_tls_creds()?.and_then(|creds| creds.ca))
    }

    pub fn load_tls_cert(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.load_tls_creds()?.and_then(|creds| creds.cert))
    }

    pub fn load_tls_pkey(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.load_tls_creds()?.and_then(|creds| creds.pkey))
    }

    pub fn clear_tls_creds(&self) -> Result<()> {
        self.write("clear_tls_creds", |tx| {
            tx.execute("DELETE FROM tls_creds", [])?;
            Ok(())
        })
    }

    /// Stores the device id and resets the registration flag.
    pub fn store_device_id(&self, device_id: &str) -> Result<()> {
        self.write("store_device_id", |tx| {
            tx.execute(
                "INSERT OR REPLACE INTO device_info(unique_mark, device_id, is_registered) VALUES (0, ?1, 0)",
                params![device_id],
            )?;
            Ok(())
        })
    }

    pub fn load_device_id(&self) -> Result<Option<String>> {
        self.read("load_device_id", |conn| {
            Ok(conn
                .query_row("SELECT device_id FROM device_info LIMIT 1", [], |row| row.get(0))
                .optional()?)
        })
    }

    pub fn clear_device_id(&self) -> Result<()> {
        self.write("clear_device_id", |tx| {
            tx.execute("DELETE FROM device_info", [])?;
            Ok(())
        })
    }

    /// Marks the device registered; requires exactly one stored identity.
    pub fn store_ecu_registered(&self) -> Result<()> {
        self.write("store_ecu_registered", |tx| {
            let rows: i64 =
                tx.query_row("SELECT count(*) FROM device_info", [], |row| row.get(0))?;
            if rows != 1 {
                return Err(StorageError::DeviceNotProvisioned(rows));
            }
            tx.execute("UPDATE device_info SET is_registered = 1", [])?;
            Ok(())
        })
    }

    pub fn load_ecu_registered(&self) -> Result<bool> {
        self.read("load_ecu_registered", |conn| {
            let registered: Option<bool> = conn
                .query_row("SELECT is_registered FROM device_info LIMIT 1", [], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(registered.unwrap_or(false))
        })
    }

    pub fn clear_ecu_registered(&self) -> Result<()> {
        self.write("clear_ecu_registered", |tx| {
            tx.execute("UPDATE device_info SET is_registered = 0", [])?;
            Ok(())
        })
    }

    pub fn store_need_reboot(&self) -> Result<()> {
        self.write("store_need_reboot", |tx| {
            tx.execute(
                "INSERT OR REPLACE INTO need_reboot(unique_mark, flag) VALUES (0, 1)",
                [],
            )?;
            Ok(())
        })
    }

    /// Absent row reads as `false`.
    pub fn load_need_reboot(&self) -> Result<bool> {
        self.read("load_need_reboot", |conn| {
            let flag: Option<bool> = conn
                .query_row("SELECT flag FROM need_reboot LIMIT 1", [], |row| row.get(0))
                .optional()?;
            Ok(flag.unwrap_or(false))
        })
    }

    pub fn clear_need_reboot(&self) -> Result<()> {
        self.write("clear_need_reboot", |tx| {
            tx.execute("DELETE FROM need_reboot", [])?;
            Ok(())
        })
    }

    /// Replaces the ECU list; the first entry is the primary.
    ///
    /// Installed versions saved before the primary serial was known are
    /// attached to it in the same transaction.
    pub fn store_ecu_serials(&self, serials: &[(String, String)]) -> Result<()> {
        let Some((primary, _)) = serials.first() else {
            return Ok(());
        };
        self.write("store_ecu_serials", |tx| {
            tx.execute("DELETE FROM ecu_serials", [])?;
            let mut insert = tx.prepare(
                "INSERT INTO ecu_serials(id, serial, hardware_id, is_primary) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (index, (serial, hardware_id)) in serials.iter().enumerate() {
                insert.execute(params![index as i64, serial, hardware_id, index == 0])?;
            }
            tx.execute(
                "UPDATE installed_versions SET ecu_serial = ?1 WHERE ecu_serial = ''",
                params![primary],
            )?;
            Ok(())
        })?;
        tracing::debug!(primary = %primary, count = serials.len(), "stored ecu serials");
        Ok(())
    }

    /// Primary first; `Ok(None)` before provisioning.
    pub fn load_ecu_serials(&self) -> Result<Option<EcuSerials>> {
        self.read("load_ecu_serials", |conn| {
            let mut statement = conn.prepare(
                "SELECT serial, hardware_id FROM ecu_serials ORDER BY is_primary DESC, id",
            )?;
            let serials = statement
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<rusqlite::Result<EcuSerials>>()?;
            Ok(if serials.is_empty() { None } else { Some(serials) })
        })
    }

    /// Serial of the primary ECU, if provisioned.
    pub fn load_primary_serial(&self) -> Result<Option<String>> {
        self.read("load_primary_serial", |conn| {
            Ok(conn
                .query_row(
                    "SELECT serial FROM ecu_serials WHERE is_primary = 1 LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn clear_ecu_serials(&self) -> Result<()> {
        self.write("clear_ecu_serials", |tx| {
            tx.execute("DELETE FROM ecu_serials", [])?;
            Ok(())
        })
    }

    pub fn store_misconfigured_ecus(&self, ecus: &[MisconfiguredEcu]) -> Result<()> {
        self.write("store_misconfigured_ecus", |tx| {
            tx.execute("DELETE FROM misconfigured_ecus", [])?;
            let mut insert = tx.prepare(
                "INSERT INTO misconfigured_ecus(serial, hardware_id, state) VALUES (?1, ?2, ?3)",
            )?;
            for ecu in ecus {
                insert.execute(params![ecu.serial, ecu.hardware_id, i64::from(ecu.state)])?;
            }
            Ok(())
        })
    }

    pub fn load_misconfigured_ecus(&self) -> Result<Vec<MisconfiguredEcu>> {
        self.read("load_misconfigured_ecus", |conn| {
            let mut statement = conn
                .prepare("SELECT serial, hardware_id, state FROM misconfigured_ecus ORDER BY rowid")?;
            let rows = statement
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut ecus = Vec::with_capacity(rows.len());
            for (serial, hardware_id, state) in rows {
                match EcuState::try_from(state) {
                    Ok(state) => ecus.push(MisconfiguredEcu {
                        serial,
                        hardware_id,
                        state,
                    }),
                    Err(reason) => tracing::warn!(serial = %serial, reason = %reason, "skipping misconfigured ecu"),
                }
            }
            Ok(ecus)
        })
    }

    pub fn clear_misconfigured_ecus(&self) -> Result<()> {
        self.write("clear_misconfigured_ecus", |tx| {
            tx.execute("DELETE FROM misconfigured_ecus", [])?;
            Ok(())
        })
    }
}
