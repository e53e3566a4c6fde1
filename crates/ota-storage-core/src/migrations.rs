// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! SQL scripts describing every schema version.
//!
//! `SCHEMA_MIGRATIONS[k]` upgrades a database from version `k - 1` to `k`
//! (index 0 creates the first schema); `ROLLBACK_MIGRATIONS[k]` undoes it.
//! `CURRENT_SCHEMA` bootstraps an empty file straight to
//! [`CURRENT_SCHEMA_VERSION`] and must produce the same tables, with the same
//! column order, as running every migration in sequence.
//!
//! Scripts run inside a caller-owned transaction and must not contain
//! `BEGIN`/`COMMIT` statements.

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: i64 = 4;

const MIGRATION_0: &str = r#"
CREATE TABLE version(version INTEGER NOT NULL);
CREATE TABLE rollback_migrations(version_from INTEGER PRIMARY KEY, migration TEXT NOT NULL);
CREATE TABLE device_info(unique_mark INTEGER PRIMARY KEY CHECK (unique_mark = 0), device_id TEXT NOT NULL, is_registered INTEGER NOT NULL DEFAULT 0 CHECK (is_registered IN (0,1)));
CREATE TABLE ecu_serials(id INTEGER PRIMARY KEY, serial TEXT NOT NULL UNIQUE, hardware_id TEXT NOT NULL, is_primary INTEGER NOT NULL DEFAULT 0 CHECK (is_primary IN (0,1)));
CREATE TABLE primary_keys(unique_mark INTEGER PRIMARY KEY CHECK (unique_mark = 0), public TEXT, private TEXT);
CREATE TABLE tls_creds(unique_mark INTEGER PRIMARY KEY CHECK (unique_mark = 0), ca_cert BLOB, client_cert BLOB, client_pkey BLOB);
CREATE TABLE meta(meta BLOB NOT NULL, repo INTEGER NOT NULL, meta_type INTEGER NOT NULL, version INTEGER NOT NULL, UNIQUE(repo, meta_type, version));
CREATE TABLE target_images(filename TEXT PRIMARY KEY, image_name TEXT NOT NULL, sha256 TEXT NOT NULL DEFAULT '', sha512 TEXT NOT NULL DEFAULT '', real_size INTEGER NOT NULL DEFAULT 0);
CREATE TABLE installed_versions(id INTEGER PRIMARY KEY, ecu_serial TEXT NOT NULL, sha256 TEXT NOT NULL, name TEXT NOT NULL, hashes TEXT NOT NULL, length INTEGER NOT NULL DEFAULT 0, is_current INTEGER NOT NULL DEFAULT 0 CHECK (is_current IN (0,1)), is_pending INTEGER NOT NULL DEFAULT 0 CHECK (is_pending IN (0,1)));
INSERT INTO version VALUES(0);
"#;

const MIGRATION_1: &str = r#"
CREATE TABLE misconfigured_ecus(serial TEXT NOT NULL UNIQUE, hardware_id TEXT NOT NULL, state INTEGER NOT NULL DEFAULT 0);
CREATE TABLE need_reboot(unique_mark INTEGER PRIMARY KEY CHECK (unique_mark = 0), flag INTEGER NOT NULL DEFAULT 0);
DELETE FROM version;
INSERT INTO version VALUES(1);
"#;

const MIGRATION_2: &str = r#"
CREATE TABLE ecu_installation_results(ecu_serial TEXT NOT NULL PRIMARY KEY, success INTEGER NOT NULL, result_code TEXT NOT NULL, description TEXT NOT NULL);
CREATE TABLE device_installation_result(unique_mark INTEGER PRIMARY KEY CHECK (unique_mark = 0), success INTEGER NOT NULL, result_code TEXT NOT NULL, description TEXT NOT NULL, raw_report TEXT NOT NULL, correlation_id TEXT NOT NULL DEFAULT '');
CREATE TABLE ecu_report_counter(ecu_serial TEXT NOT NULL PRIMARY KEY, counter INTEGER NOT NULL DEFAULT 0);
DELETE FROM version;
INSERT INTO version VALUES(2);
"#;

const MIGRATION_3: &str = r#"
ALTER TABLE installed_versions ADD COLUMN correlation_id TEXT NOT NULL DEFAULT '';
ALTER TABLE installed_versions ADD COLUMN custom_meta TEXT NOT NULL DEFAULT '';
ALTER TABLE installed_versions ADD COLUMN was_installed INTEGER NOT NULL DEFAULT 0 CHECK (was_installed IN (0,1));
UPDATE installed_versions SET was_installed = is_current;
DELETE FROM version;
INSERT INTO version VALUES(3);
"#;

const MIGRATION_4: &str = r#"
CREATE TABLE delegations(meta BLOB NOT NULL, role_name TEXT NOT NULL UNIQUE);
DELETE FROM version;
INSERT INTO version VALUES(4);
"#;

const ROLLBACK_1: &str = r#"
DROP TABLE misconfigured_ecus;
DROP TABLE need_reboot;
DELETE FROM version;
INSERT INTO version VALUES(0);
"#;

const ROLLBACK_2: &str = r#"
DROP TABLE ecu_installation_results;
DROP TABLE device_installation_result;
DROP TABLE ecu_report_counter;
DELETE FROM version;
INSERT INTO version VALUES(1);
"#;

const ROLLBACK_3: &str = r#"
CREATE TABLE installed_versions_rollback(id INTEGER PRIMARY KEY, ecu_serial TEXT NOT NULL, sha256 TEXT NOT NULL, name TEXT NOT NULL, hashes TEXT NOT NULL, length INTEGER NOT NULL DEFAULT 0, is_current INTEGER NOT NULL DEFAULT 0 CHECK (is_current IN (0,1)), is_pending INTEGER NOT NULL DEFAULT 0 CHECK (is_pending IN (0,1)));
INSERT INTO installed_versions_rollback SELECT id, ecu_serial, sha256, name, hashes, length, is_current, is_pending FROM installed_versions;
DROP TABLE installed_versions;
ALTER TABLE installed_versions_rollback RENAME TO installed_versions;
DELETE FROM version;
INSERT INTO version VALUES(2);
"#;

const ROLLBACK_4: &str = r#"
DROP TABLE delegations;
DELETE FROM version;
INSERT INTO version VALUES(3);
"#;

/// Forward scripts indexed by the version they produce.
pub(crate) const SCHEMA_MIGRATIONS: [&str; 5] = [
    MIGRATION_0,
    MIGRATION_1,
    MIGRATION_2,
    MIGRATION_3,
    MIGRATION_4,
];

/// Inverse scripts indexed by the version they undo; index 0 is never used.
pub(crate) const ROLLBACK_MIGRATIONS: [&str; 5] = ["", ROLLBACK_1, ROLLBACK_2, ROLLBACK_3, ROLLBACK_4];

/// Full schema at [`CURRENT_SCHEMA_VERSION`], used to bootstrap empty files.
pub(crate) const CURRENT_SCHEMA: &str = r#"
CREATE TABLE version(version INTEGER NOT NULL);
CREATE TABLE rollback_migrations(version_from INTEGER PRIMARY KEY, migration TEXT NOT NULL);
CREATE TABLE device_info(unique_mark INTEGER PRIMARY KEY CHECK (unique_mark = 0), device_id TEXT NOT NULL, is_registered INTEGER NOT NULL DEFAULT 0 CHECK (is_registered IN (0,1)));
CREATE TABLE ecu_serials(id INTEGER PRIMARY KEY, serial TEXT NOT NULL UNIQUE, hardware_id TEXT NOT NULL, is_primary INTEGER NOT NULL DEFAULT 0 CHECK (is_primary IN (0,1)));
CREATE TABLE primary_keys(unique_mark INTEGER PRIMARY KEY CHECK (unique_mark = 0), public TEXT, private TEXT);
CREATE TABLE tls_creds(unique_mark INTEGER PRIMARY KEY CHECK (unique_mark = 0), ca_cert BLOB, client_cert BLOB, client_pkey BLOB);
CREATE TABLE meta(meta BLOB NOT NULL, repo INTEGER NOT NULL, meta_type INTEGER NOT NULL, version INTEGER NOT NULL, UNIQUE(repo, meta_type, version));
CREATE TABLE target_images(filename TEXT PRIMARY KEY, image_name TEXT NOT NULL, sha256 TEXT NOT NULL DEFAULT '', sha512 TEXT NOT NULL DEFAULT '', real_size INTEGER NOT NULL DEFAULT 0);
CREATE TABLE installed_versions(id INTEGER PRIMARY KEY, ecu_serial TEXT NOT NULL, sha256 TEXT NOT NULL, name TEXT NOT NULL, hashes TEXT NOT NULL, length INTEGER NOT NULL DEFAULT 0, is_current INTEGER NOT NULL DEFAULT 0 CHECK (is_current IN (0,1)), is_pending INTEGER NOT NULL DEFAULT 0 CHECK (is_pending IN (0,1)), correlation_id TEXT NOT NULL DEFAULT '', custom_meta TEXT NOT NULL DEFAULT '', was_installed INTEGER NOT NULL DEFAULT 0 CHECK (was_installed IN (0,1)));
CREATE TABLE misconfigured_ecus(serial TEXT NOT NULL UNIQUE, hardware_id TEXT NOT NULL, state INTEGER NOT NULL DEFAULT 0);
CREATE TABLE need_reboot(unique_mark INTEGER PRIMARY KEY CHECK (unique_mark = 0), flag INTEGER NOT NULL DEFAULT 0);
CREATE TABLE ecu_installation_results(ecu_serial TEXT NOT NULL PRIMARY KEY, success INTEGER NOT NULL, result_code TEXT NOT NULL, description TEXT NOT NULL);
CREATE TABLE device_installation_result(unique_mark INTEGER PRIMARY KEY CHECK (unique_mark = 0), success INTEGER NOT NULL, result_code TEXT NOT NULL, description TEXT NOT NULL, raw_report TEXT NOT NULL, correlation_id TEXT NOT NULL DEFAULT '');
CREATE TABLE ecu_report_counter(ecu_serial TEXT NOT NULL PRIMARY KEY, counter INTEGER NOT NULL DEFAULT 0);
CREATE TABLE delegations(meta BLOB NOT NULL, role_name TEXT NOT NULL UNIQUE);
INSERT INTO version VALUES(4);
"#;
