// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Storage behaviour across process restarts, readers and schema changes.

mod common;

use std::fs;

use ota_storage_core::{
    open_storage, rollback_database, InstalledVersionUpdateMode, RepositoryType, Role,
    RootVersion, SchemaVersion, SqlStorage, StorageError, CURRENT_SCHEMA_VERSION,
};
use tempfile::TempDir;

#[test]
fn state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let data = common::image_bytes(2048);
    let target = common::target_for("app.img", &data);
    {
        let storage = open_storage(common::config(&dir), false).unwrap();
        storage.store_device_id("device-1").unwrap();
        storage
            .store_ecu_serials(&[("primary".to_string(), "board".to_string())])
            .unwrap();
        storage.store_root(&common::root_document(1), RepositoryType::Director, 1).unwrap();
        storage.store_root(&common::root_document(2), RepositoryType::Director, 2).unwrap();
        storage
            .store_non_root(b"{\"targets\":{}}", RepositoryType::Director, Role::Targets)
            .unwrap();
        storage
            .save_installed_version("", &target, InstalledVersionUpdateMode::Pending)
            .unwrap();
        common::write_partial(&storage, &target, &data, 1000);
    }

    let storage = open_storage(common::config(&dir), false).unwrap();
    assert_eq!(storage.load_device_id().unwrap().as_deref(), Some("device-1"));
    assert_eq!(
        storage.load_root(RepositoryType::Director, RootVersion::Latest).unwrap(),
        Some(common::root_document(2))
    );
    assert_eq!(
        storage.load_root(RepositoryType::Director, RootVersion::Exact(1)).unwrap(),
        Some(common::root_document(1))
    );
    assert!(storage.has_pending_install().unwrap());
    let (_, pending) = storage.load_installed_versions("primary").unwrap();
    assert_eq!(pending.unwrap().filename(), "app.img");
    assert_eq!(storage.check_target_file(&target).unwrap().unwrap().size, 1000);
}

#[test]
fn readers_coexist_with_the_writer() {
    let dir = TempDir::new().unwrap();
    let writer = common::open(&dir);
    writer.store_device_id("device-1").unwrap();

    let reader = SqlStorage::open(common::config(&dir), true).unwrap();
    assert!(reader.is_readonly());
    assert_eq!(reader.load_device_id().unwrap().as_deref(), Some("device-1"));

    let second_writer = SqlStorage::open(common::config(&dir), false).unwrap_err();
    assert!(matches!(second_writer, StorageError::Busy(_)));

    // a reader cannot write even while no writer is around
    drop(writer);
    assert!(reader.store_device_id("device-2").is_err());
}

#[test]
fn rollback_then_reopen_migrates_forward_again() {
    let dir = TempDir::new().unwrap();
    let target = common::target_for("app.img", b"abc");
    {
        let storage = common::open(&dir);
        storage.store_device_id("device-1").unwrap();
        storage
            .save_installed_version("primary", &target, InstalledVersionUpdateMode::Current)
            .unwrap();
    }
    let config = common::config(&dir);
    rollback_database(&config, 1).unwrap();

    let readonly = SqlStorage::open(common::config(&dir), true).unwrap_err();
    assert!(matches!(
        readonly,
        StorageError::ReadonlyMigration {
            found: SchemaVersion::Version(1),
            ..
        }
    ));

    let storage = common::open(&dir);
    assert_eq!(
        storage.schema_version().unwrap(),
        SchemaVersion::Version(CURRENT_SCHEMA_VERSION)
    );
    assert_eq!(storage.load_device_id().unwrap().as_deref(), Some("device-1"));
    let (current, _) = storage.load_installed_versions("primary").unwrap();
    assert_eq!(current.unwrap().filename(), "app.img");
}

#[test]
fn readonly_migration_leaves_file_untouched() {
    let dir = TempDir::new().unwrap();
    drop(common::open(&dir));
    let config = common::config(&dir);
    rollback_database(&config, 2).unwrap();
    let before = fs::read(config.sqldb_file()).unwrap();

    let err = open_storage(common::config(&dir), true).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(fs::read(config.sqldb_file()).unwrap(), before);
}

#[test]
fn legacy_layout_is_imported_on_first_open() {
    let dir = TempDir::new().unwrap();
    let director = dir.path().join("metadata").join("director");
    fs::create_dir_all(&director).unwrap();
    fs::write(director.join("1.root.json"), common::root_document(1)).unwrap();
    fs::write(director.join("2.root.json"), common::root_document(2)).unwrap();
    fs::write(director.join("targets.json"), b"{}").unwrap();
    fs::write(dir.path().join("device_id"), "legacy-device").unwrap();
    fs::write(dir.path().join("primary_ecu_serial"), "primary").unwrap();
    fs::write(dir.path().join("primary_ecu_hardware_id"), "board").unwrap();
    fs::write(dir.path().join("secondaries_list"), "sec\thw\n").unwrap();

    let storage = open_storage(common::config(&dir), false).unwrap();
    assert_eq!(storage.load_device_id().unwrap().as_deref(), Some("legacy-device"));
    assert_eq!(storage.load_ecu_serials().unwrap().unwrap().len(), 2);
    assert_eq!(storage.latest_root_version(RepositoryType::Director).unwrap(), Some(2));
    assert_eq!(
        storage.load_non_root(RepositoryType::Director, Role::Targets).unwrap(),
        Some(b"{}".to_vec())
    );
    assert!(!dir.path().join("device_id").exists());
    assert!(!dir.path().join("metadata").exists());
}
