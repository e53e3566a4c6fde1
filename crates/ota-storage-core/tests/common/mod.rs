// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixtures shared by the integration tests.
#![allow(dead_code)]

use std::io::Read;
use std::time::Duration;

use ota_storage_core::{HashType, MultiHasher, SqlStorage, StorageConfig, Target};
use tempfile::TempDir;

/// Storage configuration rooted in `dir` with a short busy window.
pub fn config(dir: &TempDir) -> StorageConfig {
    let mut config = StorageConfig::with_path(dir.path());
    config.busy_timeout = Duration::from_millis(200);
    config
}

pub fn open(dir: &TempDir) -> SqlStorage {
    SqlStorage::open(config(dir), false).expect("open writable storage")
}

/// Deterministic, non-repeating-looking image bytes.
pub fn image_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + 7) % 251) as u8).collect()
}

/// Target declaring sha256 and sha512 of `data`.
pub fn target_for(filename: &str, data: &[u8]) -> Target {
    let mut hasher = MultiHasher::new([HashType::Sha256, HashType::Sha512]);
    hasher.update(data);
    Target::new(filename, data.len() as u64, hasher.finalize())
}

/// Signed-looking root document declaring `version`.
pub fn root_document(version: i64) -> Vec<u8> {
    format!(r#"{{"signatures":[],"signed":{{"_type":"Root","version":{version},"keys":{{}}}}}}"#)
        .into_bytes()
}

/// Bytes recorded for `target`.
pub fn stored_bytes(storage: &SqlStorage, target: &Target) -> Vec<u8> {
    let mut out = Vec::new();
    storage
        .open_target_file(target)
        .expect("stored target")
        .read_to_end(&mut out)
        .expect("read stored target");
    out
}

/// Leaves `data[..n]` as a closed, resumable blob.
pub fn write_partial(storage: &SqlStorage, target: &Target, data: &[u8], n: usize) {
    let mut handle = storage.allocate_target_file(target).expect("allocate");
    handle.feed(&data[..n]).expect("feed");
    handle.close().expect("close");
}
