// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reader for the flat-file layout used before the SQL store, and the
//! one-time migration out of it.
//!
//! Layout under the storage root:
//!
//! ```text
//! metadata/{repo,director}/<N>.root.json   root chain
//! metadata/{repo,director}/root.json       unversioned root (older clients)
//! metadata/{repo,director}/<role>.json     latest-only roles
//! targets/<filename>                       downloaded images
//! device_id, is_registered, primary_ecu_serial, primary_ecu_hardware_id,
//! secondaries_list, misconfigured_ecus, installed_versions,
//! installation_result, key and TLS files
//! ```
//!
//! Nothing is modified while reading; [`LegacyStorage::clean_up_all`] is
//! only called once every record was written to the SQL store.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::hasher::{find_mismatch, MultiHasher};
use crate::metadata::{extract_version_untrusted, parse_role_file};
use crate::sql::SqlStorage;
use crate::types::{
    DeviceInstallationResult, EcuSerials, Hash, HashType, InstallationResult,
    InstalledVersionUpdateMode, MisconfiguredEcu, RepositoryType, Role, RootVersion, Target,
};

const DEVICE_ID: &str = "device_id";
const IS_REGISTERED: &str = "is_registered";
const PRIMARY_ECU_SERIAL: &str = "primary_ecu_serial";
const PRIMARY_ECU_HARDWARE_ID: &str = "primary_ecu_hardware_id";
const SECONDARIES_LIST: &str = "secondaries_list";
const MISCONFIGURED_ECUS: &str = "misconfigured_ecus";
const INSTALLED_VERSIONS: &str = "installed_versions";
const INSTALLATION_RESULT: &str = "installation_result";
const TARGETS_DIR: &str = "targets";

/// Legacy `installed_versions` entry.
#[derive(Debug, Deserialize)]
struct InstalledEntry {
    #[serde(default)]
    hashes: BTreeMap<String, String>,
    #[serde(default)]
    length: u64,
    #[serde(default)]
    is_current: bool,
}

/// Legacy `installation_result` document.
#[derive(Debug, Deserialize)]
struct LegacyOperationResult {
    #[serde(default)]
    id: String,
    #[serde(default)]
    result_code: u64,
    #[serde(default)]
    result_text: String,
}

/// Read-only view of the flat-file layout.
#[derive(Debug, Clone)]
pub struct LegacyStorage {
    config: StorageConfig,
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn read_optional_string(path: &Path) -> Result<Option<String>> {
    Ok(read_optional(path)?.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
}

fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %err, "could not remove legacy file");
        }
    }
}

fn malformed(name: &str, err: impl std::fmt::Display) -> StorageError {
    StorageError::LegacyMigration(format!("{name}: {err}"))
}

fn hostname() -> String {
    fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

impl LegacyStorage {
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }

    fn file(&self, name: &str) -> PathBuf {
        self.config.legacy_file(name)
    }

    fn meta_dir(&self, repo: RepositoryType) -> PathBuf {
        self.config.metadata_dir().join(repo.legacy_dir())
    }

    fn targets_dir(&self) -> PathBuf {
        self.config.path.join(TARGETS_DIR)
    }

    fn flat_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = [
            DEVICE_ID,
            IS_REGISTERED,
            PRIMARY_ECU_SERIAL,
            PRIMARY_ECU_HARDWARE_ID,
            SECONDARIES_LIST,
            MISCONFIGURED_ECUS,
            INSTALLED_VERSIONS,
            INSTALLATION_RESULT,
        ]
        .iter()
        .map(|name| self.file(name))
        .collect();
        files.extend([
            self.config.legacy_file(&self.config.uptane_public_key_path),
            self.config.legacy_file(&self.config.uptane_private_key_path),
            self.config.legacy_file(&self.config.tls_cacert_path),
            self.config.legacy_file(&self.config.tls_clientcert_path),
            self.config.legacy_file(&self.config.tls_pkey_path),
        ]);
        files
    }

    /// `true` when any legacy record exists.
    pub fn is_present(&self) -> bool {
        if self.flat_files().iter().any(|path| path.is_file()) {
            return true;
        }
        RepositoryType::all().into_iter().any(|repo| {
            fs::read_dir(self.meta_dir(repo))
                .map(|mut entries| entries.any(|entry| entry.is_ok()))
                .unwrap_or(false)
        })
    }

    /// Root documents of `repo` keyed by version.
    ///
    /// An unversioned `root.json` is filed under its self-declared version.
    pub fn root_versions(&self, repo: RepositoryType) -> Result<BTreeMap<i64, PathBuf>> {
        let dir = self.meta_dir(repo);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(err.into()),
        };
        let mut versions = BTreeMap::new();
        let mut unversioned = None;
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            match parse_role_file(name) {
                Some((Role::Root, Some(version))) => {
                    versions.insert(version, path);
                }
                Some((Role::Root, None)) => unversioned = Some(path),
                _ => {}
            }
        }
        if let Some(path) = unversioned {
            let payload = fs::read(&path)?;
            match extract_version_untrusted(&payload) {
                Some(version) if version >= 0 => {
                    versions.entry(version).or_insert(path);
                }
                _ => tracing::warn!(repo = %repo, "ignoring unversioned root without a version"),
            }
        }
        Ok(versions)
    }

    pub fn load_root(&self, repo: RepositoryType, version: RootVersion) -> Result<Option<Vec<u8>>> {
        let versions = self.root_versions(repo)?;
        let path = match version {
            RootVersion::Latest => versions.into_values().next_back(),
            RootVersion::Exact(version) => versions.get(&version).cloned(),
        };
        match path {
            Some(path) => read_optional(&path),
            None => Ok(None),
        }
    }

    pub fn load_non_root(&self, repo: RepositoryType, role: Role) -> Result<Option<Vec<u8>>> {
        if role == Role::Root {
            return self.load_root(repo, RootVersion::Latest);
        }
        read_optional(&self.meta_dir(repo).join(format!("{}.json", role.name())))
    }

    /// Public and private key, only when both files exist.
    pub fn load_primary_keys(&self) -> Result<Option<(String, String)>> {
        let public = read_optional_string(&self.config.legacy_file(&self.config.uptane_public_key_path))?;
        let private = read_optional_string(&self.config.legacy_file(&self.config.uptane_private_key_path))?;
        Ok(public.zip(private))
    }

    pub fn load_tls_ca(&self) -> Result<Option<Vec<u8>>> {
        read_optional(&self.config.legacy_file(&self.config.tls_cacert_path))
    }

    pub fn load_tls_cert(&self) -> Result<Option<Vec<u8>>> {
        read_optional(&self.config.legacy_file(&self.config.tls_clientcert_path))
    }

    pub fn load_tls_pkey(&self) -> Result<Option<Vec<u8>>> {
        read_optional(&self.config.legacy_file(&self.config.tls_pkey_path))
    }

    pub fn load_device_id(&self) -> Result<Option<String>> {
        read_optional_string(&self.file(DEVICE_ID))
    }

    /// Registration is signalled by the mere presence of the marker file.
    pub fn load_ecu_registered(&self) -> bool {
        self.file(IS_REGISTERED).exists()
    }

    /// Primary from its own files, then `secondaries_list` (`serial<TAB>hardware_id` lines).
    pub fn load_ecu_serials(&self) -> Result<Option<EcuSerials>> {
        let Some(serial) = read_optional_string(&self.file(PRIMARY_ECU_SERIAL))? else {
            return Ok(None);
        };
        let hardware_id = read_optional_string(&self.file(PRIMARY_ECU_HARDWARE_ID))?
            .unwrap_or_else(hostname);
        let mut serials = vec![(serial, hardware_id)];
        if let Some(list) = read_optional_string(&self.file(SECONDARIES_LIST))? {
            for line in list.lines().filter(|line| !line.is_empty()) {
                let (serial, hardware_id) = line
                    .split_once('\t')
                    .ok_or_else(|| malformed(SECONDARIES_LIST, format!("missing tab in '{line}'")))?;
                serials.push((serial.to_string(), hardware_id.to_string()));
            }
        }
        Ok(Some(serials))
    }

    pub fn load_misconfigured_ecus(&self) -> Result<Vec<MisconfiguredEcu>> {
        match read_optional(&self.file(MISCONFIGURED_ECUS))? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|err| malformed(MISCONFIGURED_ECUS, err)),
            None => Ok(Vec::new()),
        }
    }

    /// Installed images with their "current" flag.
    ///
    /// Accepts both the per-filename object form and the older
    /// `{sha256: filename}` map.
    pub fn load_installed_versions(&self) -> Result<Vec<(Target, bool)>> {
        let Some(bytes) = read_optional(&self.file(INSTALLED_VERSIONS))? else {
            return Ok(Vec::new());
        };
        let document: serde_json::Map<String, serde_json::Value> =
            serde_json::from_slice(&bytes).map_err(|err| malformed(INSTALLED_VERSIONS, err))?;
        let mut installed = Vec::with_capacity(document.len());
        for (key, value) in document {
            match value {
                serde_json::Value::String(filename) => {
                    installed.push((Target::new(filename, 0, vec![Hash::new(HashType::Sha256, key)]), false));
                }
                value => {
                    let entry: InstalledEntry =
                        serde_json::from_value(value).map_err(|err| malformed(INSTALLED_VERSIONS, err))?;
                    let hashes = entry
                        .hashes
                        .iter()
                        .filter_map(|(kind, digest)| HashType::parse(kind).map(|kind| Hash::new(kind, digest)))
                        .collect();
                    installed.push((Target::new(key, entry.length, hashes), entry.is_current));
                }
            }
        }
        Ok(installed)
    }

    pub fn load_installation_result(&self) -> Result<Option<DeviceInstallationResult>> {
        let Some(bytes) = read_optional(&self.file(INSTALLATION_RESULT))? else {
            return Ok(None);
        };
        let legacy: LegacyOperationResult =
            serde_json::from_slice(&bytes).map_err(|err| malformed(INSTALLATION_RESULT, err))?;
        Ok(Some(DeviceInstallationResult {
            result: InstallationResult::new(
                legacy.result_code == 0,
                legacy.result_code.to_string(),
                legacy.result_text,
            ),
            raw_report: String::new(),
            correlation_id: legacy.id,
        }))
    }

    /// Path of a legacy image, by its (untrusted) filename.
    ///
    /// Names containing path separators are never resolved.
    fn legacy_image(&self, filename: &str) -> Option<PathBuf> {
        let plain = !filename.is_empty()
            && filename != "."
            && filename != ".."
            && !filename.contains('/')
            && !filename.contains('\\');
        plain.then(|| self.targets_dir().join(filename))
    }

    /// Removes every legacy file and directory.
    pub fn clean_up_all(&self) -> Result<()> {
        for path in self.flat_files() {
            remove_quietly(&path);
        }
        for dir in [self.config.metadata_dir(), self.targets_dir()] {
            match fs::remove_dir_all(&dir) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
                _ => {}
            }
        }
        tracing::info!(path = %self.config.path.display(), "removed legacy storage files");
        Ok(())
    }
}

/// Copies every legacy record into `sql`, then deletes the legacy files.
///
/// Returns `Ok(false)` when there was nothing to migrate. On error the
/// legacy files are left untouched.
pub fn migrate_legacy(legacy: &LegacyStorage, sql: &SqlStorage) -> Result<bool> {
    if !legacy.is_present() {
        return Ok(false);
    }
    if sql.is_readonly() {
        return Err(StorageError::LegacyMigration(
            "the database is opened readonly".to_string(),
        ));
    }
    tracing::info!(path = %sql.config().path.display(), "migrating legacy filesystem storage");

    if let Some((public, private)) = legacy.load_primary_keys()? {
        sql.store_primary_keys(&public, &private)?;
    }
    if let Some(ca) = legacy.load_tls_ca()? {
        sql.store_tls_ca(&ca)?;
    }
    if let Some(cert) = legacy.load_tls_cert()? {
        sql.store_tls_cert(&cert)?;
    }
    if let Some(pkey) = legacy.load_tls_pkey()? {
        sql.store_tls_pkey(&pkey)?;
    }
    if let Some(device_id) = legacy.load_device_id()? {
        sql.store_device_id(&device_id)?;
    }
    if let Some(serials) = legacy.load_ecu_serials()? {
        sql.store_ecu_serials(&serials)?;
    }
    if legacy.load_ecu_registered() {
        sql.store_ecu_registered()?;
    }
    let misconfigured = legacy.load_misconfigured_ecus()?;
    if !misconfigured.is_empty() {
        sql.store_misconfigured_ecus(&misconfigured)?;
    }
    if let Some(result) = legacy.load_installation_result()? {
        sql.store_device_installation_result(&result)?;
    }
    for (target, is_current) in legacy.load_installed_versions()? {
        let mode = if is_current {
            InstalledVersionUpdateMode::Current
        } else {
            InstalledVersionUpdateMode::None
        };
        sql.save_installed_version("", &target, mode)?;
        import_image(legacy, sql, &target)?;
    }

    for repo in RepositoryType::all() {
        for role in Role::non_root() {
            if let Some(payload) = legacy.load_non_root(repo, role)? {
                sql.store_non_root(&payload, repo, role)?;
            }
        }
        for (version, path) in legacy.root_versions(repo)? {
            sql.store_root(&fs::read(path)?, repo, version)?;
        }
    }

    legacy.clean_up_all()?;
    Ok(true)
}

/// Copies a legacy image into the blob store when it verifies against `target`.
fn import_image(legacy: &LegacyStorage, sql: &SqlStorage, target: &Target) -> Result<()> {
    if target.hashes().is_empty() || target.length() == 0 {
        return Ok(());
    }
    let Some(path) = legacy.legacy_image(target.filename()) else {
        return Ok(());
    };
    let mut file = match File::open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    if file.metadata()?.len() != target.length() {
        tracing::warn!(filename = %target.filename(), "legacy image length differs, not imported");
        return Ok(());
    }

    let mut handle = sql.allocate_target_file(target)?;
    let mut hasher = MultiHasher::for_target(target);
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = io::Read::read(&mut file, &mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        handle.feed(&buffer[..read])?;
    }
    if let Some(expected) = find_mismatch(target, &hasher.finalize()) {
        tracing::warn!(filename = %target.filename(), expected = %expected, "legacy image does not verify, not imported");
        return handle.abort();
    }
    handle.commit()?;
    tracing::debug!(filename = %target.filename(), "imported legacy image");
    Ok(())
}
