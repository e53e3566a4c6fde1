// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Value types shared by the store, the blob handles and the download engine.
//!
//! Targets are built from trusted metadata by an external verifier; this crate
//! only keeps their identity (filename, length, hashes) and never interprets
//! the filename as a path.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sentinel version stored for latest-only metadata rows.
pub const LATEST_VERSION: i64 = -1;

/// One of the two independent metadata sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepositoryType {
    Image,
    Director,
}

impl RepositoryType {
    /// Integer stored in the `meta.repo` column.
    pub fn as_i64(self) -> i64 {
        match self {
            RepositoryType::Image => 0,
            RepositoryType::Director => 1,
        }
    }

    /// Directory name used by the legacy filesystem layout.
    pub fn legacy_dir(self) -> &'static str {
        match self {
            RepositoryType::Image => "repo",
            RepositoryType::Director => "director",
        }
    }

    /// Both repositories, director first.
    pub fn all() -> [RepositoryType; 2] {
        [RepositoryType::Director, RepositoryType::Image]
    }
}

impl fmt::Display for RepositoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryType::Image => f.write_str("image"),
            RepositoryType::Director => f.write_str("director"),
        }
    }
}

/// Top-level metadata roles persisted in the `meta` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Root,
    Snapshot,
    Targets,
    Timestamp,
}

impl Role {
    /// Integer stored in the `meta.meta_type` column.
    pub fn as_i64(self) -> i64 {
        match self {
            Role::Root => 0,
            Role::Snapshot => 1,
            Role::Targets => 2,
            Role::Timestamp => 3,
        }
    }

    /// Lowercase role name (`root`, `targets`, ...).
    pub fn name(self) -> &'static str {
        match self {
            Role::Root => "root",
            Role::Snapshot => "snapshot",
            Role::Targets => "targets",
            Role::Timestamp => "timestamp",
        }
    }

    /// Roles stored with latest-only semantics.
    pub fn non_root() -> [Role; 3] {
        [Role::Snapshot, Role::Targets, Role::Timestamp]
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Version selector for root metadata lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootVersion {
    Latest,
    Exact(i64),
}

/// Supported digest algorithms, ordered by priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HashType {
    Sha256,
    Sha512,
}

impl HashType {
    /// Parses an algorithm name case-insensitively; unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sha256" => Some(HashType::Sha256),
            "sha512" => Some(HashType::Sha512),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HashType::Sha256 => "sha256",
            HashType::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for HashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A digest of a given algorithm, kept as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hash {
    kind: HashType,
    digest: String,
}

impl Hash {
    pub fn new(kind: HashType, digest: impl AsRef<str>) -> Self {
        Self {
            kind,
            digest: digest.as_ref().trim().to_ascii_lowercase(),
        }
    }

    pub fn kind(&self) -> HashType {
        self.kind
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.digest)
    }
}

/// Encodes hashes as `sha256:<hex>;sha512:<hex>` for the `installed_versions.hashes` column.
pub fn encode_hashes(hashes: &[Hash]) -> String {
    hashes
        .iter()
        .map(Hash::to_string)
        .collect::<Vec<_>>()
        .join(";")
}

/// Decodes the column format written by [`encode_hashes`], skipping unknown algorithms.
pub fn decode_hashes(encoded: &str) -> Vec<Hash> {
    let mut hashes = Vec::new();
    for token in encoded.split(';') {
        if token.is_empty() {
            break;
        }
        let Some((kind, digest)) = token.split_once(':') else {
            break;
        };
        if digest.is_empty() {
            continue;
        }
        if let Some(kind) = HashType::parse(kind) {
            hashes.push(Hash::new(kind, digest));
        }
    }
    hashes
}

/// Metadata entry of a single target as found in a `targets.json` document.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetDescription {
    /// Advertised file length.
    #[serde(default)]
    pub length: u64,
    /// Content hashes keyed by algorithm.
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
    /// Optional custom metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Value>,
}

/// Trusted description of an update image.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    filename: String,
    length: u64,
    hashes: Vec<Hash>,
    correlation_id: String,
    uri: Option<String>,
    custom: Option<Value>,
}

impl Target {
    /// Builds a target; hashes are sorted by algorithm priority (sha256 first).
    pub fn new(filename: impl Into<String>, length: u64, mut hashes: Vec<Hash>) -> Self {
        hashes.sort_by(|a, b| a.kind.cmp(&b.kind));
        hashes.dedup_by(|a, b| a.kind == b.kind);
        Self {
            filename: filename.into(),
            length,
            hashes,
            correlation_id: String::new(),
            uri: None,
            custom: None,
        }
    }

    /// Builds a target from a `targets.json` entry, ignoring unknown hash algorithms.
    pub fn from_description(filename: impl Into<String>, description: &TargetDescription) -> Self {
        let hashes = description
            .hashes
            .iter()
            .filter_map(|(kind, digest)| HashType::parse(kind).map(|kind| Hash::new(kind, digest)))
            .collect();
        let mut target = Self::new(filename, description.length, hashes);
        target.custom = description.custom.clone();
        target
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Sets an explicit download URI overriding the repository default.
    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn with_custom(mut self, custom: Value) -> Self {
        self.custom = Some(custom);
        self
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn hashes(&self) -> &[Hash] {
        &self.hashes
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn custom(&self) -> Option<&Value> {
        self.custom.as_ref()
    }

    /// Highest-priority hash; its digest names the blob on disk.
    pub fn primary_hash(&self) -> Option<&Hash> {
        self.hashes.first()
    }

    pub fn hash_of(&self, kind: HashType) -> Option<&str> {
        self.hashes
            .iter()
            .find(|hash| hash.kind == kind)
            .map(Hash::digest)
    }

    /// sha256 digest or an empty string, as stored in the `installed_versions.sha256` column.
    pub fn sha256_hash(&self) -> &str {
        self.hash_of(HashType::Sha256).unwrap_or("")
    }

    /// Returns `true` when the target declares `hash` with the same digest.
    pub fn match_hash(&self, hash: &Hash) -> bool {
        self.hash_of(hash.kind) == Some(hash.digest())
    }

    /// Same image: same filename, length and declared digests.
    pub fn same_image(&self, other: &Target) -> bool {
        self.filename == other.filename && self.length == other.length && self.hashes == other.hashes
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes, {})", self.filename, self.length, encode_hashes(&self.hashes))
    }
}

/// Primary first, then secondaries, each `(serial, hardware_id)`.
pub type EcuSerials = Vec<(String, String)>;

/// Registration state of an ECU that does not match the device manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum EcuState {
    Old,
    NotRegistered,
}

impl From<EcuState> for i64 {
    fn from(state: EcuState) -> Self {
        match state {
            EcuState::Old => 0,
            EcuState::NotRegistered => 1,
        }
    }
}

impl TryFrom<i64> for EcuState {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EcuState::Old),
            1 => Ok(EcuState::NotRegistered),
            other => Err(format!("unknown ecu state {other}")),
        }
    }
}

/// ECU reported by a secondary that the backend does not expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MisconfiguredEcu {
    pub serial: String,
    pub hardware_id: String,
    pub state: EcuState,
}

/// How [`crate::SqlStorage::save_installed_version`] updates the current/pending flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstalledVersionUpdateMode {
    None,
    Current,
    Pending,
}

/// Outcome of an installation, per ECU or for the whole device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationResult {
    pub success: bool,
    pub result_code: String,
    pub description: String,
}

impl InstallationResult {
    pub fn new(success: bool, result_code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            success,
            result_code: result_code.into(),
            description: description.into(),
        }
    }
}

/// Device-wide installation result with the raw report sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInstallationResult {
    pub result: InstallationResult,
    pub raw_report: String,
    pub correlation_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_orders_hashes_by_priority() {
        let target = Target::new(
            "app.img",
            3,
            vec![
                Hash::new(HashType::Sha512, "BB"),
                Hash::new(HashType::Sha256, "AA"),
            ],
        );
        assert_eq!(target.primary_hash().map(Hash::kind), Some(HashType::Sha256));
        assert_eq!(target.sha256_hash(), "aa");
        assert!(target.match_hash(&Hash::new(HashType::Sha512, "bb")));
        assert!(!target.match_hash(&Hash::new(HashType::Sha512, "cc")));
    }

    #[test]
    fn hashes_column_format_survives_unknown_algorithms() {
        let hashes = vec![
            Hash::new(HashType::Sha256, "aa"),
            Hash::new(HashType::Sha512, "bb"),
        ];
        assert_eq!(encode_hashes(&hashes), "sha256:aa;sha512:bb");
        assert_eq!(decode_hashes("sha256:aa;md5:zz;sha512:bb"), hashes);
        assert!(decode_hashes("").is_empty());
        assert!(decode_hashes("garbage").is_empty());
    }

    #[test]
    fn target_from_description_drops_unknown_algorithms() {
        let description: TargetDescription = serde_json::from_str(
            r#"{"length": 12, "hashes": {"sha256": "AB", "md5": "00"}, "custom": {"ecuIdentifiers": {}}}"#,
        )
        .unwrap();
        let target = Target::from_description("fw.bin", &description);
        assert_eq!(target.length(), 12);
        assert_eq!(target.hashes(), &[Hash::new(HashType::Sha256, "ab")]);
        assert!(target.custom().is_some());
    }

    #[test]
    fn ecu_state_serializes_as_integer() {
        let ecu = MisconfiguredEcu {
            serial: "sec1".into(),
            hardware_id: "hw".into(),
            state: EcuState::NotRegistered,
        };
        let json = serde_json::to_value(&ecu).unwrap();
        assert_eq!(json["state"], 1);
        let back: MisconfiguredEcu = serde_json::from_value(json).unwrap();
        assert_eq!(back, ecu);
    }
}
