// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Download and verification engine for update images.
//!
//! Every attempt starts by classifying what is already on disk
//! ([`TargetStatus`]). Partial blobs are resumed after the hasher has been
//! rebuilt from their bytes; complete blobs are re-hashed before they are
//! trusted. Integrity failures discard the blob, while cancellations and
//! transport failures keep the received bytes for a later resume.

use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::Url;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::blob::WriteHandle;
use crate::config::FetchConfig;
use crate::error::StorageError;
use crate::hasher::{find_mismatch, rehydrate, MultiHasher};
use crate::http::{HttpClient, HttpClientOptions, HttpError, Transport, TransferOutcome};
use crate::sql::SqlStorage;
use crate::telemetry::{FetchTelemetry, NoopTelemetry};
use crate::types::{Hash, Target};

/// Errors reported by the download engine.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("target '{0}' declares no hash")]
    NoHashes(String),

    #[error("insufficient disk space: {required} bytes required, {available} available")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("download cancelled")]
    Cancelled,

    #[error("server sent more than the {length} bytes declared for '{filename}'")]
    Oversized { filename: String, length: u64 },

    #[error("downloaded image does not match {expected}")]
    HashMismatch { expected: Hash },

    #[error("transfer ended after {written} of {length} bytes")]
    Incomplete { written: u64, length: u64 },

    #[error("target has no URI and no repository server is configured")]
    NoRepoServer,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Http(#[from] HttpError),
}

impl FetchError {
    /// `true` for failures that prove the received bytes untrustworthy.
    pub fn is_verification_failure(&self) -> bool {
        matches!(self, FetchError::Oversized { .. } | FetchError::HashMismatch { .. })
    }
}

impl From<io::Error> for FetchError {
    fn from(err: io::Error) -> Self {
        FetchError::Storage(StorageError::Io(err))
    }
}

/// On-disk state of a target, evaluated before each attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStatus {
    NotFound,
    /// `size` bytes of the blob are recorded.
    Incomplete { size: u64 },
    Oversized,
    /// Complete length whose digests do not match.
    HashMismatch,
    Good,
}

/// Result of a successful [`Fetcher::fetch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A verified blob was already stored; nothing was transferred.
    AlreadyPresent,
    /// The blob was downloaded (or completed) and committed.
    Downloaded { resumed_from: u64 },
}

/// Free-space query for the images directory.
pub trait SpaceProbe: Send + Sync {
    fn available_space(&self, path: &Path) -> io::Result<u64>;
}

/// [`SpaceProbe`] backed by the filesystem holding `path`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsSpaceProbe;

impl SpaceProbe for FsSpaceProbe {
    fn available_space(&self, path: &Path) -> io::Result<u64> {
        // the images directory may not exist before the first download
        let existing = path
            .ancestors()
            .find(|candidate| candidate.exists())
            .unwrap_or(path);
        fs4::available_space(existing)
    }
}

/// Drives targets from the network into a [`SqlStorage`].
pub struct Fetcher<T = HttpClient> {
    transport: T,
    config: FetchConfig,
    space: Box<dyn SpaceProbe>,
    telemetry: Arc<dyn FetchTelemetry>,
}

impl Fetcher<HttpClient> {
    /// Engine using the blocking HTTP client.
    pub fn from_config(config: FetchConfig) -> Result<Self, FetchError> {
        let transport = HttpClient::new(HttpClientOptions {
            allow_plaintext: config.allow_plaintext,
            ..HttpClientOptions::default()
        })?;
        Ok(Self::new(transport, config))
    }
}

impl<T: Transport> Fetcher<T> {
    pub fn new(transport: T, config: FetchConfig) -> Self {
        Self {
            transport,
            config,
            space: Box::new(FsSpaceProbe),
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    pub fn with_space_probe(mut self, probe: impl SpaceProbe + 'static) -> Self {
        self.space = Box::new(probe);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn FetchTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Classifies the stored bytes of `target`, re-hashing complete blobs.
    pub fn verify_target(&self, storage: &SqlStorage, target: &Target) -> Result<TargetStatus, FetchError> {
        let Some(stored) = storage.check_target_file(target)? else {
            return Ok(TargetStatus::NotFound);
        };
        let length = target.length();
        if stored.size > length {
            return Ok(TargetStatus::Oversized);
        }
        if stored.size < length {
            return Ok(TargetStatus::Incomplete { size: stored.size });
        }
        let mut reader = storage.open_target_file(target)?;
        let mut hasher = MultiHasher::for_target(target);
        rehydrate(&mut hasher, &mut reader, self.config.buffer_size)?;
        match find_mismatch(target, &hasher.finalize()) {
            Some(hash) => {
                tracing::warn!(filename = %target.filename(), expected = %hash, "stored image does not verify");
                Ok(TargetStatus::HashMismatch)
            }
            None => Ok(TargetStatus::Good),
        }
    }

    /// Downloads `target` into `storage`, resuming a partial blob when possible.
    ///
    /// `progress` receives the integer percentage each time it increases.
    /// `cancel` is checked between chunks; a cancelled transfer keeps its
    /// bytes for the next attempt.
    pub fn fetch(
        &self,
        storage: &SqlStorage,
        target: &Target,
        cancel: &CancellationToken,
        progress: &mut dyn FnMut(&Target, u8),
    ) -> Result<FetchOutcome, FetchError> {
        if target.hashes().is_empty() {
            return Err(FetchError::NoHashes(target.filename().to_string()));
        }
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let offset = match self.verify_target(storage, target)? {
            TargetStatus::Good => {
                tracing::debug!(filename = %target.filename(), "image already present");
                return Ok(FetchOutcome::AlreadyPresent);
            }
            TargetStatus::Incomplete { size } => size,
            status @ (TargetStatus::Oversized | TargetStatus::HashMismatch) => {
                tracing::info!(filename = %target.filename(), ?status, "discarding stored image");
                storage.remove_target_file(target.filename())?;
                0
            }
            TargetStatus::NotFound => 0,
        };
        let url = self.target_url(target)?;
        self.ensure_space(storage, target.length() - offset)?;

        let (mut handle, mut hasher) = if offset > 0 {
            let mut reader = storage.open_target_file(target)?;
            let mut hasher = MultiHasher::for_target(target);
            rehydrate(&mut hasher, &mut reader, self.config.buffer_size)?;
            self.telemetry.on_download_resumed(target, offset);
            tracing::info!(filename = %target.filename(), offset, "resuming download");
            (reader.into_write_handle()?, hasher)
        } else {
            self.telemetry.on_download_started(target);
            tracing::info!(filename = %target.filename(), length = target.length(), "starting download");
            (storage.allocate_target_file(target)?, MultiHasher::for_target(target))
        };

        let mut restarted = false;
        loop {
            match self.transfer(&url, &mut handle, &mut hasher, cancel, progress) {
                Ok(()) => break,
                Err(FetchError::Http(HttpError::RangeNotSupported(status))) if !restarted => {
                    restarted = true;
                    tracing::warn!(filename = %target.filename(), status, "server ignored resume offset, restarting");
                    handle.abort()?;
                    self.ensure_space(storage, target.length())?;
                    handle = storage.allocate_target_file(target)?;
                    hasher = MultiHasher::for_target(target);
                    self.telemetry.on_download_restarted(target);
                }
                Err(err) if err.is_verification_failure() => {
                    handle.abort()?;
                    return Err(err);
                }
                Err(err) => {
                    // keep what was received for the next attempt
                    if let Err(close_err) = handle.close() {
                        tracing::error!(filename = %target.filename(), error = %close_err, "could not record partial image");
                    }
                    return Err(err);
                }
            }
        }

        if handle.written() < target.length() {
            let written = handle.written();
            handle.close()?;
            return Err(FetchError::Incomplete {
                written,
                length: target.length(),
            });
        }
        if let Some(expected) = find_mismatch(target, &hasher.finalize()) {
            tracing::warn!(filename = %target.filename(), expected = %expected, "downloaded image does not verify");
            self.telemetry.on_hash_mismatch(target);
            handle.abort()?;
            return Err(FetchError::HashMismatch {
                expected: expected.clone(),
            });
        }
        handle.commit()?;
        self.telemetry.on_download_completed(target);
        tracing::info!(filename = %target.filename(), "download complete");
        Ok(FetchOutcome::Downloaded {
            resumed_from: if restarted { 0 } else { offset },
        })
    }

    /// Streams the remaining bytes of the handle's target.
    fn transfer(
        &self,
        url: &str,
        handle: &mut WriteHandle<'_>,
        hasher: &mut MultiHasher,
        cancel: &CancellationToken,
        progress: &mut dyn FnMut(&Target, u8),
    ) -> Result<(), FetchError> {
        let length = handle.target().length();
        let offset = handle.written();
        if offset == length {
            return Ok(());
        }
        let mut last_percent = percent(offset, length);
        let mut failure: Option<FetchError> = None;

        let mut sink = |chunk: &[u8]| -> ControlFlow<()> {
            if cancel.is_cancelled() {
                failure = Some(FetchError::Cancelled);
                return ControlFlow::Break(());
            }
            self.telemetry.on_bytes_received(chunk.len() as u64);
            match handle.feed(chunk) {
                Ok(_) => hasher.update(chunk),
                Err(StorageError::BlobOverflow { filename, length }) => {
                    failure = Some(FetchError::Oversized { filename, length });
                    return ControlFlow::Break(());
                }
                Err(err) => {
                    failure = Some(err.into());
                    return ControlFlow::Break(());
                }
            }
            let current = percent(handle.written(), length);
            if current > last_percent {
                last_percent = current;
                progress(handle.target(), current);
            }
            ControlFlow::Continue(())
        };
        let outcome = self.transport.download(url, offset, &mut sink);

        if let Some(err) = failure {
            return Err(err);
        }
        match outcome? {
            TransferOutcome::Completed => Ok(()),
            TransferOutcome::Stopped => Err(FetchError::Cancelled),
        }
    }

    fn ensure_space(&self, storage: &SqlStorage, remaining: u64) -> Result<(), FetchError> {
        let required = remaining.saturating_add(self.config.reserved_space);
        let images: PathBuf = storage.config().images_dir();
        let available = self.space.available_space(&images)?;
        if available < required {
            tracing::error!(required, available, path = %images.display(), "not enough space for image");
            return Err(FetchError::InsufficientSpace { required, available });
        }
        Ok(())
    }

    /// Explicit target URI, or `<repo_server>/targets/<filename>`.
    pub fn target_url(&self, target: &Target) -> Result<String, FetchError> {
        if let Some(uri) = target.uri().filter(|uri| !uri.is_empty()) {
            return Ok(uri.to_string());
        }
        let base = self
            .config
            .repo_server
            .as_deref()
            .ok_or(FetchError::NoRepoServer)?;
        let mut url = Url::parse(base)
            .map_err(|err| HttpError::InvalidUrl(format!("{base}: {err}")))?;
        url.path_segments_mut()
            .map_err(|_| HttpError::InvalidUrl(base.to_string()))?
            .pop_if_empty()
            .push("targets")
            .push(target.filename());
        Ok(url.into())
    }
}

impl<T> std::fmt::Debug for Fetcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn percent(written: u64, length: u64) -> u8 {
    if length == 0 {
        return 100;
    }
    (written.min(length).saturating_mul(100) / length) as u8
}
