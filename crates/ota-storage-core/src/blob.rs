// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Image blobs: one file per target under the images directory.
//!
//! The on-disk file is named after the target's primary digest plus a tag
//! derived from its filename, never after the untrusted filename itself.
//! Filenames are not unique per content, so two records holding the same
//! bytes still own separate files. `target_images.real_size` is the durable
//! watermark of bytes that were explicitly recorded by `close` or `commit`;
//! anything past it is discarded when a download resumes.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::error::{Result, StorageError};
use crate::schema;
use crate::sql::SqlStorage;
use crate::types::{Hash, HashType, Target};

/// Record of a blob as found by [`SqlStorage::check_target_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTarget {
    /// Bytes recorded for the blob; smaller than the target length while incomplete.
    pub size: u64,
    /// Opaque on-disk name inside the images directory.
    pub image_name: String,
}

/// Entry listed by [`SqlStorage::get_target_files`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFile {
    pub filename: String,
    pub image_name: String,
    pub hashes: Vec<Hash>,
    pub size: u64,
}

const FILENAME_TAG_LEN: usize = 16;

fn image_name(target: &Target) -> Result<String> {
    let digest = target
        .primary_hash()
        .map(Hash::digest)
        .filter(|digest| !digest.is_empty() && digest.bytes().all(|b| b.is_ascii_hexdigit()))
        .ok_or_else(|| StorageError::MissingHash(target.filename().to_string()))?;
    let tag = hex::encode(Sha256::digest(target.filename().as_bytes()));
    Ok(format!("{}.{}", digest.to_ascii_lowercase(), &tag[..FILENAME_TAG_LEN]))
}

fn remove_if_present(path: &std::path::Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

impl SqlStorage {
    fn image_path(&self, image_name: &str) -> PathBuf {
        self.config().images_dir().join(image_name)
    }

    /// Finds the stored blob for `target`.
    ///
    /// Returns `Ok(None)` when there is no record, when the recorded digests
    /// differ from the ones `target` declares, or when the file is gone.
    pub fn check_target_file(&self, target: &Target) -> Result<Option<StoredTarget>> {
        let record: Option<(String, String, String, i64)> = self.read("check_target_file", |conn| {
            Ok(conn
                .query_row(
                    "SELECT sha256, sha512, image_name, real_size FROM target_images WHERE filename = ?1",
                    params![target.filename()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?)
        })?;
        let Some((sha256, sha512, image_name, real_size)) = record else {
            return Ok(None);
        };
        for (kind, digest) in [(HashType::Sha256, sha256), (HashType::Sha512, sha512)] {
            if !digest.is_empty() && !target.match_hash(&Hash::new(kind, &digest)) {
                tracing::debug!(filename = %target.filename(), %kind, "stored digest differs from target");
                return Ok(None);
            }
        }
        let path = self.image_path(&image_name);
        let on_disk = match fs::metadata(&path) {
            Ok(metadata) => metadata.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(filename = %target.filename(), path = %path.display(), "image record without file");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Some(StoredTarget {
            size: (real_size.max(0) as u64).min(on_disk),
            image_name,
        }))
    }

    /// Starts a fresh blob for `target`, discarding any previous content.
    pub fn allocate_target_file(&self, target: &Target) -> Result<WriteHandle<'_>> {
        let image_name = image_name(target)?;
        let images = self.config().images_dir();
        schema::prepare_directory(&images)?;
        let previous = self.write("allocate_target_file", |tx| {
            let previous: Option<String> = tx
                .query_row(
                    "SELECT image_name FROM target_images WHERE filename = ?1",
                    params![target.filename()],
                    |row| row.get(0),
                )
                .optional()?;
            tx.execute(
                "INSERT OR REPLACE INTO target_images(filename, image_name, sha256, sha512, real_size) VALUES (?1, ?2, ?3, ?4, 0)",
                params![
                    target.filename(),
                    image_name,
                    target.hash_of(HashType::Sha256).unwrap_or(""),
                    target.hash_of(HashType::Sha512).unwrap_or(""),
                ],
            )?;
            Ok(previous)
        })?;
        if let Some(previous) = previous.filter(|previous| *previous != image_name) {
            remove_if_present(&self.image_path(&previous))?;
        }
        let path = self.image_path(&image_name);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        tracing::debug!(filename = %target.filename(), path = %path.display(), "allocated image file");
        Ok(WriteHandle::new(self, target.clone(), path, file, 0))
    }

    /// Opens the recorded bytes of `target` for reading.
    pub fn open_target_file(&self, target: &Target) -> Result<ReadHandle<'_>> {
        let stored = self
            .check_target_file(target)?
            .ok_or_else(|| StorageError::TargetNotFound(target.filename().to_string()))?;
        let path = self.image_path(&stored.image_name);
        let file = File::open(&path)?;
        Ok(ReadHandle {
            storage: self,
            target: target.clone(),
            path,
            file,
            size: stored.size,
            position: 0,
        })
    }

    /// Lists every stored blob with its recorded size.
    pub fn get_target_files(&self) -> Result<Vec<TargetFile>> {
        self.read("get_target_files", |conn| {
            let mut statement = conn.prepare(
                "SELECT filename, image_name, sha256, sha512, real_size FROM target_images ORDER BY filename",
            )?;
            let files = statement
                .query_map([], |row| {
                    let sha256: String = row.get(2)?;
                    let sha512: String = row.get(3)?;
                    let hashes = [(HashType::Sha256, sha256), (HashType::Sha512, sha512)]
                        .into_iter()
                        .filter(|(_, digest)| !digest.is_empty())
                        .map(|(kind, digest)| Hash::new(kind, digest))
                        .collect();
                    Ok(TargetFile {
                        filename: row.get(0)?,
                        image_name: row.get(1)?,
                        hashes,
                        size: row.get::<_, i64>(4)?.max(0) as u64,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(files)
        })
    }

    /// Deletes the record and the file of `filename` together.
    pub fn remove_target_file(&self, filename: &str) -> Result<()> {
        let images = self.config().images_dir();
        self.write("remove_target_file", |tx| {
            let image_name: Option<String> = tx
                .query_row(
                    "SELECT image_name FROM target_images WHERE filename = ?1",
                    params![filename],
                    |row| row.get(0),
                )
                .optional()?;
            let image_name =
                image_name.ok_or_else(|| StorageError::TargetNotFound(filename.to_string()))?;
            tx.execute("DELETE FROM target_images WHERE filename = ?1", params![filename])?;
            // the transaction rolls back if the file cannot be removed
            remove_if_present(&images.join(&image_name))?;
            Ok(())
        })?;
        tracing::debug!(filename = %filename, "removed image");
        Ok(())
    }

    fn record_real_size(&self, filename: &str, size: u64) -> Result<()> {
        self.write("record_real_size", |tx| {
            tx.execute(
                "UPDATE target_images SET real_size = ?1 WHERE filename = ?2",
                params![size as i64, filename],
            )?;
            Ok(())
        })
    }

    fn forget_target(&self, filename: &str) -> Result<()> {
        self.write("forget_target", |tx| {
            tx.execute("DELETE FROM target_images WHERE filename = ?1", params![filename])?;
            Ok(())
        })
    }
}

/// Streaming writer for one target.
///
/// Ends with exactly one of [`commit`](Self::commit), [`close`](Self::close)
/// or [`abort`](Self::abort). A handle dropped without one of them is
/// aborted: its bytes and its record are removed.
#[derive(Debug)]
pub struct WriteHandle<'a> {
    storage: &'a SqlStorage,
    target: Target,
    path: PathBuf,
    file: Option<File>,
    written: u64,
}

impl<'a> WriteHandle<'a> {
    fn new(storage: &'a SqlStorage, target: Target, path: PathBuf, file: File, written: u64) -> Self {
        Self {
            storage,
            target,
            path,
            file: Some(file),
            written,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Bytes in the blob so far, including those present before resuming.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Appends `data`; writing past the target length is rejected untouched.
    pub fn feed(&mut self, data: &[u8]) -> Result<usize> {
        let length = self.target.length();
        if self.written + data.len() as u64 > length {
            tracing::warn!(filename = %self.target.filename(), length, "refusing write past declared length");
            return Err(StorageError::BlobOverflow {
                filename: self.target.filename().to_string(),
                length,
            });
        }
        let file = self.file_mut()?;
        file.write_all(data)?;
        self.written += data.len() as u64;
        Ok(data.len())
    }

    /// Finalizes a complete blob; requires exactly `length` bytes.
    ///
    /// On error the handle is dropped and therefore aborted.
    pub fn commit(mut self) -> Result<()> {
        if self.written != self.target.length() {
            return Err(StorageError::BlobIncomplete {
                filename: self.target.filename().to_string(),
                written: self.written,
                length: self.target.length(),
            });
        }
        self.persist()?;
        tracing::debug!(filename = %self.target.filename(), size = self.written, "committed image");
        Ok(())
    }

    /// Records the bytes written so far and keeps them for a later resume.
    pub fn close(mut self) -> Result<()> {
        self.persist()?;
        tracing::debug!(filename = %self.target.filename(), size = self.written, "closed partial image");
        Ok(())
    }

    /// Discards the blob and its record.
    pub fn abort(mut self) -> Result<()> {
        self.discard()
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| StorageError::TargetNotFound(self.target.filename().to_string()))
    }

    fn persist(&mut self) -> Result<()> {
        let file = self.file_mut()?;
        file.flush()?;
        file.sync_all()?;
        self.storage.record_real_size(self.target.filename(), self.written)?;
        self.file = None;
        Ok(())
    }

    fn discard(&mut self) -> Result<()> {
        self.file = None;
        remove_if_present(&self.path)?;
        self.storage.forget_target(self.target.filename())?;
        tracing::debug!(filename = %self.target.filename(), "aborted image");
        Ok(())
    }
}

impl Drop for WriteHandle<'_> {
    fn drop(&mut self) {
        if self.file.is_some() {
            if let Err(err) = self.discard() {
                tracing::warn!(filename = %self.target.filename(), error = %err, "failed to discard unfinished image");
            }
        }
    }
}

/// Reader over the recorded bytes of a blob.
#[derive(Debug)]
pub struct ReadHandle<'a> {
    storage: &'a SqlStorage,
    target: Target,
    path: PathBuf,
    file: File,
    size: u64,
    position: u64,
}

impl<'a> ReadHandle<'a> {
    /// Recorded size; reads never go past it.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// `true` while fewer than `length` bytes are recorded.
    pub fn is_partial(&self) -> bool {
        self.size < self.target.length()
    }

    /// Reopens the blob for appending at [`size`](Self::size).
    ///
    /// Bytes past the recorded size are truncated first.
    pub fn into_write_handle(self) -> Result<WriteHandle<'a>> {
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(self.size)?;
        file.seek(SeekFrom::End(0))?;
        tracing::debug!(filename = %self.target.filename(), offset = self.size, "resuming image");
        Ok(WriteHandle::new(self.storage, self.target, self.path, file, self.size))
    }
}

impl Read for ReadHandle<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.size.saturating_sub(self.position);
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let limit = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let read = self.file.read(&mut buf[..limit])?;
        self.position += read as u64;
        Ok(read)
    }
}
