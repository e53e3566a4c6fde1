// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming digests over every algorithm a target declares.

use std::io::{self, Read};

use sha2::{Digest, Sha256, Sha512};

use crate::types::{Hash, HashType, Target};

/// Accumulates one digest per declared algorithm.
#[derive(Clone, Default)]
pub struct MultiHasher {
    sha256: Option<Sha256>,
    sha512: Option<Sha512>,
}

impl MultiHasher {
    pub fn new(kinds: impl IntoIterator<Item = HashType>) -> Self {
        let mut hasher = Self::default();
        for kind in kinds {
            match kind {
                HashType::Sha256 => hasher.sha256 = Some(Sha256::new()),
                HashType::Sha512 => hasher.sha512 = Some(Sha512::new()),
            }
        }
        hasher
    }

    /// Hasher covering every hash declared by `target`.
    pub fn for_target(target: &Target) -> Self {
        Self::new(target.hashes().iter().map(Hash::kind))
    }

    pub fn update(&mut self, data: &[u8]) {
        if let Some(sha256) = self.sha256.as_mut() {
            sha256.update(data);
        }
        if let Some(sha512) = self.sha512.as_mut() {
            sha512.update(data);
        }
    }

    /// Final digests, in algorithm priority order.
    pub fn finalize(self) -> Vec<Hash> {
        let mut digests = Vec::with_capacity(2);
        if let Some(sha256) = self.sha256 {
            digests.push(Hash::new(HashType::Sha256, hex::encode(sha256.finalize())));
        }
        if let Some(sha512) = self.sha512 {
            digests.push(Hash::new(HashType::Sha512, hex::encode(sha512.finalize())));
        }
        digests
    }
}

impl std::fmt::Debug for MultiHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiHasher")
            .field("sha256", &self.sha256.is_some())
            .field("sha512", &self.sha512.is_some())
            .finish()
    }
}

/// First declared hash of `target` that `digests` does not reproduce.
///
/// A declared algorithm missing from `digests` counts as a mismatch.
pub fn find_mismatch<'t>(target: &'t Target, digests: &[Hash]) -> Option<&'t Hash> {
    target
        .hashes()
        .iter()
        .find(|declared| !digests.iter().any(|digest| digest == *declared))
}

/// Feeds everything `reader` yields into `hasher`, `buffer_size` bytes at a time.
///
/// This is the only way hash state is rebuilt from bytes already on disk
/// before a download resumes. Returns the number of bytes consumed.
pub fn rehydrate(hasher: &mut MultiHasher, reader: &mut impl Read, buffer_size: usize) -> io::Result<u64> {
    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => return Ok(total),
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&buffer[..read]);
        total += read as u64;
    }
}
