// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Download telemetry hooks and a counting implementation.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::types::Target;

/// Observer of download engine events. Every hook defaults to a no-op.
pub trait FetchTelemetry: Send + Sync {
    /// A transfer starts from offset zero.
    fn on_download_started(&self, _target: &Target) {}
    /// A transfer continues a partial blob at `offset`.
    fn on_download_resumed(&self, _target: &Target, _offset: u64) {}
    /// The server ignored a resume request and the blob restarts from zero.
    fn on_download_restarted(&self, _target: &Target) {}
    /// A blob was committed after successful verification.
    fn on_download_completed(&self, _target: &Target) {}
    fn on_hash_mismatch(&self, _target: &Target) {}
    fn on_bytes_received(&self, _count: u64) {}
}

/// Telemetry implementation that records nothing.
#[derive(Debug, Default)]
pub struct NoopTelemetry;

impl FetchTelemetry for NoopTelemetry {}

/// Aggregated counters (relaxed atomics).
#[derive(Debug, Default)]
pub struct TelemetryCounters {
    downloads_started: AtomicU64,
    downloads_resumed: AtomicU64,
    downloads_restarted: AtomicU64,
    downloads_completed: AtomicU64,
    hash_mismatches: AtomicU64,
    bytes_received: AtomicU64,
}

impl TelemetryCounters {
    /// Captures a point-in-time snapshot of the counters.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            downloads_started: self.downloads_started.load(Ordering::Relaxed),
            downloads_resumed: self.downloads_resumed.load(Ordering::Relaxed),
            downloads_restarted: self.downloads_restarted.load(Ordering::Relaxed),
            downloads_completed: self.downloads_completed.load(Ordering::Relaxed),
            hash_mismatches: self.hash_mismatches.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Plain data representation of [`TelemetryCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub downloads_started: u64,
    pub downloads_resumed: u64,
    pub downloads_restarted: u64,
    pub downloads_completed: u64,
    pub hash_mismatches: u64,
    /// Body bytes received from the transport, including discarded ones.
    pub bytes_received: u64,
}

impl fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "downloads_started={}, downloads_resumed={}, downloads_restarted={}, downloads_completed={}, hash_mismatches={}, bytes_received={}",
            self.downloads_started,
            self.downloads_resumed,
            self.downloads_restarted,
            self.downloads_completed,
            self.hash_mismatches,
            self.bytes_received
        )
    }
}

/// Telemetry implementation that maintains atomic counters for every event.
///
/// Callers can share the [`TelemetryCounters`] with whatever exports metrics
/// on the device.
#[derive(Debug, Clone)]
pub struct CountingTelemetry {
    counters: Arc<TelemetryCounters>,
}

impl CountingTelemetry {
    pub fn new(counters: Arc<TelemetryCounters>) -> Self {
        Self { counters }
    }

    /// Returns the underlying counter set.
    pub fn counters(&self) -> Arc<TelemetryCounters> {
        self.counters.clone()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.counters.snapshot()
    }
}

impl Default for CountingTelemetry {
    fn default() -> Self {
        Self::new(Arc::new(TelemetryCounters::default()))
    }
}

impl FetchTelemetry for CountingTelemetry {
    fn on_download_started(&self, _target: &Target) {
        self.counters
            .downloads_started
            .fetch_add(1, Ordering::Relaxed);
    }

    fn on_download_resumed(&self, _target: &Target, _offset: u64) {
        self.counters
            .downloads_resumed
            .fetch_add(1, Ordering::Relaxed);
    }

    fn on_download_restarted(&self, _target: &Target) {
        self.counters
            .downloads_restarted
            .fetch_add(1, Ordering::Relaxed);
    }

    fn on_download_completed(&self, _target: &Target) {
        self.counters
            .downloads_completed
            .fetch_add(1, Ordering::Relaxed);
    }

    fn on_hash_mismatch(&self, _target: &Target) {
        self.counters.hash_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    fn on_bytes_received(&self, count: u64) {
        self.counters
            .bytes_received
            .fetch_add(count, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Hash, HashType};

    #[test]
    fn counting_telemetry_tracks_events() {
        let telemetry = CountingTelemetry::default();
        let target = Target::new("app.img", 10, vec![Hash::new(HashType::Sha256, "aa")]);
        telemetry.on_download_started(&target);
        telemetry.on_download_resumed(&target, 4);
        telemetry.on_download_restarted(&target);
        telemetry.on_download_completed(&target);
        telemetry.on_hash_mismatch(&target);
        telemetry.on_bytes_received(6);
        telemetry.on_bytes_received(4);

        let snapshot = telemetry.snapshot();
        assert_eq!(
            snapshot,
            TelemetrySnapshot {
                downloads_started: 1,
                downloads_resumed: 1,
                downloads_restarted: 1,
                downloads_completed: 1,
                hash_mismatches: 1,
                bytes_received: 10,
            }
        );
        assert!(snapshot.to_string().contains("bytes_received=10"));
    }

    #[test]
    fn clones_share_counters() {
        let telemetry = CountingTelemetry::default();
        let clone = telemetry.clone();
        clone.on_bytes_received(3);
        assert_eq!(telemetry.snapshot().bytes_received, 3);
        assert!(Arc::ptr_eq(&telemetry.counters(), &clone.counters()));
    }
}
