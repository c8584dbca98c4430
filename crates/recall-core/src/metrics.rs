//! Health counters for the store.
//!
//! Plain atomics, updated inline on the hot paths and polled by whatever
//! exporter the host runs. No exporter lives here.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Live counters. All methods are lock-free and callable from any thread.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    puts_ok: AtomicU64,
    puts_failed: AtomicU64,
    deletes_ok: AtomicU64,
    deletes_failed: AtomicU64,
    reads: AtomicU64,
    evictions: AtomicU64,
    lock_timeouts: AtomicU64,
    wal_appends: AtomicU64,
    wal_fsyncs: AtomicU64,
    wal_size_bytes: AtomicU64,
    dialogues_len: AtomicU64,
    decisions_len: AtomicU64,
    checkpoints: AtomicU64,
    last_checkpoint_ms: AtomicU64,
    recoveries: AtomicU64,
    entries_replayed: AtomicU64,
}

impl StoreMetrics {
    pub(crate) fn record_put(&self, ok: bool) {
        let counter = if ok { &self.puts_ok } else { &self.puts_failed };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delete(&self, ok: bool) {
        let counter = if ok {
            &self.deletes_ok
        } else {
            &self.deletes_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evictions(&self, n: u64) {
        if n > 0 {
            self.evictions.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_wal_append(&self, entries: u64) {
        self.wal_appends.fetch_add(entries, Ordering::Relaxed);
        self.wal_fsyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_wal_size(&self, bytes: u64) {
        self.wal_size_bytes.store(bytes, Ordering::Relaxed);
    }

    pub(crate) fn set_collection_sizes(&self, dialogues: u64, decisions: u64) {
        self.dialogues_len.store(dialogues, Ordering::Relaxed);
        self.decisions_len.store(decisions, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint(&self, at_ms: u64) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
        self.last_checkpoint_ms.store(at_ms, Ordering::Relaxed);
    }

    pub(crate) fn record_recovery(&self, entries_replayed: u64) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
        self.entries_replayed
            .fetch_add(entries_replayed, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            puts_ok: self.puts_ok.load(Ordering::Relaxed),
            puts_failed: self.puts_failed.load(Ordering::Relaxed),
            deletes_ok: self.deletes_ok.load(Ordering::Relaxed),
            deletes_failed: self.deletes_failed.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            wal_appends: self.wal_appends.load(Ordering::Relaxed),
            wal_fsyncs: self.wal_fsyncs.load(Ordering::Relaxed),
            wal_size_bytes: self.wal_size_bytes.load(Ordering::Relaxed),
            dialogues_len: self.dialogues_len.load(Ordering::Relaxed),
            decisions_len: self.decisions_len.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            last_checkpoint_ms: self.last_checkpoint_ms.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            entries_replayed: self.entries_replayed.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of the counters, for exporters and status endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub puts_ok: u64,
    pub puts_failed: u64,
    pub deletes_ok: u64,
    pub deletes_failed: u64,
    pub reads: u64,
    pub evictions: u64,
    pub lock_timeouts: u64,
    pub wal_appends: u64,
    pub wal_fsyncs: u64,
    pub wal_size_bytes: u64,
    pub dialogues_len: u64,
    pub decisions_len: u64,
    pub checkpoints: u64,
    pub last_checkpoint_ms: u64,
    pub recoveries: u64,
    pub entries_replayed: u64,
}
