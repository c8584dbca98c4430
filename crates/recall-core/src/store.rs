//! The memory store: durable puts, lock-free reads, checkpoints.
//!
//! Write path: validate, take the cross-process file lock (bounded wait),
//! append to the WAL (fsynced), then swap in the post-mutation state and
//! evict over-capacity records. The WAL append happens strictly before
//! the in-memory change, so an acknowledged write is always recoverable
//! and a failed append leaves memory untouched.
//!
//! Read path: clone an `Arc` to the current state under a short read
//! lock. Writers build a fresh state and swap the `Arc`, so a reader
//! observes the pre- or post-mutation state, never a half-applied one,
//! and never blocks on the write path.
//!
//! There are no background threads. The host calls [`MemoryStore::
//! maybe_checkpoint`] on its own schedule; lifecycle stays explicit.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::lock::{LockConfig, LockError, StoreLock};
use crate::metrics::StoreMetrics;
use crate::records::{
    DecisionRecord, DialogueRecord, Profile, ProfileUpdate, RecordKind, Role, epoch_ms,
};
use crate::recovery::{self, RecoveryReport};
use crate::snapshot::{Snapshot, SnapshotId, SnapshotInfo, SnapshotStore};
use crate::wal::{TailCorruption, Wal, WalOp};

/// In-memory record collections, ordered oldest-first.
///
/// Records are kept sorted by `timestamp_ms` (stable for ties, insertion
/// order wins), so eviction is always "pop the front" and snapshots are
/// written in a canonical order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreState {
    pub dialogues: Vec<DialogueRecord>,
    pub decisions: Vec<DecisionRecord>,
    /// Singleton profile; merged by updates, exempt from eviction.
    pub profile: Profile,
}

impl StoreState {
    pub(crate) fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            dialogues: snapshot.dialogues,
            decisions: snapshot.decisions,
            profile: snapshot.profile,
        }
    }

    fn insert_dialogue(&mut self, record: DialogueRecord) {
        let at = self
            .dialogues
            .partition_point(|r| r.timestamp_ms <= record.timestamp_ms);
        self.dialogues.insert(at, record);
    }

    fn insert_decision(&mut self, record: DecisionRecord) {
        let at = self
            .decisions
            .partition_point(|r| r.timestamp_ms <= record.timestamp_ms);
        self.decisions.insert(at, record);
    }

    fn delete_dialogue(&mut self, id: &str) -> bool {
        let before = self.dialogues.len();
        self.dialogues.retain(|r| r.id != id);
        self.dialogues.len() < before
    }

    fn delete_decision(&mut self, id: &str) -> bool {
        let before = self.decisions.len();
        self.decisions.retain(|r| r.id != id);
        self.decisions.len() < before
    }

    /// Drop oldest records until both collections fit their caps.
    /// Returns how many were evicted. Never an error.
    fn evict(&mut self, config: &StoreConfig) -> u64 {
        let mut evicted = 0u64;
        while self.dialogues.len() > config.max_dialogues {
            let gone = self.dialogues.remove(0);
            debug!(id = %gone.id, "evicted oldest dialogue");
            evicted += 1;
        }
        while self.decisions.len() > config.max_decisions {
            let gone = self.decisions.remove(0);
            debug!(id = %gone.id, "evicted oldest decision");
            evicted += 1;
        }
        evicted
    }

    /// Apply one logged operation, eviction included. Used identically by
    /// live writes and replay, which is what makes replay deterministic.
    pub(crate) fn apply(&mut self, op: &WalOp, config: &StoreConfig) -> u64 {
        match op {
            WalOp::PutDialogue { record } => {
                self.insert_dialogue(record.clone());
                self.evict(config)
            }
            WalOp::PutDecision { record } => {
                self.insert_decision(record.clone());
                self.evict(config)
            }
            WalOp::UpdateProfile { update } => {
                self.profile.fields.extend(update.fields.clone());
                self.profile.updated_at_ms = update.timestamp_ms;
                0
            }
            WalOp::Delete { kind, id } => {
                match kind {
                    RecordKind::Dialogue => self.delete_dialogue(id),
                    RecordKind::Decision => self.delete_decision(id),
                };
                0
            }
            WalOp::Checkpoint => 0,
        }
    }
}

/// Dialogue query. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueFilter {
    pub user_id: Option<String>,
    pub role: Option<Role>,
    /// Inclusive lower timestamp bound, epoch milliseconds.
    pub since_ms: Option<u64>,
    /// Inclusive upper timestamp bound.
    pub until_ms: Option<u64>,
    /// Keep only the newest N matches (output stays oldest-to-newest).
    pub limit: Option<usize>,
}

impl DialogueFilter {
    fn matches(&self, record: &DialogueRecord) -> bool {
        self.user_id.as_ref().is_none_or(|u| *u == record.user_id)
            && self.role.is_none_or(|r| r == record.role)
            && self.since_ms.is_none_or(|s| record.timestamp_ms >= s)
            && self.until_ms.is_none_or(|u| record.timestamp_ms <= u)
    }
}

/// Decision query. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionFilter {
    pub since_ms: Option<u64>,
    pub until_ms: Option<u64>,
    pub limit: Option<usize>,
}

impl DecisionFilter {
    fn matches(&self, record: &DecisionRecord) -> bool {
        self.since_ms.is_none_or(|s| record.timestamp_ms >= s)
            && self.until_ms.is_none_or(|u| record.timestamp_ms <= u)
    }
}

/// Point-in-time operational numbers, cheap to compute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub dialogues: usize,
    pub decisions: usize,
    pub applied_sequence: u64,
    pub wal_size_bytes: u64,
    pub snapshots: usize,
}

/// Read-only integrity findings from [`MemoryStore::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub wal_entries: usize,
    pub wal_tail_corruption: Option<TailCorruption>,
    pub snapshots_total: usize,
    /// File names of snapshots that failed to load or validate.
    pub snapshots_invalid: Vec<String>,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.wal_tail_corruption.is_none() && self.snapshots_invalid.is_empty()
    }
}

#[derive(Debug)]
struct WriterInner {
    wal: Wal,
    applied_sequence: u64,
    last_checkpoint: Instant,
}

/// Durable, crash-recoverable store for dialogues and decisions.
#[derive(Debug)]
pub struct MemoryStore {
    config: StoreConfig,
    lock_config: LockConfig,
    state: RwLock<Arc<StoreState>>,
    inner: Mutex<WriterInner>,
    snapshots: SnapshotStore,
    metrics: StoreMetrics,
}

impl MemoryStore {
    /// Open a store at the configured root. Construction *is* recovery:
    /// the returned state already reflects the latest snapshot plus every
    /// trusted WAL entry.
    pub fn open(config: StoreConfig) -> Result<(Self, RecoveryReport)> {
        config.validate()?;
        config.ensure_root()?;

        let lock_config = LockConfig {
            timeout: config.lock_timeout,
            poll_interval: config.lock_poll_interval,
            stale_grace: config.lock_stale_grace,
        };
        // Hold the cross-process lock for the whole of recovery so two
        // processes cannot both truncate a corrupt tail or write markers.
        let lock = StoreLock::acquire(&config.lock_path(), &lock_config)?;

        let marker_path = config.marker_path();
        let marker_exists = marker_path.exists();

        let mut wal = Wal::open(&config.wal_path())?;
        let snapshots = SnapshotStore::open(&config.snapshot_dir())?;
        let recovered = recovery::recover(&wal, &snapshots, &config, marker_exists)?;

        // A fully truncated WAL restarts its counter below the recovered
        // sequence; pull it forward so sequences never repeat.
        if wal.last_sequence() < recovered.applied_sequence {
            wal.set_next_sequence(recovered.applied_sequence + 1);
        }

        if !marker_exists {
            let marker = serde_json::json!({ "initialized_at_ms": epoch_ms() });
            std::fs::write(&marker_path, marker.to_string())?;
            crate::wal::sync_parent_dir(&marker_path);
            info!(root = %config.root.display(), "initialized storage root");
        }
        drop(lock);

        let metrics = StoreMetrics::default();
        metrics.record_recovery(recovered.report.entries_replayed as u64);
        metrics.set_collection_sizes(
            recovered.state.dialogues.len() as u64,
            recovered.state.decisions.len() as u64,
        );
        metrics.set_wal_size(wal.size_bytes()?);

        let store = Self {
            config,
            lock_config,
            state: RwLock::new(Arc::new(recovered.state)),
            inner: Mutex::new(WriterInner {
                wal,
                applied_sequence: recovered.applied_sequence,
                last_checkpoint: Instant::now(),
            }),
            snapshots,
            metrics,
        };
        Ok((store, recovered.report))
    }

    /// Durably store a dialogue record. Returns its WAL sequence.
    pub fn put_dialogue(&self, record: DialogueRecord) -> Result<u64> {
        if let Err(e) = record.validate(self.config.max_content_bytes) {
            self.metrics.record_put(false);
            return Err(e);
        }
        let result = self.commit(WalOp::PutDialogue { record });
        self.metrics.record_put(result.is_ok());
        result
    }

    /// Durably store a decision record. Returns its WAL sequence.
    pub fn put_decision(&self, record: DecisionRecord) -> Result<u64> {
        if let Err(e) = record.validate(self.config.max_content_bytes) {
            self.metrics.record_put(false);
            return Err(e);
        }
        let result = self.commit(WalOp::PutDecision { record });
        self.metrics.record_put(result.is_ok());
        result
    }

    /// Durably delete a dialogue by id. Unknown ids are rejected before
    /// anything reaches the WAL, so replay never sees a dangling delete.
    pub fn delete_dialogue(&self, id: &str) -> Result<u64> {
        self.delete(RecordKind::Dialogue, id)
    }

    /// Durably delete a decision by id.
    pub fn delete_decision(&self, id: &str) -> Result<u64> {
        self.delete(RecordKind::Decision, id)
    }

    fn delete(&self, kind: RecordKind, id: &str) -> Result<u64> {
        let exists = {
            let state = self.current();
            match kind {
                RecordKind::Dialogue => state.dialogues.iter().any(|r| r.id == id),
                RecordKind::Decision => state.decisions.iter().any(|r| r.id == id),
            }
        };
        if !exists {
            self.metrics.record_delete(false);
            return Err(Error::validation(format!(
                "no {} with id {id:?}",
                kind.as_str()
            )));
        }
        let result = self.commit(WalOp::Delete {
            kind,
            id: id.to_string(),
        });
        self.metrics.record_delete(result.is_ok());
        result
    }

    /// WAL-first commit of one operation, then the state swap.
    fn commit(&self, op: WalOp) -> Result<u64> {
        let _lock = self.acquire_lock()?;
        let mut inner = self.lock_inner();

        let sequence = inner.wal.append(op.clone())?;
        self.metrics.record_wal_append(1);

        let mut next = (*self.current()).clone();
        let evicted = next.apply(&op, &self.config);
        self.metrics.record_evictions(evicted);
        self.swap_state(next);
        inner.applied_sequence = sequence;
        self.metrics.set_wal_size(inner.wal.size_bytes()?);
        Ok(sequence)
    }

    /// Dialogues matching `filter`, oldest to newest. Lock-free.
    #[must_use]
    pub fn get_dialogues(&self, filter: &DialogueFilter) -> Vec<DialogueRecord> {
        self.metrics.record_read();
        let state = self.current();
        let matches: Vec<DialogueRecord> = state
            .dialogues
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        tail_limited(matches, filter.limit)
    }

    /// Decisions matching `filter`, oldest to newest. Lock-free.
    #[must_use]
    pub fn get_decisions(&self, filter: &DecisionFilter) -> Vec<DecisionRecord> {
        self.metrics.record_read();
        let state = self.current();
        let matches: Vec<DecisionRecord> = state
            .decisions
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        tail_limited(matches, filter.limit)
    }

    /// Durably merge fields into the profile. Keys present in `fields`
    /// overwrite; absent keys keep their prior values. Returns the WAL
    /// sequence of the update.
    pub fn update_profile(&self, fields: BTreeMap<String, Value>) -> Result<u64> {
        let update = ProfileUpdate::new(fields);
        if let Err(e) = update.validate(self.config.max_content_bytes) {
            self.metrics.record_put(false);
            return Err(e);
        }
        let result = self.commit(WalOp::UpdateProfile { update });
        self.metrics.record_put(result.is_ok());
        result
    }

    /// The merged profile as of the current state. Lock-free.
    #[must_use]
    pub fn get_profile(&self) -> Profile {
        self.metrics.record_read();
        self.current().profile.clone()
    }

    /// Snapshot the current state and truncate the WAL through it.
    pub fn checkpoint(&self) -> Result<SnapshotId> {
        let _lock = self.acquire_lock()?;
        let mut inner = self.lock_inner();
        self.checkpoint_locked(&mut inner)
    }

    fn checkpoint_locked(&self, inner: &mut WriterInner) -> Result<SnapshotId> {
        // Another handle on the same files may have appended entries this
        // handle never applied. Fold them in before snapshotting, or the
        // truncation below would destroy their only durable copy.
        let unseen = inner.wal.read_entries(inner.applied_sequence)?;
        if !unseen.entries.is_empty() {
            let mut next = (*self.current()).clone();
            for entry in &unseen.entries {
                let evicted = next.apply(&entry.op, &self.config);
                self.metrics.record_evictions(evicted);
                inner.applied_sequence = entry.sequence;
            }
            debug!(
                entries = unseen.entries.len(),
                "applied entries written by another handle"
            );
            self.swap_state(next);
        }

        let sequence = inner.wal.append(WalOp::Checkpoint)?;
        self.metrics.record_wal_append(1);
        inner.applied_sequence = sequence;

        let state = self.current();
        let id = self.snapshots.create(
            &state.dialogues,
            &state.decisions,
            &state.profile,
            sequence,
            None,
        )?;
        inner.wal.truncate(sequence)?;

        let pruned = self.snapshots.apply_retention(&self.config.retention)?;
        if pruned > 0 {
            debug!(pruned, "retention pruned snapshots");
        }

        inner.last_checkpoint = Instant::now();
        self.metrics.record_checkpoint(epoch_ms());
        self.metrics.set_wal_size(inner.wal.size_bytes()?);
        info!(snapshot = %id, sequence, "checkpoint complete");
        Ok(id)
    }

    /// Checkpoint if the interval elapsed or the WAL grew past the size
    /// trigger. Returns the snapshot id when one was taken. The host
    /// drives the schedule; nothing here runs in the background.
    pub fn maybe_checkpoint(&self) -> Result<Option<SnapshotId>> {
        let due = {
            let inner = self.lock_inner();
            let wal_bytes = inner.wal.size_bytes()?;
            wal_bytes > 0
                && (inner.last_checkpoint.elapsed() >= self.config.checkpoint_interval
                    || wal_bytes >= self.config.checkpoint_wal_bytes)
        };
        if !due {
            return Ok(None);
        }
        self.checkpoint().map(Some)
    }

    /// Write a labeled snapshot of the current state without touching the
    /// WAL. Backups are ordinary snapshots with a name.
    pub fn create_backup(&self, name: &str) -> Result<SnapshotId> {
        if name.trim().is_empty() {
            return Err(Error::validation("backup name must not be empty"));
        }
        let _lock = self.acquire_lock()?;
        let inner = self.lock_inner();
        let state = self.current();
        let id = self.snapshots.create(
            &state.dialogues,
            &state.decisions,
            &state.profile,
            inner.applied_sequence,
            Some(name.to_string()),
        )?;
        info!(snapshot = %id, name, "backup created");
        Ok(id)
    }

    /// Replace the live state with a prior snapshot's, discarding the WAL.
    ///
    /// Point-in-time administrative recovery: everything written after the
    /// snapshot is intentionally dropped.
    pub fn restore_backup(&self, id: &SnapshotId) -> Result<()> {
        let _lock = self.acquire_lock()?;
        let mut inner = self.lock_inner();

        let snapshot = self.snapshots.load(id)?;
        let sequence = snapshot.sequence;
        inner.wal.truncate(u64::MAX)?;
        inner.wal.set_next_sequence(sequence + 1);
        // Snapshots newer than the restore point must go too, or the next
        // recovery would prefer one of them and undo the restore.
        self.snapshots.delete_newer_than(sequence)?;
        inner.applied_sequence = sequence;
        self.swap_state(StoreState::from_snapshot(snapshot));
        self.metrics.set_wal_size(inner.wal.size_bytes()?);

        warn!(snapshot = %id, sequence, "state restored from backup");
        Ok(())
    }

    /// List all snapshots on disk, newest first.
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        Ok(self.snapshots.list()?)
    }

    /// Read-only integrity pass over the WAL and every snapshot file.
    pub fn validate(&self) -> Result<IntegrityReport> {
        let (wal_entries, wal_tail_corruption) = {
            let inner = self.lock_inner();
            let replay = inner.wal.read_entries(0)?;
            (replay.entries.len(), replay.tail_corruption)
        };

        let infos = self.snapshots.list()?;
        let snapshots_total = infos.len();
        let mut snapshots_invalid = Vec::new();
        for info in infos {
            if let Err(e) = self.snapshots.load(&info.id) {
                warn!(snapshot = %info.id, error = %e, "snapshot failed validation");
                snapshots_invalid.push(info.id.as_str().to_string());
            }
        }

        Ok(IntegrityReport {
            wal_entries,
            wal_tail_corruption,
            snapshots_total,
            snapshots_invalid,
        })
    }

    /// Live metric counters.
    #[must_use]
    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    /// Current operational numbers.
    pub fn stats(&self) -> Result<StoreStats> {
        let state = self.current();
        let inner = self.lock_inner();
        Ok(StoreStats {
            dialogues: state.dialogues.len(),
            decisions: state.decisions.len(),
            applied_sequence: inner.applied_sequence,
            wal_size_bytes: inner.wal.size_bytes()?,
            snapshots: self.snapshots.list()?.len(),
        })
    }

    /// Borrowed view of the configuration this store runs with.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Shut down. Every acknowledged write is already durable; this only
    /// logs the final state for the operator.
    pub fn close(self) -> Result<()> {
        let stats = self.stats()?;
        info!(
            dialogues = stats.dialogues,
            decisions = stats.decisions,
            applied_sequence = stats.applied_sequence,
            "store closed"
        );
        Ok(())
    }

    fn acquire_lock(&self) -> Result<StoreLock> {
        StoreLock::acquire(&self.config.lock_path(), &self.lock_config).map_err(|e| {
            if matches!(e, LockError::Timeout { .. }) {
                self.metrics.record_lock_timeout();
            }
            Error::Lock(e)
        })
    }

    fn current(&self) -> Arc<StoreState> {
        match self.state.read() {
            Ok(guard) => Arc::clone(&guard),
            // A writer panicked mid-swap; the Arc inside is still a
            // consistent pre- or post-mutation state.
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn swap_state(&self, next: StoreState) {
        self.metrics
            .set_collection_sizes(next.dialogues.len() as u64, next.decisions.len() as u64);
        let next = Arc::new(next);
        match self.state.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, WriterInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Keep the newest `limit` elements of an oldest-first vector, preserving
/// order.
fn tail_limited<T>(mut items: Vec<T>, limit: Option<usize>) -> Vec<T> {
    if let Some(limit) = limit {
        if items.len() > limit {
            items.drain(..items.len() - limit);
        }
    }
    items
}
