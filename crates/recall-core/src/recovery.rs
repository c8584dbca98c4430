//! Startup recovery: latest valid snapshot plus WAL replay.
//!
//! Recovered state is defined as the newest valid snapshot (or empty state
//! at sequence 0) with every trusted WAL entry after its sequence applied
//! in order, exactly once, under the same eviction rules as live writes.
//! That makes recovery after a crash indistinguishable from an execution
//! that never crashed, for every acknowledged append.
//!
//! Damage is absorbed best-effort: corrupt snapshots are skipped, a
//! corrupt WAL tail is dropped, and the loss is reported in the
//! [`RecoveryReport`]. The one fatal case is a storage root whose marker
//! says data existed while nothing usable remains at all.

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::snapshot::SnapshotStore;
use crate::store::StoreState;
use crate::wal::{TailCorruption, Wal};

/// What recovery found and did, surfaced to the caller of `open`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Sequence of the snapshot recovery started from, if any.
    pub snapshot_sequence: Option<u64>,
    /// WAL entries applied on top of the snapshot.
    pub entries_replayed: usize,
    /// Unrecoverable tail damage, already discarded.
    pub tail_corruption: Option<TailCorruption>,
    /// True when the storage root had never been initialized before.
    pub fresh_start: bool,
}

#[derive(Debug)]
pub(crate) struct Recovered {
    pub state: StoreState,
    /// Highest sequence reflected in `state`; appends resume after it.
    pub applied_sequence: u64,
    pub report: RecoveryReport,
}

/// Rebuild store state from disk.
///
/// `marker_exists` distinguishes "this root held data before" from a
/// genuinely fresh directory, which decides whether total absence of
/// usable state is fatal or just a first boot.
pub(crate) fn recover(
    wal: &Wal,
    snapshots: &SnapshotStore,
    config: &StoreConfig,
    marker_exists: bool,
) -> Result<Recovered> {
    let base = snapshots.latest_valid()?;
    let (mut state, snapshot_sequence) = match base {
        Some((id, snapshot)) => {
            info!(
                snapshot = %id,
                sequence = snapshot.sequence,
                "recovering from snapshot"
            );
            let sequence = snapshot.sequence;
            (StoreState::from_snapshot(snapshot), Some(sequence))
        }
        None => (StoreState::default(), None),
    };

    let base_sequence = snapshot_sequence.unwrap_or(0);
    let replay = wal.read_entries(base_sequence)?;
    let entries_replayed = replay.entries.len();

    let mut applied_sequence = base_sequence;
    for entry in &replay.entries {
        state.apply(&entry.op, config);
        applied_sequence = entry.sequence;
    }

    let tail_corruption = wal
        .open_tail_corruption()
        .cloned()
        .or(replay.tail_corruption);

    if marker_exists && snapshot_sequence.is_none() && entries_replayed == 0 {
        let snapshot_files = snapshots.list()?.len();
        let evidence_of_data = snapshot_files > 0 || tail_corruption.is_some();
        if evidence_of_data {
            error!(
                snapshot_files,
                tail = ?tail_corruption,
                "store was initialized but nothing usable survives"
            );
            return Err(Error::Corruption {
                detail: format!(
                    "marker present but no valid snapshot or WAL entry remains \
                     ({snapshot_files} unreadable snapshot file(s))"
                ),
            });
        }
        // Initialized but never written to: legitimately empty.
    }

    if let Some(tc) = &tail_corruption {
        warn!(
            line = tc.line,
            reason = %tc.reason,
            "recovery discarded a corrupt WAL tail"
        );
    }

    let fresh_start = !marker_exists;
    info!(
        snapshot_sequence,
        entries_replayed,
        applied_sequence,
        fresh_start,
        dialogues = state.dialogues.len(),
        decisions = state.decisions.len(),
        "recovery complete"
    );

    Ok(Recovered {
        state,
        applied_sequence,
        report: RecoveryReport {
            snapshot_sequence,
            entries_replayed,
            tail_corruption,
            fresh_start,
        },
    })
}
