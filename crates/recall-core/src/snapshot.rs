//! Snapshot persistence and retention.
//!
//! A snapshot is the complete store state at one WAL sequence, written as
//! a single JSON file under the snapshot directory. Files are written to a
//! temp name, fsynced, then renamed into place, so a reader never sees a
//! half-written snapshot. Recovery takes the newest snapshot that passes
//! validation; damaged files are skipped in favor of the next-older one.
//!
//! Retention is data, not policy baked into the engine: callers supply a
//! [`RetentionPolicy`] (count and/or age bounds) and the store prunes to
//! it after each checkpoint, with one hard rule layered on top: the single
//! newest valid snapshot is never deleted, whatever the policy says.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ensure_dir;
use crate::records::{DecisionRecord, DialogueRecord, Profile, epoch_ms};
use crate::wal::sync_parent_dir;

const SNAPSHOT_PREFIX: &str = "snap_";
const SNAPSHOT_EXT: &str = "json";

/// Errors from snapshot operations.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("snapshot serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("snapshot not found: {0}")]
    NotFound(String),

    #[error("invalid snapshot {name}: {reason}")]
    Invalid { name: String, reason: String },
}

/// Identifies one snapshot file by name (stable across process restarts).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId(String);

impl SnapshotId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Full store state at one WAL sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// WAL sequence this state is consistent at. Replay resumes with
    /// entries strictly after it.
    pub sequence: u64,
    /// Creation time, epoch milliseconds.
    pub created_at_ms: u64,
    /// Optional label; set for named backups, absent for checkpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub dialogues: Vec<DialogueRecord>,
    pub decisions: Vec<DecisionRecord>,
    /// Singleton profile state. Defaulted so snapshots written before the
    /// field existed still load.
    #[serde(default)]
    pub profile: Profile,
}

/// Directory-listing view of one snapshot, without loading its contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: SnapshotId,
    pub sequence: u64,
    pub created_at_ms: u64,
    pub size_bytes: u64,
}

/// Which snapshots to keep after a checkpoint.
///
/// Both bounds are optional and compose: a snapshot is pruned when it
/// falls outside `keep_last` *or* is older than `max_age`. `default()`
/// keeps the last 10. `keep_all()` disables pruning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Keep at most this many newest snapshots.
    pub keep_last: Option<usize>,
    /// Delete snapshots older than this.
    pub max_age: Option<Duration>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::keep_last(10)
    }
}

impl RetentionPolicy {
    /// Keep only the `n` newest snapshots.
    #[must_use]
    pub fn keep_last(n: usize) -> Self {
        Self {
            keep_last: Some(n),
            max_age: None,
        }
    }

    /// Never prune.
    #[must_use]
    pub fn keep_all() -> Self {
        Self {
            keep_last: None,
            max_age: None,
        }
    }
}

/// Manages the snapshot directory.
#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Open (creating the directory if needed).
    pub fn open(dir: &Path) -> Result<Self, SnapshotError> {
        ensure_dir(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Write a snapshot atomically. Returns its id.
    pub fn create(
        &self,
        dialogues: &[DialogueRecord],
        decisions: &[DecisionRecord],
        profile: &Profile,
        sequence: u64,
        label: Option<String>,
    ) -> Result<SnapshotId, SnapshotError> {
        let mut created_at_ms = epoch_ms();
        // Two snapshots at the same sequence within one millisecond would
        // collide; nudge the timestamp instead of overwriting.
        let (name, final_path) = loop {
            let name =
                format!("{SNAPSHOT_PREFIX}{sequence:020}_{created_at_ms}.{SNAPSHOT_EXT}");
            let path = self.dir.join(&name);
            if !path.exists() {
                break (name, path);
            }
            created_at_ms += 1;
        };
        let snapshot = Snapshot {
            sequence,
            created_at_ms,
            label,
            dialogues: dialogues.to_vec(),
            decisions: decisions.to_vec(),
            profile: profile.clone(),
        };

        let tmp_path = self.dir.join(format!("{name}.tmp"));

        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&serde_json::to_vec(&snapshot)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;
        sync_parent_dir(&final_path);

        info!(
            snapshot = %name,
            sequence,
            dialogues = snapshot.dialogues.len(),
            decisions = snapshot.decisions.len(),
            "wrote snapshot"
        );
        Ok(SnapshotId(name))
    }

    /// List snapshots, newest first. Unreadable directory entries and
    /// leftover temp files are ignored.
    pub fn list(&self) -> Result<Vec<SnapshotInfo>, SnapshotError> {
        let mut infos = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(infos),
            Err(e) => return Err(SnapshotError::Io(e)),
        };
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some((sequence, created_at_ms)) = parse_snapshot_name(name) else {
                continue;
            };
            let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            infos.push(SnapshotInfo {
                id: SnapshotId(name.to_string()),
                sequence,
                created_at_ms,
                size_bytes,
            });
        }
        infos.sort_by(|a, b| {
            (b.sequence, b.created_at_ms).cmp(&(a.sequence, a.created_at_ms))
        });
        Ok(infos)
    }

    /// Load one snapshot by id, validating it.
    pub fn load(&self, id: &SnapshotId) -> Result<Snapshot, SnapshotError> {
        let path = self.dir.join(id.as_str());
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SnapshotError::NotFound(id.as_str().to_string()));
            }
            Err(e) => return Err(SnapshotError::Io(e)),
        };
        let snapshot: Snapshot =
            serde_json::from_slice(&bytes).map_err(|e| SnapshotError::Invalid {
                name: id.as_str().to_string(),
                reason: format!("unparseable: {e}"),
            })?;
        validate_structure(id.as_str(), &snapshot)?;
        Ok(snapshot)
    }

    /// Newest snapshot that loads and validates. Damaged files are skipped
    /// with a warning in favor of the next-older one.
    pub fn latest_valid(&self) -> Result<Option<(SnapshotId, Snapshot)>, SnapshotError> {
        for info in self.list()? {
            match self.load(&info.id) {
                Ok(snapshot) => return Ok(Some((info.id, snapshot))),
                Err(SnapshotError::Invalid { name, reason }) => {
                    warn!(snapshot = %name, %reason, "skipping invalid snapshot");
                }
                Err(SnapshotError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Prune snapshots outside the policy. Returns how many were deleted.
    ///
    /// The newest valid snapshot always survives, even when the policy
    /// would delete it.
    pub fn apply_retention(&self, policy: &RetentionPolicy) -> Result<usize, SnapshotError> {
        let infos = self.list()?;
        if infos.is_empty() {
            return Ok(0);
        }

        let anchor = self
            .latest_valid()?
            .map(|(id, _)| id);

        let now_ms = epoch_ms();
        let mut deleted = 0usize;
        for (index, info) in infos.iter().enumerate() {
            if Some(&info.id) == anchor.as_ref() {
                continue;
            }
            let over_count = policy.keep_last.is_some_and(|k| index >= k);
            let over_age = policy.max_age.is_some_and(|max| {
                now_ms.saturating_sub(info.created_at_ms) > max.as_millis() as u64
            });
            if !over_count && !over_age {
                continue;
            }
            match fs::remove_file(self.dir.join(info.id.as_str())) {
                Ok(()) => {
                    debug!(snapshot = %info.id, "pruned snapshot");
                    deleted += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(snapshot = %info.id, error = %e, "failed to prune snapshot");
                }
            }
        }
        Ok(deleted)
    }

    /// Delete every snapshot with `sequence > through`. Returns how many
    /// were removed.
    ///
    /// Used by point-in-time restore: snapshots newer than the restored
    /// one would win the next recovery and silently undo the restore.
    pub fn delete_newer_than(&self, through: u64) -> Result<usize, SnapshotError> {
        let mut deleted = 0usize;
        for info in self.list()? {
            if info.sequence <= through {
                continue;
            }
            match fs::remove_file(self.dir.join(info.id.as_str())) {
                Ok(()) => {
                    warn!(snapshot = %info.id, through, "deleted snapshot newer than restore point");
                    deleted += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(SnapshotError::Io(e)),
            }
        }
        Ok(deleted)
    }
}

/// `snap_<sequence:020>_<created_at_ms>.json`
fn parse_snapshot_name(name: &str) -> Option<(u64, u64)> {
    let stem = name
        .strip_prefix(SNAPSHOT_PREFIX)?
        .strip_suffix(&format!(".{SNAPSHOT_EXT}"))?;
    let (seq_part, ts_part) = stem.split_once('_')?;
    Some((seq_part.parse().ok()?, ts_part.parse().ok()?))
}

fn validate_structure(name: &str, snapshot: &Snapshot) -> Result<(), SnapshotError> {
    let named = parse_snapshot_name(name);
    if let Some((sequence, _)) = named {
        if sequence != snapshot.sequence {
            return Err(SnapshotError::Invalid {
                name: name.to_string(),
                reason: format!(
                    "file named for sequence {sequence} but contains {}",
                    snapshot.sequence
                ),
            });
        }
    }
    let ordered = |timestamps: &mut dyn Iterator<Item = u64>| {
        let mut prev = 0u64;
        for ts in timestamps {
            if ts < prev {
                return false;
            }
            prev = ts;
        }
        true
    };
    if !ordered(&mut snapshot.dialogues.iter().map(|d| d.timestamp_ms)) {
        return Err(SnapshotError::Invalid {
            name: name.to_string(),
            reason: "dialogues out of timestamp order".to_string(),
        });
    }
    if !ordered(&mut snapshot.decisions.iter().map(|d| d.timestamp_ms)) {
        return Err(SnapshotError::Invalid {
            name: name.to_string(),
            reason: "decisions out of timestamp order".to_string(),
        });
    }
    Ok(())
}
