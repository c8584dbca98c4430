//! Append-only write-ahead log.
//!
//! One JSON entry per line. Every mutation is appended and fsynced here
//! *before* the in-memory state changes, so a crash at any point loses at
//! most the unacknowledged tail. Entries carry strictly increasing,
//! gapless sequence numbers and a SHA-256 checksum over the serialized
//! operation, which is how replay distinguishes a torn final write from
//! silent mid-file damage.
//!
//! Corruption policy: the first line that fails to parse, fails its
//! checksum, or regresses the sequence ends the valid log. Everything
//! before it is trusted; everything after is discarded and the loss is
//! reported to the caller. Losing an unsynced tail is expected
//! crash behavior, not a fatal condition.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::records::{DecisionRecord, DialogueRecord, ProfileUpdate, RecordKind, epoch_ms};

/// Errors from WAL operations.
///
/// Any error from `append` means durability was not confirmed; the caller
/// must not apply the corresponding in-memory mutation.
#[derive(Error, Debug)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("WAL serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("WAL sequence regression: expected > {last}, found {found}")]
    SequenceRegression { last: u64, found: u64 },
}

/// A logged mutation. The checksum in [`WalEntry`] covers the serialized
/// bytes of this value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WalOp {
    PutDialogue { record: DialogueRecord },
    PutDecision { record: DecisionRecord },
    /// Merge fields into the singleton profile.
    UpdateProfile { update: ProfileUpdate },
    Delete { kind: RecordKind, id: String },
    /// Marks a consistent point: a snapshot exists at this entry's
    /// sequence, and the log may be truncated through it.
    Checkpoint,
}

/// One durable log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Strictly increasing, gapless within one log.
    pub sequence: u64,
    /// Append time, epoch milliseconds.
    pub timestamp_ms: u64,
    /// SHA-256 (hex) of the serialized `op`.
    pub checksum: String,
    pub op: WalOp,
}

impl WalEntry {
    fn build(sequence: u64, op: WalOp) -> Result<Self, WalError> {
        let checksum = op_checksum(&op)?;
        Ok(Self {
            sequence,
            timestamp_ms: epoch_ms(),
            checksum,
            op,
        })
    }

    /// Recompute the op checksum and compare against the stored one.
    #[must_use]
    pub fn checksum_ok(&self) -> bool {
        op_checksum(&self.op).is_ok_and(|c| c == self.checksum)
    }
}

fn op_checksum(op: &WalOp) -> Result<String, WalError> {
    let bytes = serde_json::to_vec(op)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Where and why the valid log ended early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailCorruption {
    /// 1-based line number of the first bad line.
    pub line: usize,
    pub reason: String,
}

/// Result of reading the log: the trusted entries plus any tail damage.
#[derive(Debug)]
pub struct WalReplay {
    pub entries: Vec<WalEntry>,
    pub tail_corruption: Option<TailCorruption>,
}

/// Append-only writer plus replayable reader over one log file.
///
/// Not internally synchronized. Writers must already hold the store's
/// exclusive lock; `Wal` only defends against *other processes* having
/// appended between our writes, by re-syncing its sequence counter when
/// the file length no longer matches what we last saw.
#[derive(Debug)]
pub struct Wal {
    path: PathBuf,
    writer: BufWriter<File>,
    next_sequence: u64,
    /// File length after our last confirmed write. A mismatch at append
    /// time means another process appended; we re-scan before continuing.
    synced_len: u64,
    /// Tail damage found (and truncated away) when this handle opened.
    open_tail: Option<TailCorruption>,
}

impl Wal {
    /// Open (or create) the log at `path`.
    ///
    /// Scans existing content to find the last valid sequence. A corrupt
    /// tail is physically truncated away here so later appends extend the
    /// trusted prefix rather than burying garbage mid-file.
    pub fn open(path: &Path) -> Result<Self, WalError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let scan = scan_log(path)?;
        if let Some(tc) = &scan.tail_corruption {
            warn!(
                path = %path.display(),
                line = tc.line,
                reason = %tc.reason,
                discarded_bytes = scan.file_len - scan.valid_len,
                "discarding corrupt WAL tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(scan.valid_len)?;
            file.sync_data()?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;
        file.seek(SeekFrom::End(0))?;

        debug!(
            path = %path.display(),
            last_sequence = scan.last_sequence,
            bytes = scan.valid_len,
            "opened WAL"
        );
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            next_sequence: scan.last_sequence + 1,
            synced_len: scan.valid_len,
            open_tail: scan.tail_corruption,
        })
    }

    /// Tail corruption discarded when this handle opened, if any.
    #[must_use]
    pub fn open_tail_corruption(&self) -> Option<&TailCorruption> {
        self.open_tail.as_ref()
    }

    /// Append one operation durably. Returns the assigned sequence.
    ///
    /// The entry is flushed and `sync_data`ed before this returns; an
    /// acknowledged append survives a crash immediately after.
    pub fn append(&mut self, op: WalOp) -> Result<u64, WalError> {
        self.append_batch(std::iter::once(op))
            .map(|seqs| seqs[seqs.len() - 1])
    }

    /// Append a batch of operations with a single fsync (group commit).
    ///
    /// Returns the assigned sequences in order. Either the whole batch is
    /// durable or the error means none of it may be applied.
    pub fn append_batch(
        &mut self,
        ops: impl IntoIterator<Item = WalOp>,
    ) -> Result<Vec<u64>, WalError> {
        self.resync_if_moved()?;

        let mut sequences = Vec::new();
        let mut written = 0u64;
        for op in ops {
            let sequence = self.next_sequence + sequences.len() as u64;
            let entry = WalEntry::build(sequence, op)?;
            let mut line = serde_json::to_vec(&entry)?;
            line.push(b'\n');
            self.writer.write_all(&line)?;
            written += line.len() as u64;
            sequences.push(sequence);
        }
        if sequences.is_empty() {
            return Ok(sequences);
        }

        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;

        self.next_sequence += sequences.len() as u64;
        self.synced_len += written;
        Ok(sequences)
    }

    /// Read all trusted entries with `sequence > from_sequence`, ascending.
    ///
    /// Re-reads from the head each call, so replay is repeatable. Tail
    /// damage is reported, not raised.
    pub fn read_entries(&self, from_sequence: u64) -> Result<WalReplay, WalError> {
        let scan = scan_log(&self.path)?;
        if let Some(tc) = &scan.tail_corruption {
            warn!(
                path = %self.path.display(),
                line = tc.line,
                reason = %tc.reason,
                "WAL tail corruption detected during read"
            );
        }
        Ok(WalReplay {
            entries: scan
                .entries
                .into_iter()
                .filter(|e| e.sequence > from_sequence)
                .collect(),
            tail_corruption: scan.tail_corruption,
        })
    }

    /// Drop every entry with `sequence <= through_sequence`.
    ///
    /// The surviving suffix is rewritten to a temp file and renamed into
    /// place, so a crash mid-truncation leaves either the old or the new
    /// log, never a torn one.
    pub fn truncate(&mut self, through_sequence: u64) -> Result<(), WalError> {
        let scan = scan_log(&self.path)?;
        let survivors: Vec<&WalEntry> = scan
            .entries
            .iter()
            .filter(|e| e.sequence > through_sequence)
            .collect();

        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for entry in &survivors {
                let mut line = serde_json::to_vec(entry)?;
                line.push(b'\n');
                tmp.write_all(&line)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_data()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        sync_parent_dir(&self.path);

        // The old writer handle points at the unlinked inode; reopen.
        let mut file = OpenOptions::new().append(true).read(true).open(&self.path)?;
        let len = file.seek(SeekFrom::End(0))?;
        self.writer = BufWriter::new(file);
        self.synced_len = len;

        debug!(
            path = %self.path.display(),
            through_sequence,
            surviving = survivors.len(),
            "truncated WAL"
        );
        Ok(())
    }

    /// Current log size in bytes.
    pub fn size_bytes(&self) -> Result<u64, WalError> {
        Ok(fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0))
    }

    /// Sequence of the most recent acknowledged append, 0 if none.
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.next_sequence - 1
    }

    /// Force the next append to start at `sequence`.
    ///
    /// Used after restoring from a snapshot, where the restored state's
    /// sequence must not collide with stale log history.
    pub(crate) fn set_next_sequence(&mut self, sequence: u64) {
        self.next_sequence = sequence;
    }

    /// Re-scan the log when another process appended since our last write,
    /// so our next sequence stays gapless across process boundaries.
    fn resync_if_moved(&mut self) -> Result<(), WalError> {
        let current_len = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if current_len == self.synced_len {
            return Ok(());
        }

        let scan = scan_log(&self.path)?;
        if scan.last_sequence + 1 < self.next_sequence {
            // The file shrank beneath us outside `truncate`. Honoring its
            // sequences would regress ours.
            return Err(WalError::SequenceRegression {
                last: self.next_sequence - 1,
                found: scan.last_sequence,
            });
        }
        debug!(
            path = %self.path.display(),
            old_next = self.next_sequence,
            new_next = scan.last_sequence + 1,
            "resynced WAL sequence after external append"
        );
        let mut file = OpenOptions::new().append(true).read(true).open(&self.path)?;
        file.seek(SeekFrom::End(0))?;
        self.writer = BufWriter::new(file);
        self.next_sequence = scan.last_sequence + 1;
        self.synced_len = scan.valid_len;
        Ok(())
    }
}

struct LogScan {
    entries: Vec<WalEntry>,
    last_sequence: u64,
    /// Byte length of the trusted prefix.
    valid_len: u64,
    file_len: u64,
    tail_corruption: Option<TailCorruption>,
}

/// Parse the log from the head, stopping at the first bad line.
fn scan_log(path: &Path) -> Result<LogScan, WalError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(LogScan {
                entries: Vec::new(),
                last_sequence: 0,
                valid_len: 0,
                file_len: 0,
                tail_corruption: None,
            });
        }
        Err(e) => return Err(WalError::Io(e)),
    };
    let file_len = file.metadata()?.len();

    let mut entries = Vec::new();
    let mut last_sequence = 0u64;
    let mut valid_len = 0u64;
    let mut tail_corruption = None;

    let mut reader = BufReader::new(file);
    let mut line = String::new();
    let mut line_no = 0usize;
    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            break;
        }
        line_no += 1;

        let trimmed = line.trim_end_matches('\n');
        if trimmed.is_empty() {
            // Torn-write residue; ends the trusted prefix so the opener
            // truncates it away instead of appending after it.
            tail_corruption = Some(TailCorruption {
                line: line_no,
                reason: "empty line".to_string(),
            });
            break;
        }

        let entry: WalEntry = match serde_json::from_str(trimmed) {
            Ok(e) => e,
            Err(e) => {
                tail_corruption = Some(TailCorruption {
                    line: line_no,
                    reason: format!("unparseable entry: {e}"),
                });
                break;
            }
        };
        if !entry.checksum_ok() {
            tail_corruption = Some(TailCorruption {
                line: line_no,
                reason: "checksum mismatch".to_string(),
            });
            break;
        }
        if entry.sequence <= last_sequence {
            tail_corruption = Some(TailCorruption {
                line: line_no,
                reason: format!(
                    "sequence regression ({} after {last_sequence})",
                    entry.sequence
                ),
            });
            break;
        }

        last_sequence = entry.sequence;
        valid_len += n as u64;
        entries.push(entry);
    }

    Ok(LogScan {
        entries,
        last_sequence,
        valid_len,
        file_len,
        tail_corruption,
    })
}

/// Durability of a rename requires the parent directory entry to reach
/// disk too. Failure here is logged, not raised: the data itself is safe.
pub(crate) fn sync_parent_dir(path: &Path) {
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        match File::open(parent) {
            Ok(dir) => {
                if let Err(e) = dir.sync_all() {
                    warn!(dir = %parent.display(), error = %e, "directory fsync failed");
                }
            }
            Err(e) => {
                warn!(dir = %parent.display(), error = %e, "directory open for fsync failed");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}
