//! Store configuration.
//!
//! The core does not read environment variables or config files; the host
//! process builds a [`StoreConfig`] (by hand or via serde from whatever
//! source it owns) and passes it to [`crate::MemoryStore::open`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::snapshot::RetentionPolicy;

/// Default WAL file name under the storage root.
pub const WAL_FILE: &str = "store.wal";
/// Default snapshot directory name under the storage root.
pub const SNAPSHOT_DIR: &str = "snapshots";
/// Lock file name under the storage root.
pub const LOCK_FILE: &str = "store.lock";
/// Presence marker distinguishing "fresh start" from "corrupted store".
pub const MARKER_FILE: &str = "store.marker";

/// Configuration for the memory store and its collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Storage root directory. WAL, snapshots, lock, and marker live here
    /// unless overridden below.
    pub root: PathBuf,

    /// Override for the WAL file path.
    pub wal_path: Option<PathBuf>,

    /// Override for the snapshot directory.
    pub snapshot_dir: Option<PathBuf>,

    /// Maximum dialogues kept in memory before oldest-first eviction.
    pub max_dialogues: usize,

    /// Maximum decisions kept in memory before oldest-first eviction.
    pub max_decisions: usize,

    /// Size ceiling for a single record body, in bytes.
    pub max_content_bytes: usize,

    /// Minimum time between automatic checkpoints.
    pub checkpoint_interval: Duration,

    /// WAL size that triggers an automatic checkpoint regardless of time.
    pub checkpoint_wal_bytes: u64,

    /// Maximum time a writer waits for the exclusive lock.
    pub lock_timeout: Duration,

    /// Poll interval while waiting on a contended lock.
    pub lock_poll_interval: Duration,

    /// Age after which a held lock's sidecar metadata is considered stale.
    pub lock_stale_grace: Duration,

    /// Snapshot retention policy applied after each checkpoint.
    pub retention: RetentionPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./memory"),
            wal_path: None,
            snapshot_dir: None,
            max_dialogues: 1000,
            max_decisions: 500,
            max_content_bytes: 10 * 1024,
            checkpoint_interval: Duration::from_secs(3600),
            checkpoint_wal_bytes: 4 * 1024 * 1024,
            lock_timeout: Duration::from_secs(10),
            lock_poll_interval: Duration::from_millis(50),
            lock_stale_grace: Duration::from_secs(60),
            retention: RetentionPolicy::keep_last(10),
        }
    }
}

impl StoreConfig {
    /// Build a config rooted at `root` with defaults for everything else.
    #[must_use]
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Effective WAL file path.
    #[must_use]
    pub fn wal_path(&self) -> PathBuf {
        self.wal_path
            .clone()
            .unwrap_or_else(|| self.root.join(WAL_FILE))
    }

    /// Effective snapshot directory.
    #[must_use]
    pub fn snapshot_dir(&self) -> PathBuf {
        self.snapshot_dir
            .clone()
            .unwrap_or_else(|| self.root.join(SNAPSHOT_DIR))
    }

    /// Lock file path for this storage root.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    /// Presence marker path for this storage root.
    #[must_use]
    pub fn marker_path(&self) -> PathBuf {
        self.root.join(MARKER_FILE)
    }

    /// Validate configuration constraints.
    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(Error::validation("storage root must not be empty"));
        }
        if self.max_dialogues == 0 {
            return Err(Error::validation("max_dialogues must be > 0"));
        }
        if self.max_decisions == 0 {
            return Err(Error::validation("max_decisions must be > 0"));
        }
        if self.max_content_bytes == 0 {
            return Err(Error::validation("max_content_bytes must be > 0"));
        }
        if self.checkpoint_wal_bytes == 0 {
            return Err(Error::validation("checkpoint_wal_bytes must be > 0"));
        }
        if self.lock_timeout < Duration::from_millis(1)
            || self.lock_timeout > Duration::from_secs(300)
        {
            return Err(Error::validation(
                "lock_timeout must be between 1ms and 300s",
            ));
        }
        if self.lock_poll_interval.is_zero() || self.lock_poll_interval > self.lock_timeout {
            return Err(Error::validation(
                "lock_poll_interval must be non-zero and <= lock_timeout",
            ));
        }
        if self.checkpoint_interval.is_zero() {
            return Err(Error::validation("checkpoint_interval must be > 0"));
        }
        Ok(())
    }

    pub(crate) fn ensure_root(&self) -> std::io::Result<()> {
        ensure_dir(&self.root)
    }
}

pub(crate) fn ensure_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}
