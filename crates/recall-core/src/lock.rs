//! Exclusive, cross-process locking for a storage root.
//!
//! Writers are serialized by an advisory file lock (`fs2`/flock) so that
//! concurrent threads *and* other OS processes (administrative tools run
//! alongside the live service) cannot interleave WAL writes. Acquisition
//! is bounded: a poll loop up to `timeout`, then [`LockError::Timeout`],
//! never an unbounded wait.
//!
//! A sidecar metadata file records the holder (pid, acquisition time) so
//! contention errors can name who is in the way. flock dies with its
//! holder, so a crashed process leaves the lock reclaimable; the stale
//! sidecar is simply overwritten by the next acquirer. A sidecar whose
//! holder no longer exists, or whose age exceeds the stale grace period,
//! additionally allows the lock *file* to be replaced, which reclaims
//! locks wedged by an unresponsive holder.
//!
//! Release is guaranteed on every exit path: [`StoreLock`] unlocks on
//! `Drop`, and dropping twice is harmless.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::records::epoch_ms;

/// Errors from lock operations.
#[derive(Error, Debug)]
pub enum LockError {
    /// The lock is held by another process right now (non-blocking probe).
    #[error("lock held by pid {pid} since {acquired_at_ms}")]
    Held { pid: u32, acquired_at_ms: u64 },

    /// Bounded wait expired without acquiring the lock.
    #[error("timed out after {elapsed:?} waiting for lock on {path}")]
    Timeout { path: String, elapsed: Duration },

    /// I/O error on the lock or sidecar file.
    #[error("lock I/O error: {0}")]
    Io(#[from] io::Error),

    /// Sidecar metadata could not be serialized.
    #[error("lock metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Tunables for lock acquisition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Maximum time to wait before failing with [`LockError::Timeout`].
    pub timeout: Duration,
    /// Poll interval while the lock is contended.
    pub poll_interval: Duration,
    /// Sidecar age beyond which a held lock is treated as stale.
    pub stale_grace: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
            stale_grace: Duration::from_secs(60),
        }
    }
}

/// Sidecar metadata describing the current lock holder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMetadata {
    /// PID of the holding process.
    pub pid: u32,
    /// Acquisition time, epoch milliseconds.
    pub acquired_at_ms: u64,
    /// The holder's configured timeout, for diagnostics.
    pub timeout_ms: u64,
}

impl LockMetadata {
    fn new(config: &LockConfig) -> Self {
        Self {
            pid: std::process::id(),
            acquired_at_ms: epoch_ms(),
            timeout_ms: config.timeout.as_millis() as u64,
        }
    }

    fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.acquired_at_ms)
    }
}

/// An acquired exclusive lock over a storage root. Released on drop.
pub struct StoreLock {
    _lock_file: File,
    lock_path: PathBuf,
    meta_path: PathBuf,
}

impl StoreLock {
    /// Attempt to acquire the lock without waiting.
    ///
    /// Returns [`LockError::Held`] when another holder has it.
    pub fn try_acquire(lock_path: &Path, config: &LockConfig) -> Result<Self, LockError> {
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let meta_path = sidecar_path(lock_path);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => {
                let lock = Self {
                    _lock_file: lock_file,
                    lock_path: lock_path.to_path_buf(),
                    meta_path,
                };
                lock.write_metadata(config)?;
                debug!(path = %lock_path.display(), "acquired store lock");
                Ok(lock)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                match read_metadata(&meta_path) {
                    Some(meta) => Err(LockError::Held {
                        pid: meta.pid,
                        acquired_at_ms: meta.acquired_at_ms,
                    }),
                    None => Err(LockError::Held {
                        pid: 0,
                        acquired_at_ms: 0,
                    }),
                }
            }
            Err(e) => Err(LockError::Io(e)),
        }
    }

    /// Acquire the lock, waiting up to `config.timeout`.
    ///
    /// Polls at `config.poll_interval`. A contended lock whose holder is
    /// gone or whose sidecar exceeds `config.stale_grace` is reclaimed by
    /// replacing the lock file before retrying.
    pub fn acquire(lock_path: &Path, config: &LockConfig) -> Result<Self, LockError> {
        let start = Instant::now();

        loop {
            match Self::try_acquire(lock_path, config) {
                Ok(lock) => return Ok(lock),
                Err(LockError::Held { .. }) => {
                    if reclaim_if_stale(lock_path, config) {
                        continue;
                    }
                    let elapsed = start.elapsed();
                    if elapsed >= config.timeout {
                        return Err(LockError::Timeout {
                            path: lock_path.display().to_string(),
                            elapsed,
                        });
                    }
                    std::thread::sleep(config.poll_interval.min(config.timeout - elapsed));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Probe who currently holds the lock, without acquiring it.
    ///
    /// Returns `None` when the lock is free or no sidecar exists.
    #[must_use]
    pub fn holder(lock_path: &Path) -> Option<LockMetadata> {
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(false)
            .open(lock_path)
            .ok()?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => {
                // Nothing was holding it.
                drop(lock_file);
                None
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                read_metadata(&sidecar_path(lock_path))
            }
            Err(_) => None,
        }
    }

    fn write_metadata(&self, config: &LockConfig) -> Result<(), LockError> {
        let metadata = LockMetadata::new(config);
        let json = serde_json::to_string_pretty(&metadata)?;
        let mut file = File::create(&self.meta_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        // The OS lock is released when the file handle closes. Removing a
        // sidecar that is already gone is fine: release is idempotent.
        if let Err(e) = fs::remove_file(&self.meta_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(
                    meta_path = %self.meta_path.display(),
                    error = %e,
                    "failed to remove lock metadata"
                );
            }
        }
        debug!(path = %self.lock_path.display(), "released store lock");
    }
}

/// Reclaim a contended lock whose sidecar marks it stale.
///
/// Replacing the lock file gives subsequent acquirers a fresh inode to
/// lock; the wedged holder keeps its flock on the orphaned inode, which no
/// longer guards anything. Returns `true` when a reclaim happened.
fn reclaim_if_stale(lock_path: &Path, config: &LockConfig) -> bool {
    let meta_path = sidecar_path(lock_path);
    let Some(meta) = read_metadata(&meta_path) else {
        return false;
    };

    let holder_gone = !process_exists(meta.pid);
    let age_ms = meta.age_ms(epoch_ms());
    let expired = age_ms > config.stale_grace.as_millis() as u64;
    if !holder_gone && !expired {
        return false;
    }

    warn!(
        path = %lock_path.display(),
        holder_pid = meta.pid,
        age_ms,
        holder_gone,
        "reclaiming stale store lock"
    );
    let _ = fs::remove_file(&meta_path);
    fs::remove_file(lock_path).is_ok()
}

/// Best-effort liveness probe for a pid.
#[cfg(target_os = "linux")]
fn process_exists(pid: u32) -> bool {
    pid != 0 && Path::new(&format!("/proc/{pid}")).exists()
}

/// Without /proc we cannot probe cheaply; assume alive and rely on the
/// age-based grace period.
#[cfg(not(target_os = "linux"))]
fn process_exists(pid: u32) -> bool {
    pid != 0
}

fn sidecar_path(lock_path: &Path) -> PathBuf {
    let mut os = lock_path.as_os_str().to_os_string();
    os.push(".meta.json");
    PathBuf::from(os)
}

fn read_metadata(meta_path: &Path) -> Option<LockMetadata> {
    fs::read_to_string(meta_path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lock_path(tmp: &TempDir) -> PathBuf {
        tmp.path().join("store.lock")
    }

    #[test]
    fn acquire_and_release() {
        let tmp = TempDir::new().unwrap();
        let path = lock_path(&tmp);
        let config = LockConfig::default();

        let lock = StoreLock::try_acquire(&path, &config).unwrap();
        let meta_path = lock.meta_path.clone();
        assert!(meta_path.exists());

        drop(lock);
        assert!(!meta_path.exists());
    }

    #[test]
    fn double_acquire_fails() {
        let tmp = TempDir::new().unwrap();
        let path = lock_path(&tmp);
        let config = LockConfig::default();

        let _held = StoreLock::try_acquire(&path, &config).unwrap();
        let result = StoreLock::try_acquire(&path, &config);
        assert!(matches!(result, Err(LockError::Held { .. })));
        if let Err(LockError::Held { pid, .. }) = result {
            assert_eq!(pid, std::process::id());
        }
    }

    #[test]
    fn release_allows_reacquire() {
        let tmp = TempDir::new().unwrap();
        let path = lock_path(&tmp);
        let config = LockConfig::default();

        let lock = StoreLock::try_acquire(&path, &config).unwrap();
        drop(lock);
        let _again = StoreLock::try_acquire(&path, &config).unwrap();
    }

    #[test]
    fn bounded_wait_times_out() {
        let tmp = TempDir::new().unwrap();
        let path = lock_path(&tmp);
        let config = LockConfig {
            timeout: Duration::from_millis(120),
            poll_interval: Duration::from_millis(20),
            stale_grace: Duration::from_secs(600),
        };

        let _held = StoreLock::try_acquire(&path, &config).unwrap();
        let start = Instant::now();
        let result = StoreLock::acquire(&path, &config);
        assert!(matches!(result, Err(LockError::Timeout { .. })));
        assert!(start.elapsed() >= Duration::from_millis(120));
    }

    #[test]
    fn holder_probe_reports_pid() {
        let tmp = TempDir::new().unwrap();
        let path = lock_path(&tmp);
        let config = LockConfig::default();

        assert!(StoreLock::holder(&path).is_none());

        let _held = StoreLock::try_acquire(&path, &config).unwrap();
        let meta = StoreLock::holder(&path).expect("holder metadata");
        assert_eq!(meta.pid, std::process::id());
        assert!(meta.acquired_at_ms > 0);
    }

    #[test]
    fn stale_sidecar_with_dead_holder_is_reclaimed() {
        let tmp = TempDir::new().unwrap();
        let path = lock_path(&tmp);
        let config = LockConfig {
            timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(20),
            stale_grace: Duration::from_secs(600),
        };

        // Simulate a crashed holder: sidecar left behind, no flock held
        // (the lock died with the process). pid u32::MAX never exists.
        fs::write(&path, b"").unwrap();
        let meta = LockMetadata {
            pid: u32::MAX,
            acquired_at_ms: epoch_ms(),
            timeout_ms: 10_000,
        };
        fs::write(
            sidecar_path(&path),
            serde_json::to_string(&meta).unwrap(),
        )
        .unwrap();

        // flock is free, so acquisition succeeds and overwrites the sidecar.
        let lock = StoreLock::acquire(&path, &config).unwrap();
        let current = read_metadata(&sidecar_path(&path)).unwrap();
        assert_eq!(current.pid, std::process::id());
        drop(lock);
    }

    #[test]
    fn expired_grace_reclaims_wedged_lock() {
        let tmp = TempDir::new().unwrap();
        let path = lock_path(&tmp);

        let holder_config = LockConfig::default();
        let _wedged = StoreLock::try_acquire(&path, &holder_config).unwrap();

        // Backdate the sidecar so it exceeds the grace period.
        let meta = LockMetadata {
            pid: std::process::id(),
            acquired_at_ms: epoch_ms().saturating_sub(10 * 60 * 1000),
            timeout_ms: 10_000,
        };
        fs::write(
            sidecar_path(&path),
            serde_json::to_string(&meta).unwrap(),
        )
        .unwrap();

        let config = LockConfig {
            timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(20),
            stale_grace: Duration::from_secs(60),
        };
        // Holder pid is alive, but the grace period has passed: the lock
        // file is replaced and acquisition succeeds on the fresh inode.
        let _reclaimed = StoreLock::acquire(&path, &config).unwrap();
    }

    #[test]
    fn threads_serialize_on_the_same_path() {
        let tmp = TempDir::new().unwrap();
        let path = lock_path(&tmp);
        let config = LockConfig {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(5),
            stale_grace: Duration::from_secs(600),
        };

        let counter = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let path = path.clone();
            let config = config.clone();
            let counter = std::sync::Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                for _ in 0..5 {
                    let _lock = StoreLock::acquire(&path, &config).unwrap();
                    let inside =
                        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    assert_eq!(inside, 0, "two holders inside the critical section");
                    std::thread::sleep(Duration::from_millis(1));
                    counter.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
