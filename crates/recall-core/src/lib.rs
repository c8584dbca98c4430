//! recall-core: durable, crash-recoverable store for agent memory
//!
//! This crate keeps an agent's conversational state (dialogue turns and
//! recorded decisions) in memory for fast reads, and makes every mutation
//! durable through a write-ahead log with periodic snapshot checkpoints.
//! A process crash at any point recovers to exactly the last acknowledged
//! write.
//!
//! # Architecture
//!
//! ```text
//! put/delete → validate → file lock → WAL append (fsync) → state swap
//!                                                              ↓
//! get ─────────────────────────────── Arc<StoreState> (lock-free reads)
//!
//! checkpoint → Checkpoint entry → snapshot (tmp+rename) → WAL truncate
//! open ───────→ latest valid snapshot + WAL replay = recovered state
//! ```
//!
//! # Modules
//!
//! - `store`: the [`MemoryStore`] orchestrator
//! - `wal`: append-only log with checksums and corrupt-tail tolerance
//! - `snapshot`: atomic snapshot files and retention
//! - `recovery`: snapshot-plus-replay startup path
//! - `lock`: cross-process exclusive locking with bounded wait
//! - `records`: dialogue and decision record types
//! - `config`: [`StoreConfig`]
//! - `metrics`: atomic counters for external exporters
//! - `logging`: `tracing` subscriber setup for host processes
//! - `error`: the [`Error`] taxonomy
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod lock;
pub mod logging;
pub mod metrics;
pub mod records;
pub mod recovery;
pub mod snapshot;
pub mod store;
pub mod wal;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use metrics::{MetricsSnapshot, StoreMetrics};
pub use records::{DecisionRecord, DialogueRecord, Profile, ProfileUpdate, RecordKind, Role};
pub use recovery::RecoveryReport;
pub use snapshot::{RetentionPolicy, SnapshotId, SnapshotInfo};
pub use store::{
    DecisionFilter, DialogueFilter, IntegrityReport, MemoryStore, StoreStats,
};
