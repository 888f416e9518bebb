//! Storage layer: on-disk layout, journal writer, checkpoint indexes, and compaction.
//!
//! Every graph role of a database keeps a chain of numbered checkpoints plus
//! the journal layers recorded after the newest one. The `JournalWriter`
//! appends durable delta records; the `CheckpointManager` folds them back
//! into a fresh checkpoint.

/// Checkpoint creation, journal replay, and compaction.
pub mod checkpoint;
/// Compacted checkpoint index with atomic save/load.
pub mod index;
/// Delta streams, per-role gates, and record reading.
pub mod journal;
/// Path arithmetic and directory scans.
pub mod layout;

pub use checkpoint::{CheckpointManager, Replay, ReplayStats};
pub use index::{load_index, save_index, CheckpointIndex, IndexPattern};
pub use journal::{
    read_records, DeltaClass, JournalWriter, ReadStats, RoleGates, StorageFormat, StreamGuard,
    StreamKey, StreamTarget,
};
pub use layout::{RoleFiles, StoreLayout};
