//! Keyed aggregation state: per-key serialized folds, offset tracking
//! and durable checkpoints (state snapshot + offsets in one atomic write).

pub mod checkpoint;
pub mod error;
mod store;

pub use checkpoint::{
    Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, OffsetTracker,
};
pub use error::{CheckpointError, StateStoreError};
pub use store::{Applied, FoldMode, Snapshot, SnapshotEntry, SourcePosition, StateStore, Versioned};
