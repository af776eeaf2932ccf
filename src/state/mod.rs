//! Persistence: checkpoint snapshots and the storage backends they
//! live on.

pub mod checkpoint;
pub mod storage;

pub use checkpoint::{
    CheckpointError, CheckpointManager, CheckpointMetadata, CheckpointState,
    CHECKPOINT_SCHEMA_VERSION,
};
pub use storage::{FileStorage, MemoryStorage, StorageBackend, StorageError};
