//! Checkpointing of instance state.
//!
//! A checkpoint captures everything needed to rewind an instance:
//! status, frontier, variables, retry counters, approval responses,
//! and open join barriers. The execution log is deliberately excluded;
//! it is append-only and survives restores untouched.
//!
//! Snapshots are serialized to JSON, hashed with SHA-256, and written
//! to a [`StorageBackend`] together with a metadata record. Load
//! verifies both the schema version and the checksum before handing
//! the state back.

use crate::engine::instance::{
    ApprovalResponse, ExecutionStatus, FrontierEntry, InstanceId, JoinBarrier, WaitState,
};
use crate::model::context::VariableContext;
use crate::model::step::StepId;
use crate::state::storage::{StorageBackend, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Current checkpoint schema version. Bumped when the snapshot layout
/// changes incompatibly.
pub const CHECKPOINT_SCHEMA_VERSION: &str = "1.0";

/// Errors raised by checkpoint operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("checkpoint not found: {0}")]
    NotFound(String),

    #[error("checkpoint {id} failed checksum verification")]
    ChecksumMismatch { id: String },

    #[error("checkpoint {id} has schema version {found}, expected {expected}")]
    SchemaVersionMismatch {
        id: String,
        found: String,
        expected: String,
    },

    #[error("a checkpoint for instance {0} is already in progress")]
    InProgress(InstanceId),
}

/// Descriptive record stored alongside each snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub id: String,
    pub instance_id: InstanceId,
    pub schema_version: String,
    pub created_at: DateTime<Utc>,
    /// Size of the serialized snapshot in bytes.
    pub size: usize,
    /// SHA-256 of the serialized snapshot, hex-encoded.
    pub checksum: String,
}

/// The rewindable portion of an instance's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    pub instance_id: InstanceId,
    pub status: ExecutionStatus,
    pub frontier: Vec<FrontierEntry>,
    pub variables: VariableContext,
    pub retries_used: HashMap<StepId, u32>,
    pub approvals: HashMap<StepId, Vec<ApprovalResponse>>,
    pub joins: HashMap<StepId, JoinBarrier>,
    pub next_entry_id: u64,
    pub captured_at: DateTime<Utc>,
}

impl CheckpointState {
    /// Normalize the frontier for persistence: actions in flight at
    /// capture time are re-dispatched after a restore.
    pub fn normalize(mut self) -> Self {
        for entry in &mut self.frontier {
            if entry.wait == WaitState::Dispatching {
                entry.wait = WaitState::Ready;
            }
        }
        self
    }
}

/// Saves, loads, lists, and prunes checkpoints on a storage backend.
pub struct CheckpointManager<S: StorageBackend> {
    storage: Arc<S>,
    /// Per-instance save locks; concurrent saves for the same instance
    /// are rejected rather than interleaved.
    save_locks: Mutex<HashMap<InstanceId, Arc<Mutex<()>>>>,
}

impl<S: StorageBackend> CheckpointManager<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            save_locks: Mutex::new(HashMap::new()),
        }
    }

    fn data_key(id: &str) -> String {
        format!("checkpoint-{}.json", id)
    }

    fn meta_key(id: &str) -> String {
        format!("meta-{}.json", id)
    }

    fn meta_prefix(instance_id: &str) -> String {
        format!("meta-{}-", instance_id)
    }

    /// Persist a snapshot and return the new checkpoint id.
    pub async fn save(&self, state: CheckpointState) -> Result<String, CheckpointError> {
        let state = state.normalize();
        let instance_id = state.instance_id.clone();

        let lock = {
            let mut locks = self.save_locks.lock().await;
            locks
                .entry(instance_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let Ok(_guard) = lock.try_lock() else {
            return Err(CheckpointError::InProgress(instance_id));
        };

        let id = format!(
            "{}-{}-{}",
            instance_id,
            Utc::now().timestamp_millis(),
            Uuid::new_v4().simple()
        );
        let data = serde_json::to_vec(&state)?;
        let metadata = CheckpointMetadata {
            id: id.clone(),
            instance_id,
            schema_version: CHECKPOINT_SCHEMA_VERSION.to_string(),
            created_at: Utc::now(),
            size: data.len(),
            checksum: sha256_hex(&data),
        };
        let meta_bytes = serde_json::to_vec(&metadata)?;

        // Data first, metadata last; a checkpoint without its metadata
        // record is invisible to list and load.
        self.storage.store(&Self::data_key(&id), &data).await?;
        self.storage.store(&Self::meta_key(&id), &meta_bytes).await?;

        log::debug!("saved checkpoint {} ({} bytes)", id, data.len());
        Ok(id)
    }

    /// Load and verify a snapshot by checkpoint id.
    pub async fn load(&self, id: &str) -> Result<CheckpointState, CheckpointError> {
        let metadata = self.load_metadata(id).await?;
        if metadata.schema_version != CHECKPOINT_SCHEMA_VERSION {
            return Err(CheckpointError::SchemaVersionMismatch {
                id: id.to_string(),
                found: metadata.schema_version,
                expected: CHECKPOINT_SCHEMA_VERSION.to_string(),
            });
        }

        let data = match self.storage.load(&Self::data_key(id)).await {
            Ok(data) => data,
            Err(StorageError::NotFound(_)) => {
                return Err(CheckpointError::NotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        if sha256_hex(&data) != metadata.checksum {
            return Err(CheckpointError::ChecksumMismatch { id: id.to_string() });
        }

        let state: CheckpointState = serde_json::from_slice(&data)?;
        Ok(state.normalize())
    }

    /// Metadata of one checkpoint.
    pub async fn load_metadata(&self, id: &str) -> Result<CheckpointMetadata, CheckpointError> {
        let bytes = match self.storage.load(&Self::meta_key(id)).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound(_)) => {
                return Err(CheckpointError::NotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// All checkpoints of an instance, oldest first.
    pub async fn list(&self, instance_id: &str) -> Result<Vec<CheckpointMetadata>, CheckpointError> {
        let keys = self.storage.list(&Self::meta_prefix(instance_id)).await?;
        let mut checkpoints = Vec::with_capacity(keys.len());
        for key in keys {
            let bytes = self.storage.load(&key).await?;
            checkpoints.push(serde_json::from_slice::<CheckpointMetadata>(&bytes)?);
        }
        checkpoints.sort_by_key(|m| m.created_at);
        Ok(checkpoints)
    }

    /// Delete a checkpoint and its metadata.
    pub async fn delete(&self, id: &str) -> Result<(), CheckpointError> {
        self.storage.delete(&Self::data_key(id)).await?;
        self.storage.delete(&Self::meta_key(id)).await?;
        Ok(())
    }

    /// Keep the newest `keep` checkpoints of an instance and delete the
    /// rest. Returns the number deleted.
    pub async fn prune(&self, instance_id: &str, keep: usize) -> Result<usize, CheckpointError> {
        let checkpoints = self.list(instance_id).await?;
        if checkpoints.len() <= keep {
            return Ok(0);
        }
        let excess = checkpoints.len() - keep;
        for metadata in checkpoints.iter().take(excess) {
            self.delete(&metadata.id).await?;
        }
        Ok(excess)
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::storage::MemoryStorage;

    fn sample_state(instance_id: &str) -> CheckpointState {
        let mut variables = VariableContext::new();
        variables.set("department", "marketing");
        CheckpointState {
            instance_id: instance_id.to_string(),
            status: ExecutionStatus::Running,
            frontier: vec![FrontierEntry {
                entry_id: 7,
                step: StepId::from("publish"),
                branch: None,
                wait: WaitState::Dispatching,
            }],
            variables,
            retries_used: HashMap::from([(StepId::from("publish"), 1)]),
            approvals: HashMap::new(),
            joins: HashMap::new(),
            next_entry_id: 8,
            captured_at: Utc::now(),
        }
    }

    fn manager() -> CheckpointManager<MemoryStorage> {
        CheckpointManager::new(Arc::new(MemoryStorage::new()))
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let manager = manager();
        let id = manager.save(sample_state("wf-1")).await.unwrap();

        let state = manager.load(&id).await.unwrap();
        assert_eq!(state.instance_id, "wf-1");
        assert_eq!(state.retries_used[&StepId::from("publish")], 1);
        // In-flight dispatch is normalized back to Ready.
        assert_eq!(state.frontier[0].wait, WaitState::Ready);
    }

    #[tokio::test]
    async fn test_metadata_records_size_and_checksum() {
        let manager = manager();
        let id = manager.save(sample_state("wf-1")).await.unwrap();

        let metadata = manager.load_metadata(&id).await.unwrap();
        assert_eq!(metadata.instance_id, "wf-1");
        assert_eq!(metadata.schema_version, CHECKPOINT_SCHEMA_VERSION);
        assert!(metadata.size > 0);
        assert_eq!(metadata.checksum.len(), 64);
    }

    #[tokio::test]
    async fn test_corrupted_data_fails_checksum() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = CheckpointManager::new(storage.clone());
        let id = manager.save(sample_state("wf-1")).await.unwrap();

        storage
            .store(
                &CheckpointManager::<MemoryStorage>::data_key(&id),
                b"{\"tampered\":true}",
            )
            .await
            .unwrap();

        assert!(matches!(
            manager.load(&id).await,
            Err(CheckpointError::ChecksumMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_and_prune_keep_newest() {
        let manager = manager();
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(manager.save(sample_state("wf-1")).await.unwrap());
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        manager.save(sample_state("wf-2")).await.unwrap();

        assert_eq!(manager.list("wf-1").await.unwrap().len(), 4);

        let deleted = manager.prune("wf-1", 2).await.unwrap();
        assert_eq!(deleted, 2);

        let remaining = manager.list("wf-1").await.unwrap();
        assert_eq!(remaining.len(), 2);
        // The two newest survive.
        assert_eq!(remaining[0].id, ids[2]);
        assert_eq!(remaining[1].id, ids[3]);

        // The other instance is untouched.
        assert_eq!(manager.list("wf-2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_checkpoint() {
        let manager = manager();
        assert!(matches!(
            manager.load("ghost").await,
            Err(CheckpointError::NotFound(_))
        ));
    }
}
