//! Durable per-stage snapshots of task state.
//!
//! A checkpoint is keyed by (run scope, task id, stage) and holds the task
//! state immediately after that stage completed. Records are immutable:
//! writing an existing key returns the snapshot already stored.

mod store;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::error::CheckpointError;
use crate::pipeline::{Fields, StageKind};

pub use store::FileCheckpointStore;

/// Namespace under which a set of checkpoints belongs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunScope {
    root: PathBuf,
}

impl RunScope {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Checkpoint scope belonging to a run directory.
    pub fn for_run_dir(run_dir: impl AsRef<Path>) -> Self {
        Self::new(run_dir.as_ref().join("checkpoints"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Stored form of a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub task_id: String,
    pub stage: StageKind,
    pub created_at: DateTime<Utc>,
    /// Hex SHA-256 of the serialized state. Floats must parse back exactly
    /// for this to hold, hence serde_json's `float_roundtrip` feature.
    pub checksum: String,
    pub state: Fields,
}

impl CheckpointRecord {
    pub fn new(task_id: &str, stage: StageKind, state: Fields) -> Result<Self, CheckpointError> {
        Ok(Self {
            task_id: task_id.to_string(),
            stage,
            created_at: Utc::now(),
            checksum: state_checksum(&state)?,
            state,
        })
    }

    /// Checks that the record belongs to the expected key and is intact.
    pub fn verify(&self, task_id: &str, stage: StageKind) -> Result<(), CheckpointError> {
        let corrupt = |reason: String| CheckpointError::Corrupt {
            task_id: task_id.to_string(),
            stage: stage.to_string(),
            reason,
        };

        if self.task_id != task_id || self.stage != stage {
            return Err(corrupt(format!(
                "record is keyed ({}, {})",
                self.task_id, self.stage
            )));
        }

        if state_checksum(&self.state)? != self.checksum {
            return Err(corrupt("checksum mismatch".to_string()));
        }

        Ok(())
    }
}

fn state_checksum(state: &Fields) -> Result<String, CheckpointError> {
    let bytes = serde_json::to_vec(state)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Persistence of checkpoint records.
///
/// Implementations must be safe under concurrent writers to distinct keys.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Durably persists a snapshot and returns the stored snapshot.
    ///
    /// When the key already exists the existing snapshot is returned and
    /// nothing is written.
    async fn put(
        &self,
        scope: &RunScope,
        task_id: &str,
        stage: StageKind,
        state: &Fields,
    ) -> Result<Fields, CheckpointError>;

    /// Returns the snapshot, or `None` when no record exists.
    async fn get(
        &self,
        scope: &RunScope,
        task_id: &str,
        stage: StageKind,
    ) -> Result<Option<Fields>, CheckpointError>;

    /// Existence check for a record; resume consults it before reading.
    async fn has_stage(
        &self,
        scope: &RunScope,
        task_id: &str,
        stage: StageKind,
    ) -> Result<bool, CheckpointError>;
}

type MemoryKey = (RunScope, String, StageKind);

/// In-memory store, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    records: RwLock<HashMap<MemoryKey, Fields>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records across all scopes.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn put(
        &self,
        scope: &RunScope,
        task_id: &str,
        stage: StageKind,
        state: &Fields,
    ) -> Result<Fields, CheckpointError> {
        let mut records = self.records.write().await;
        let stored = records
            .entry((scope.clone(), task_id.to_string(), stage))
            .or_insert_with(|| state.clone());
        Ok(stored.clone())
    }

    async fn get(
        &self,
        scope: &RunScope,
        task_id: &str,
        stage: StageKind,
    ) -> Result<Option<Fields>, CheckpointError> {
        let records = self.records.read().await;
        Ok(records
            .get(&(scope.clone(), task_id.to_string(), stage))
            .cloned())
    }

    async fn has_stage(
        &self,
        scope: &RunScope,
        task_id: &str,
        stage: StageKind,
    ) -> Result<bool, CheckpointError> {
        let records = self.records.read().await;
        Ok(records.contains_key(&(scope.clone(), task_id.to_string(), stage)))
    }
}
