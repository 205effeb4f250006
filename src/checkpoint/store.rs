//! File-backed checkpoint store.
//!
//! Layout: `{scope}/{task_id}/{stage}.json`. A record is written to a
//! temporary file, synced, then hard-linked into place, so a reader either
//! sees a complete record or none at all and an existing record is never
//! replaced.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::error::CheckpointError;
use crate::pipeline::{Fields, StageKind};

use super::{CheckpointRecord, CheckpointStore, RunScope};

/// Checkpoint store writing one JSON file per (task, stage).
#[derive(Debug, Clone, Default)]
pub struct FileCheckpointStore;

impl FileCheckpointStore {
    pub fn new() -> Self {
        Self
    }

    /// Path of the record for a key.
    pub fn record_path(scope: &RunScope, task_id: &str, stage: StageKind) -> PathBuf {
        scope
            .root()
            .join(task_id)
            .join(format!("{}.json", stage.as_str()))
    }

    async fn read_record(
        &self,
        scope: &RunScope,
        task_id: &str,
        stage: StageKind,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let path = Self::record_path(scope, task_id, stage);
        let contents = match fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record: CheckpointRecord =
            serde_json::from_slice(&contents).map_err(|e| CheckpointError::Corrupt {
                task_id: task_id.to_string(),
                stage: stage.to_string(),
                reason: e.to_string(),
            })?;
        record.verify(task_id, stage)?;

        Ok(Some(record))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn put(
        &self,
        scope: &RunScope,
        task_id: &str,
        stage: StageKind,
        state: &Fields,
    ) -> Result<Fields, CheckpointError> {
        if let Some(existing) = self.read_record(scope, task_id, stage).await? {
            return Ok(existing.state);
        }

        let path = Self::record_path(scope, task_id, stage);
        let dir = scope.root().join(task_id);
        fs::create_dir_all(&dir).await?;

        let record = CheckpointRecord::new(task_id, stage, state.clone())?;
        let json = serde_json::to_vec_pretty(&record)?;

        let tmp_path = dir.join(format!(".{}.{}.tmp", stage.as_str(), Uuid::new_v4()));
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        let linked = fs::hard_link(&tmp_path, &path).await;
        let _ = fs::remove_file(&tmp_path).await;

        match linked {
            Ok(()) => {
                debug!(task_id = %task_id, stage = %stage, path = ?path, "Checkpoint written");
                Ok(record.state)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => self
                .read_record(scope, task_id, stage)
                .await?
                .map(|existing| existing.state)
                .ok_or_else(|| CheckpointError::Corrupt {
                    task_id: task_id.to_string(),
                    stage: stage.to_string(),
                    reason: "record vanished after concurrent write".to_string(),
                }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(
        &self,
        scope: &RunScope,
        task_id: &str,
        stage: StageKind,
    ) -> Result<Option<Fields>, CheckpointError> {
        Ok(self
            .read_record(scope, task_id, stage)
            .await?
            .map(|record| record.state))
    }

    async fn has_stage(
        &self,
        scope: &RunScope,
        task_id: &str,
        stage: StageKind,
    ) -> Result<bool, CheckpointError> {
        Ok(fs::try_exists(Self::record_path(scope, task_id, stage)).await?)
    }
}
