//! Durable checkpoints for resumable runs.
//!
//! A checkpoint is a write-once snapshot of the top-level step results of
//! one run. The file store lays them out as
//! `<root>/<workflow_id>/<checkpoint_id>.json` and writes each one to a
//! temporary file in the same directory before renaming it into place, so a
//! reader never observes a partial checkpoint.

use crate::result::StepResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Errors that can occur during checkpoint operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("no checkpoint found for run '{workflow_id}'{}", describe_id(.checkpoint_id))]
    NotFound {
        workflow_id: String,
        checkpoint_id: Option<String>,
    },

    #[error(
        "inputs for run '{workflow_id}' differ from the checkpointed inputs \
         (expected hash {expected}, got {actual})"
    )]
    InputMismatch {
        workflow_id: String,
        expected: String,
        actual: String,
    },

    #[error("invalid checkpoint identifier '{0}'")]
    InvalidId(String),

    #[error("checkpoint I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

fn describe_id(checkpoint_id: &Option<String>) -> String {
    checkpoint_id
        .as_ref()
        .map(|id| format!(" with id '{id}'"))
        .unwrap_or_default()
}

/// Snapshot of a run's completed steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointData {
    pub checkpoint_id: String,
    pub workflow_name: String,
    /// Fingerprint of the inputs the run was started with
    pub inputs_hash: String,
    /// Completed top-level step results, in order
    pub step_results: Vec<StepResult>,
    pub saved_at: DateTime<Utc>,
}

impl CheckpointData {
    /// Snapshot `step_results` with a fresh time-ordered id.
    pub fn new(
        workflow_name: &str,
        inputs: &Map<String, Value>,
        step_results: Vec<StepResult>,
    ) -> Self {
        Self {
            checkpoint_id: Uuid::now_v7().to_string(),
            workflow_name: workflow_name.to_string(),
            inputs_hash: compute_inputs_hash(inputs),
            step_results,
            saved_at: Utc::now(),
        }
    }
}

/// SHA-256 of the canonical JSON encoding of `inputs`.
///
/// Object keys serialize in sorted order, so equal maps hash equally
/// regardless of insertion order.
pub fn compute_inputs_hash(inputs: &Map<String, Value>) -> String {
    let canonical = Value::Object(inputs.clone()).to_string();
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

/// Persistence for checkpoints, scoped per run id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, workflow_id: &str, data: &CheckpointData) -> Result<(), CheckpointError>;

    async fn load(
        &self,
        workflow_id: &str,
        checkpoint_id: &str,
    ) -> Result<CheckpointData, CheckpointError>;

    /// The checkpoint with the greatest `saved_at`, if any.
    async fn load_latest(
        &self,
        workflow_id: &str,
    ) -> Result<Option<CheckpointData>, CheckpointError>;

    /// Remove every checkpoint of a run.
    async fn clear(&self, workflow_id: &str) -> Result<(), CheckpointError>;

    /// Checkpoint ids of a run, oldest first.
    async fn list_checkpoints(&self, workflow_id: &str) -> Result<Vec<String>, CheckpointError>;
}

fn check_id(id: &str) -> Result<(), CheckpointError> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CheckpointError::InvalidId(id.to_string()))
    }
}

fn newest_first(a: &CheckpointData, b: &CheckpointData) -> std::cmp::Ordering {
    b.saved_at
        .cmp(&a.saved_at)
        .then_with(|| b.checkpoint_id.cmp(&a.checkpoint_id))
}

/// Checkpoints stored as JSON files under a root directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, workflow_id: &str) -> Result<PathBuf, CheckpointError> {
        check_id(workflow_id)?;
        Ok(self.root.join(workflow_id))
    }

    /// Every readable checkpoint of a run. Partial or foreign files are
    /// skipped with a warning.
    async fn read_all(&self, workflow_id: &str) -> Result<Vec<CheckpointData>, CheckpointError> {
        let dir = self.run_dir(workflow_id)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(CheckpointError::Io { path: dir, source }),
        };

        let mut checkpoints = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => return Err(CheckpointError::Io { path: dir, source }),
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_checkpoint(&path).await {
                Ok(data) => checkpoints.push(data),
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "skipping unreadable checkpoint"
                ),
            }
        }
        Ok(checkpoints)
    }
}

async fn read_checkpoint(path: &Path) -> Result<CheckpointData, CheckpointError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Write `bytes` and flush them to disk before the file is renamed into place.
async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, workflow_id: &str, data: &CheckpointData) -> Result<(), CheckpointError> {
        check_id(&data.checkpoint_id)?;
        let dir = self.run_dir(workflow_id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| CheckpointError::Io { path: dir.clone(), source })?;

        let target = dir.join(format!("{}.json", data.checkpoint_id));
        let temp = dir.join(format!(".{}.{}.tmp", data.checkpoint_id, Uuid::new_v4()));
        let bytes = serde_json::to_vec_pretty(data)?;

        if let Err(source) = write_synced(&temp, &bytes).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(CheckpointError::Io { path: temp, source });
        }
        if let Err(source) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(CheckpointError::Io { path: target, source });
        }

        tracing::debug!(
            workflow_id,
            checkpoint_id = %data.checkpoint_id,
            path = %target.display(),
            "checkpoint saved"
        );
        Ok(())
    }

    async fn load(
        &self,
        workflow_id: &str,
        checkpoint_id: &str,
    ) -> Result<CheckpointData, CheckpointError> {
        check_id(checkpoint_id)?;
        let path = self.run_dir(workflow_id)?.join(format!("{checkpoint_id}.json"));
        match read_checkpoint(&path).await {
            Err(CheckpointError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Err(CheckpointError::NotFound {
                    workflow_id: workflow_id.to_string(),
                    checkpoint_id: Some(checkpoint_id.to_string()),
                })
            }
            other => other,
        }
    }

    async fn load_latest(
        &self,
        workflow_id: &str,
    ) -> Result<Option<CheckpointData>, CheckpointError> {
        let mut all = self.read_all(workflow_id).await?;
        all.sort_by(newest_first);
        Ok(all.into_iter().next())
    }

    async fn clear(&self, workflow_id: &str) -> Result<(), CheckpointError> {
        let dir = self.run_dir(workflow_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::debug!(workflow_id, "checkpoints cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CheckpointError::Io { path: dir, source }),
        }
    }

    async fn list_checkpoints(&self, workflow_id: &str) -> Result<Vec<String>, CheckpointError> {
        let mut all = self.read_all(workflow_id).await?;
        all.sort_by(|a, b| newest_first(b, a));
        Ok(all.into_iter().map(|c| c.checkpoint_id).collect())
    }
}

/// In-process store, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    runs: Mutex<HashMap<String, Vec<CheckpointData>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_run<R>(&self, workflow_id: &str, f: impl FnOnce(&mut Vec<CheckpointData>) -> R) -> R {
        let mut runs = self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(runs.entry(workflow_id.to_string()).or_default())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, workflow_id: &str, data: &CheckpointData) -> Result<(), CheckpointError> {
        check_id(workflow_id)?;
        self.with_run(workflow_id, |run| run.push(data.clone()));
        Ok(())
    }

    async fn load(
        &self,
        workflow_id: &str,
        checkpoint_id: &str,
    ) -> Result<CheckpointData, CheckpointError> {
        self.with_run(workflow_id, |run| {
            run.iter().find(|c| c.checkpoint_id == checkpoint_id).cloned()
        })
        .ok_or_else(|| CheckpointError::NotFound {
            workflow_id: workflow_id.to_string(),
            checkpoint_id: Some(checkpoint_id.to_string()),
        })
    }

    async fn load_latest(
        &self,
        workflow_id: &str,
    ) -> Result<Option<CheckpointData>, CheckpointError> {
        Ok(self.with_run(workflow_id, |run| {
            let mut sorted = run.clone();
            sorted.sort_by(newest_first);
            sorted.into_iter().next()
        }))
    }

    async fn clear(&self, workflow_id: &str) -> Result<(), CheckpointError> {
        self.with_run(workflow_id, Vec::clear);
        Ok(())
    }

    async fn list_checkpoints(&self, workflow_id: &str) -> Result<Vec<String>, CheckpointError> {
        Ok(self.with_run(workflow_id, |run| {
            let mut sorted = run.clone();
            sorted.sort_by(|a, b| newest_first(b, a));
            sorted.into_iter().map(|c| c.checkpoint_id).collect()
        }))
    }
}
