//! Checkpoint persistence for pipeline stages.
//!
//! - One file per stage at `<dir>/<stage>.json`
//! - Files are written whole to a temp file, then renamed over the target,
//!   so readers never observe a partial payload
//! - A file that does not parse or does not match the stage's schema
//!   version is reported as invalid, never partially used

use crate::models::{Result, StagerunError};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

const TEMP_SUFFIX: &str = "tmp";

/// Envelope written around every stage value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRecord<T> {
    /// Stage that produced the value
    pub stage: String,
    /// Payload schema version declared by the stage
    pub schema_version: u32,
    /// When the checkpoint was written
    pub saved_at: DateTime<Utc>,
    /// Stage value
    pub value: T,
}

/// Outcome of reading one checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointRead<T> {
    /// No checkpoint file
    Missing,
    /// A file exists but cannot be trusted
    Invalid(String),
    /// Parsed and matched the expected stage and version
    Valid(T),
}

impl<T> CheckpointRead<T> {
    pub fn valid(self) -> Option<T> {
        match self {
            Self::Valid(value) => Some(value),
            Self::Missing | Self::Invalid(_) => None,
        }
    }
}

/// Write `contents` to `path` without ever exposing a partial file.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StagerunError::io(format!("creating {}", parent.display()), e))?;
    }

    let file_name = path
        .file_name()
        .ok_or_else(|| StagerunError::Internal(format!("No file name in {}", path.display())))?
        .to_string_lossy();
    let temp_path = path.with_file_name(format!(
        ".{file_name}.{}.{TEMP_SUFFIX}",
        Uuid::new_v4().simple()
    ));

    tokio::fs::write(&temp_path, contents)
        .await
        .map_err(|e| StagerunError::io(format!("writing {}", temp_path.display()), e))?;

    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(StagerunError::io(format!("renaming onto {}", path.display()), e));
    }
    Ok(())
}

/// Stage checkpoints under one pipeline-scoped directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Store rooted at `dir`. Nothing is touched on disk.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Create the directory and clear temp files left by an interrupted write.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(dir);
        tokio::fs::create_dir_all(&store.dir)
            .await
            .map_err(|e| StagerunError::io("creating checkpoint dir", e))?;

        let swept = store.sweep_temp_files().await?;
        if swept > 0 {
            debug!(dir = %store.dir.display(), swept, "Removed interrupted checkpoint writes");
        }
        Ok(store)
    }

    /// Checkpoint directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a stage's checkpoint file.
    pub fn path_for(&self, stage: &str) -> PathBuf {
        self.dir.join(format!("{stage}.json"))
    }

    /// Read a stage's checkpoint without decoding its value.
    pub async fn read_raw(
        &self,
        stage: &str,
        schema_version: u32,
    ) -> CheckpointRead<serde_json::Value> {
        let path = self.path_for(stage);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return CheckpointRead::Missing,
            Err(e) => return CheckpointRead::Invalid(format!("unreadable: {e}")),
        };

        let record: CheckpointRecord<serde_json::Value> = match serde_json::from_str(&content) {
            Ok(record) => record,
            Err(e) => return CheckpointRead::Invalid(format!("not a checkpoint: {e}")),
        };

        if record.stage != stage {
            return CheckpointRead::Invalid(format!(
                "written for stage '{}', expected '{stage}'",
                record.stage
            ));
        }
        if record.schema_version != schema_version {
            return CheckpointRead::Invalid(format!(
                "schema version {} does not match expected {schema_version}",
                record.schema_version
            ));
        }

        CheckpointRead::Valid(record.value)
    }

    /// Read and decode a stage's checkpoint.
    pub async fn read<T: DeserializeOwned>(
        &self,
        stage: &str,
        schema_version: u32,
    ) -> CheckpointRead<T> {
        match self.read_raw(stage, schema_version).await {
            CheckpointRead::Valid(value) => match serde_json::from_value(value) {
                Ok(decoded) => CheckpointRead::Valid(decoded),
                Err(e) => CheckpointRead::Invalid(format!("value does not match schema: {e}")),
            },
            CheckpointRead::Missing => CheckpointRead::Missing,
            CheckpointRead::Invalid(reason) => CheckpointRead::Invalid(reason),
        }
    }

    /// Persist a stage value. Returns the checkpoint path.
    pub async fn write<T: Serialize>(
        &self,
        stage: &str,
        schema_version: u32,
        value: &T,
    ) -> Result<PathBuf> {
        let record = CheckpointRecord {
            stage: stage.to_string(),
            schema_version,
            saved_at: Utc::now(),
            value,
        };
        let content = serde_json::to_string_pretty(&record)
            .map_err(|e| StagerunError::Internal(format!("Serializing checkpoint {stage}: {e}")))?;

        let path = self.path_for(stage);
        write_atomic(&path, content.as_bytes()).await?;
        debug!(stage, path = %path.display(), "Checkpoint saved");
        Ok(path)
    }

    /// Delete a stage's checkpoint so the next run regenerates it.
    ///
    /// Returns whether a file was removed.
    pub async fn remove(&self, stage: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.path_for(stage)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StagerunError::io(format!("removing checkpoint {stage}"), e)),
        }
    }

    /// Names of files in the checkpoint directory matching `pattern`.
    ///
    /// A directory that does not exist yet has no entries.
    async fn files_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let pattern = glob::Pattern::new(pattern)
            .map_err(|e| StagerunError::Internal(format!("Invalid glob pattern: {e}")))?;
        let context = || format!("listing {}", self.dir.display());

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StagerunError::io(context(), e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StagerunError::io(context(), e))?
        {
            let is_file = entry
                .file_type()
                .await
                .map_err(|e| StagerunError::io(context(), e))?
                .is_file();
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_file && pattern.matches(&name) {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Names of stages that have a checkpoint file, sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut stages: Vec<String> = self
            .files_matching("*.json")
            .await?
            .into_iter()
            .filter(|name| !name.starts_with('.'))
            .filter_map(|name| name.strip_suffix(".json").map(str::to_string))
            .collect();
        stages.sort();
        Ok(stages)
    }

    /// Remove temp files orphaned by a crash mid-write.
    pub async fn sweep_temp_files(&self) -> Result<usize> {
        let mut removed = 0;
        for name in self.files_matching(&format!(".*.{TEMP_SUFFIX}")).await? {
            let path = self.dir.join(&name);
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| StagerunError::io(format!("removing {}", path.display()), e))?;
            removed += 1;
        }
        Ok(removed)
    }
}
