//! Per-task checkpointing: serialize loop state under a query-id-keyed
//! file and pick up where a run left off.
//!
//! A checkpoint captures the agent input - the task, the session
//! history, the current turn's attempts, and the iteration index. On
//! resume the history is rehydrated into the agent and the loop
//! continues from the saved iteration via [`crate::agent::CodeAgent::resume`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::history::ConversationHistory;
use crate::{Error, Result};

/// Serialized loop state for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Stable identifier the filename derives from.
    pub query_id: String,
    /// The task text.
    pub task: String,
    /// Session history at checkpoint time.
    pub history: ConversationHistory,
    /// The current turn's attempt transcript.
    pub current_turn_attempts: Vec<String>,
    /// Iteration index to continue from.
    pub iteration: u32,
}

impl Checkpoint {
    pub fn new(query_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            task: task.into(),
            history: ConversationHistory::new(),
            current_turn_attempts: Vec::new(),
            iteration: 0,
        }
    }
}

/// Filesystem-backed checkpoint store.
pub struct CheckpointStore {
    directory: PathBuf,
}

impl CheckpointStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Path for a query id. Non-filename characters are flattened to
    /// underscores.
    pub fn path_for(&self, query_id: &str) -> PathBuf {
        let safe: String = query_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.directory.join(format!("checkpoint_{safe}.json"))
    }

    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| Error::other(format!("cannot create checkpoint dir: {e}")))?;
        let path = self.path_for(&checkpoint.query_id);
        let json = serde_json::to_string_pretty(checkpoint)?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| Error::other(format!("cannot write checkpoint: {e}")))?;
        debug!(path = %path.display(), iteration = checkpoint.iteration, "checkpoint saved");
        Ok(())
    }

    /// Load a checkpoint; `Ok(None)` when none exists for the id.
    pub async fn load(&self, query_id: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(query_id);
        if !Path::new(&path).exists() {
            return Ok(None);
        }
        let json = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::other(format!("cannot read checkpoint: {e}")))?;
        let checkpoint = serde_json::from_str(&json)?;
        Ok(Some(checkpoint))
    }

    /// Remove a completed task's checkpoint. Missing files are fine.
    pub async fn delete(&self, query_id: &str) -> Result<()> {
        let path = self.path_for(query_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::other(format!("cannot delete checkpoint: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::Message;

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        let mut checkpoint = Checkpoint::new("task-001", "count the files");
        checkpoint.history.append(Message::user("count the files"));
        checkpoint
            .current_turn_attempts
            .push("**Assistant Response 1:** working".to_string());
        checkpoint.iteration = 2;

        store.save(&checkpoint).await.unwrap();
        let loaded = store.load("task-001").await.unwrap().unwrap();
        assert_eq!(loaded.task, "count the files");
        assert_eq!(loaded.iteration, 2);
        assert_eq!(loaded.history.len(), 1);
        assert_eq!(loaded.current_turn_attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.load("never-saved").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let checkpoint = Checkpoint::new("t", "task");
        store.save(&checkpoint).await.unwrap();
        store.delete("t").await.unwrap();
        store.delete("t").await.unwrap();
        assert!(store.load("t").await.unwrap().is_none());
    }

    #[test]
    fn test_path_sanitization() {
        let store = CheckpointStore::new("/tmp/checkpoints");
        let path = store.path_for("query/with spaces:and#stuff");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, "checkpoint_query_with_spaces_and_stuff.json");
    }
}
