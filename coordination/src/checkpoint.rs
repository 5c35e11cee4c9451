//! Checkpoint persistence for resumable build sessions
//!
//! A checkpoint is the complete control-loop state: session, escalation
//! ladder, both logs and the current baseline artifact. Loading one restores
//! iteration numbering, cost and tier exactly.

use crate::build_session::{ArtifactRef, BuildSession};
use crate::classifier::ErrorLog;
use crate::error::{CoordinationError, CoordinationResult};
use crate::escalation::EscalationState;
use crate::fitness::FitnessTracker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// Current on-disk schema
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Full control-loop snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: u32,
    pub session: BuildSession,
    pub escalation: EscalationState,
    pub fitness: FitnessTracker,
    pub errors: ErrorLog,
    /// Artifact the next generation starts from
    pub working_artifact: Option<ArtifactRef>,
    /// Regression directive still owed to the next generation request
    pub pending_directive: Option<String>,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        session: BuildSession,
        escalation: EscalationState,
        fitness: FitnessTracker,
        errors: ErrorLog,
        working_artifact: Option<ArtifactRef>,
        pending_directive: Option<String>,
    ) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            session,
            escalation,
            fitness,
            errors,
            working_artifact,
            pending_directive,
            saved_at: Utc::now(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session.id
    }
}

/// Keyed checkpoint persistence
pub trait CheckpointStore: Send + Sync {
    /// Persist `checkpoint`, replacing any earlier one for the same session
    fn save(&self, checkpoint: &Checkpoint) -> CoordinationResult<()>;

    /// Latest checkpoint for `session_id`, if any
    fn load(&self, session_id: Uuid) -> CoordinationResult<Option<Checkpoint>>;

    /// Sessions with a stored checkpoint
    fn list(&self) -> CoordinationResult<Vec<Uuid>>;
}

/// One JSON file per session, written atomically (temp file + rename)
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Store rooted at `dir`; the directory is created on first save
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, session_id: Uuid) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> CoordinationResult<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(checkpoint.session_id());
        let tmp_path = path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(checkpoint)?;
        fs::write(&tmp_path, contents)?;
        fs::rename(&tmp_path, &path)?;
        tracing::debug!(
            session_id = %checkpoint.session_id(),
            iteration = checkpoint.session.iteration,
            path = %path.display(),
            "Checkpoint saved"
        );
        Ok(())
    }

    fn load(&self, session_id: Uuid) -> CoordinationResult<Option<Checkpoint>> {
        let path = self.path_for(session_id);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checkpoint: Checkpoint = serde_json::from_str(&contents)
            .map_err(|e| CoordinationError::invalid_checkpoint(&path, e.to_string()))?;
        if checkpoint.schema_version != CHECKPOINT_SCHEMA_VERSION {
            return Err(CoordinationError::invalid_checkpoint(
                &path,
                format!(
                    "unsupported schema version {} (expected {})",
                    checkpoint.schema_version, CHECKPOINT_SCHEMA_VERSION
                ),
            ));
        }
        if checkpoint.session.id != session_id {
            return Err(CoordinationError::invalid_checkpoint(
                &path,
                format!("file holds session {}", checkpoint.session.id),
            ));
        }
        Ok(Some(checkpoint))
    }

    fn list(&self) -> CoordinationResult<Vec<Uuid>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// In-process store, for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<Uuid, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of saves performed so far
    pub fn len(&self) -> usize {
        self.checkpoints.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> CoordinationResult<()> {
        self.checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(checkpoint.session_id(), checkpoint.clone());
        Ok(())
    }

    fn load(&self, session_id: Uuid) -> CoordinationResult<Option<Checkpoint>> {
        Ok(self
            .checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&session_id)
            .cloned())
    }

    fn list(&self) -> CoordinationResult<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self
            .checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ErrorKind, ErrorRecord};

    fn sample() -> Checkpoint {
        let mut session = BuildSession::new(None);
        session.begin_iteration().unwrap();
        session.begin_iteration().unwrap();
        session.set_cost(1.25);

        let mut escalation = EscalationState::new(3, 5.0);
        escalation.total_cost = 1.25;

        let mut errors = ErrorLog::new();
        errors
            .append(ErrorRecord::new("SyntaxError: invalid syntax", ErrorKind::Syntax, 1))
            .unwrap();

        let mut fitness = FitnessTracker::new();
        fitness
            .record(2, 1.4, ArtifactRef::new("abc123", "/tmp/a/abc123"))
            .unwrap();

        Checkpoint::new(
            session,
            escalation,
            fitness,
            errors,
            Some(ArtifactRef::new("abc123", "/tmp/a/abc123")),
            None,
        )
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoints"));
        let checkpoint = sample();

        store.save(&checkpoint).unwrap();
        let loaded = store.load(checkpoint.session_id()).unwrap().unwrap();
        assert_eq!(loaded, checkpoint);
        assert_eq!(store.list().unwrap(), vec![checkpoint.session_id()]);
        assert!(!store.path_for(checkpoint.session_id()).with_extension("json.tmp").exists());
    }

    #[test]
    fn test_missing_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        assert!(store.load(Uuid::new_v4()).unwrap().is_none());
        assert!(FileCheckpointStore::new(dir.path().join("absent"))
            .list()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_corrupt_checkpoint_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let id = Uuid::new_v4();
        fs::write(store.path_for(id), "{not json").unwrap();
        let err = store.load(id).unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidCheckpoint { .. }));
    }

    #[test]
    fn test_schema_version_checked() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let mut checkpoint = sample();
        checkpoint.schema_version = 99;
        store.save(&checkpoint).unwrap();
        assert!(store.load(checkpoint.session_id()).is_err());
    }

    #[test]
    fn test_save_overwrites() {
        let store = MemoryCheckpointStore::new();
        let mut checkpoint = sample();
        store.save(&checkpoint).unwrap();
        checkpoint.session.begin_iteration().unwrap();
        store.save(&checkpoint).unwrap();
        assert_eq!(store.len(), 1);
        let loaded = store.load(checkpoint.session_id()).unwrap().unwrap();
        assert_eq!(loaded.session.iteration, 3);
    }
}
