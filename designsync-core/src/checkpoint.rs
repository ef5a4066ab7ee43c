//! Resumable record of a multi-config run.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::StateError;
use crate::persist;

/// Checkpoint file name inside the state directory.
pub const CHECKPOINT_FILE: &str = ".designsync-batch.json";

/// Age after which a checkpoint is no longer resumed.
pub fn default_ttl() -> Duration {
    Duration::hours(24)
}

/// Which configs of a batch have completed or failed.
///
/// A path is never both completed and failed. Completion is sticky: marking
/// a completed path as failed has no effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCheckpoint {
    pub batch_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Config paths requested by the run, in the order given.
    pub requested: Vec<PathBuf>,
    #[serde(default)]
    completed: BTreeSet<PathBuf>,
    #[serde(default)]
    failed: BTreeSet<PathBuf>,
}

impl BatchCheckpoint {
    pub fn new(requested: Vec<PathBuf>) -> Self {
        Self::create(requested, Utc::now())
    }

    pub fn create(requested: Vec<PathBuf>, now: DateTime<Utc>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            started_at: now,
            requested,
            completed: BTreeSet::new(),
            failed: BTreeSet::new(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.started_at > ttl
    }

    /// Whether `paths` is the same set of paths this batch was created for.
    pub fn matches_paths(&self, paths: &[PathBuf]) -> bool {
        let ours: BTreeSet<&PathBuf> = self.requested.iter().collect();
        let theirs: BTreeSet<&PathBuf> = paths.iter().collect();
        ours == theirs
    }

    pub fn mark_completed(&mut self, path: &Path) {
        self.failed.remove(path);
        self.completed.insert(path.to_path_buf());
    }

    pub fn mark_failed(&mut self, path: &Path) {
        if !self.completed.contains(path) {
            self.failed.insert(path.to_path_buf());
        }
    }

    pub fn is_completed(&self, path: &Path) -> bool {
        self.completed.contains(path)
    }

    pub fn is_failed(&self, path: &Path) -> bool {
        self.failed.contains(path)
    }

    /// Every path of `all` that has not completed yet, in the order of `all`.
    pub fn pending_paths(&self, all: &[PathBuf]) -> Vec<PathBuf> {
        all.iter()
            .filter(|p| !self.completed.contains(*p))
            .cloned()
            .collect()
    }

    /// Requested paths that have not completed yet.
    pub fn remaining_count(&self) -> usize {
        self.requested
            .iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|p| !self.completed.contains(*p))
            .count()
    }

    pub fn completed(&self) -> impl Iterator<Item = &PathBuf> {
        self.completed.iter()
    }

    pub fn failed(&self) -> impl Iterator<Item = &PathBuf> {
        self.failed.iter()
    }
}

/// Where a batch checkpoint lives on disk.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// Store for the checkpoint file inside `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(CHECKPOINT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored checkpoint, or `None` if missing or unreadable.
    pub fn load(&self) -> Option<BatchCheckpoint> {
        persist::read_json(&self.path)
    }

    pub fn save(&self, checkpoint: &BatchCheckpoint) -> Result<(), StateError> {
        persist::write_json_atomic(&self.path, checkpoint)
    }

    pub fn remove(&self) -> Result<(), StateError> {
        persist::remove_file(&self.path)
    }

    /// Resumes the stored checkpoint if it is fresh and was created for the
    /// same paths, otherwise starts (and saves) a new one.
    ///
    /// Returns the checkpoint and whether it was resumed.
    pub fn resume_or_create(
        &self,
        requested: &[PathBuf],
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(BatchCheckpoint, bool), StateError> {
        if let Some(previous) = self.load() {
            if previous.is_expired(now, ttl) {
                warn!(batch_id = %previous.batch_id, started_at = %previous.started_at, "[CHECKPOINT] Discarding expired checkpoint");
            } else if !previous.matches_paths(requested) {
                warn!(batch_id = %previous.batch_id, "[CHECKPOINT] Discarding checkpoint for a different set of configs");
            } else {
                info!(
                    batch_id = %previous.batch_id,
                    remaining = previous.remaining_count(),
                    "[CHECKPOINT] Resuming batch"
                );
                return Ok((previous, true));
            }
        }

        let fresh = BatchCheckpoint::create(requested.to_vec(), now);
        self.save(&fresh)?;
        info!(batch_id = %fresh.batch_id, configs = requested.len(), "[CHECKPOINT] Started new batch");
        Ok((fresh, false))
    }
}
