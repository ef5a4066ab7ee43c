//! Change-detection cache.
//!
//! Maps (source file, unit of work) to the fingerprint the unit had when it
//! was last exported. A unit whose freshly computed fingerprint equals the
//! recorded one is skipped. Each file entry also remembers the upstream
//! version its fingerprints were computed against; observing a different
//! version drops the file's fingerprints, and merging entries from two
//! different versions keeps only the incoming one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StateError;
use crate::hasher::Fingerprint;
use crate::persist;

/// Version of the on-disk cache document.
pub const CACHE_FORMAT: u32 = 1;

/// Default cache file name, relative to the working directory.
pub const DEFAULT_CACHE_FILE: &str = ".designsync-cache.json";

fn current_format() -> u32 {
    CACHE_FORMAT
}

/// Cached state of one source file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Upstream version the fingerprints were computed against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Unit id to fingerprint.
    #[serde(default)]
    pub nodes: BTreeMap<String, Fingerprint>,
}

impl FileEntry {
    fn conflicts_with(&self, other: &FileEntry) -> bool {
        matches!((&self.version, &other.version), (Some(a), Some(b)) if a != b)
    }
}

/// In-memory change-detection cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCache {
    #[serde(default = "current_format")]
    format: u32,
    #[serde(default)]
    files: BTreeMap<String, FileEntry>,
}

impl Default for ChangeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeCache {
    pub fn new() -> Self {
        Self {
            format: CACHE_FORMAT,
            files: BTreeMap::new(),
        }
    }

    /// Loads the cache from `path`.
    ///
    /// Missing, corrupt or incompatible files yield an empty cache.
    pub fn load(path: &Path) -> Self {
        match persist::read_json::<ChangeCache>(path) {
            Some(cache) if cache.format == CACHE_FORMAT => {
                info!(
                    path = %path.display(),
                    files = cache.files.len(),
                    "[CACHE] Loaded change cache"
                );
                cache
            }
            Some(cache) => {
                warn!(
                    path = %path.display(),
                    found = cache.format,
                    expected = CACHE_FORMAT,
                    "[CACHE] Incompatible cache format, starting fresh"
                );
                Self::new()
            }
            None => Self::new(),
        }
    }

    /// Atomically writes the cache to `path`.
    pub fn persist(&self, path: &Path) -> Result<(), StateError> {
        persist::write_json_atomic(path, self)?;
        info!(path = %path.display(), files = self.files.len(), "[CACHE] Persisted change cache");
        Ok(())
    }

    pub fn lookup(&self, file_id: &str, unit_id: &str) -> Option<Fingerprint> {
        self.files.get(file_id)?.nodes.get(unit_id).copied()
    }

    pub fn record(&mut self, file_id: &str, unit_id: &str, fingerprint: Fingerprint) {
        self.files
            .entry(file_id.to_string())
            .or_default()
            .nodes
            .insert(unit_id.to_string(), fingerprint);
    }

    /// Whether `fingerprint` is exactly what was recorded for this unit.
    pub fn is_unchanged(&self, file_id: &str, unit_id: &str, fingerprint: Fingerprint) -> bool {
        self.lookup(file_id, unit_id) == Some(fingerprint)
    }

    pub fn version(&self, file_id: &str) -> Option<&str> {
        self.files.get(file_id)?.version.as_deref()
    }

    /// Records the upstream version of `file_id`.
    ///
    /// Returns `true` when a different version was recorded before, in which
    /// case the file's fingerprints are dropped.
    pub fn observe_version(&mut self, file_id: &str, version: &str) -> bool {
        let entry = self.files.entry(file_id.to_string()).or_default();
        match entry.version.as_deref() {
            Some(known) if known == version => false,
            Some(known) => {
                debug!(
                    file_id,
                    old = known,
                    new = version,
                    dropped = entry.nodes.len(),
                    "[CACHE] Upstream version changed, invalidating file entry"
                );
                entry.nodes.clear();
                entry.version = Some(version.to_string());
                true
            }
            None => {
                entry.version = Some(version.to_string());
                false
            }
        }
    }

    /// Returns a new cache with `incoming` layered over `self`.
    ///
    /// Keys present on one side only are kept; keys present on both sides
    /// take the incoming value. A file whose versions disagree takes the
    /// incoming entry as a whole.
    pub fn merge(&self, incoming: &ChangeCache) -> ChangeCache {
        let mut merged = self.clone();
        merged.merge_from(incoming.clone());
        merged
    }

    /// In-place form of [`ChangeCache::merge`].
    pub fn merge_from(&mut self, incoming: ChangeCache) {
        for (file_id, theirs) in incoming.files {
            match self.files.get_mut(&file_id) {
                None => {
                    self.files.insert(file_id, theirs);
                }
                Some(ours) if ours.conflicts_with(&theirs) => {
                    *ours = theirs;
                }
                Some(ours) => {
                    ours.nodes.extend(theirs.nodes);
                    if theirs.version.is_some() {
                        ours.version = theirs.version;
                    }
                }
            }
        }
    }

    pub fn file(&self, file_id: &str) -> Option<&FileEntry> {
        self.files.get(file_id)
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &FileEntry)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of recorded fingerprints across all files.
    pub fn len(&self) -> usize {
        self.files.values().map(|f| f.nodes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run-scoped handle to the active cache and where it is persisted.
///
/// Cloning shares the same cache. Units read it concurrently; the single
/// writer (the export of one config) merges its results in one step.
#[derive(Debug, Clone)]
pub struct CacheHandle {
    cache: Arc<RwLock<ChangeCache>>,
    path: Option<Arc<PathBuf>>,
}

impl CacheHandle {
    /// Loads the cache persisted at `path` (fail-safe).
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cache = ChangeCache::load(&path);
        Self {
            cache: Arc::new(RwLock::new(cache)),
            path: Some(Arc::new(path)),
        }
    }

    /// A handle that is never persisted.
    pub fn in_memory(cache: ChangeCache) -> Self {
        Self {
            cache: Arc::new(RwLock::new(cache)),
            path: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref().map(PathBuf::as_path)
    }

    pub fn snapshot(&self) -> ChangeCache {
        self.read(|c| c.clone())
    }

    pub fn lookup(&self, file_id: &str, unit_id: &str) -> Option<Fingerprint> {
        self.read(|c| c.lookup(file_id, unit_id))
    }

    pub fn is_unchanged(&self, file_id: &str, unit_id: &str, fingerprint: Fingerprint) -> bool {
        self.read(|c| c.is_unchanged(file_id, unit_id, fingerprint))
    }

    pub fn observe_version(&self, file_id: &str, version: &str) -> bool {
        self.write(|c| c.observe_version(file_id, version))
    }

    /// Merges a partial cache produced by one config into the shared cache.
    pub fn merge(&self, partial: ChangeCache) {
        self.write(|c| c.merge_from(partial));
    }

    /// Persists to the handle's path; in-memory handles are a no-op.
    pub fn persist(&self) -> Result<(), StateError> {
        match &self.path {
            Some(path) => self.snapshot().persist(path),
            None => Ok(()),
        }
    }

    fn read<R>(&self, f: impl FnOnce(&ChangeCache) -> R) -> R {
        let guard = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write<R>(&self, f: impl FnOnce(&mut ChangeCache) -> R) -> R {
        let mut guard = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}
