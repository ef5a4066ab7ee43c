//! Run-scoped shared context.
//!
//! An [`ExportContext`] bundles the remote client, everything already fetched
//! for a source file during this run (component listings, version metadata,
//! variable collections, node trees) and the active change cache. It is an
//! explicit value handed down the call chain; cloning it is cheap and every
//! clone sees the same data.
//!
//! Enrichment is additive and per field: fetching the components of a file
//! adds one entry to the component map and touches nothing else. Each missing
//! key is fetched at most once even when many units ask for it at the same
//! time.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::cache::CacheHandle;
use crate::contract::{
    decode, ComponentListing, Endpoint, Fetcher, FileVersion, NodeTree, VariableCollection,
    VariableSets,
};
use crate::error::{ExportError, RemoteError, ValidationError};
use crate::processor::process_entries;

/// Per-key fetch-once storage.
struct Keyed<T> {
    cells: Mutex<HashMap<String, Arc<OnceCell<Arc<T>>>>>,
}

impl<T> Keyed<T> {
    fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }

    fn cell(&self, key: &str) -> Arc<OnceCell<Arc<T>>> {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(cells.entry(key.to_string()).or_default())
    }

    fn get(&self, key: &str) -> Option<Arc<T>> {
        let cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        cells.get(key).and_then(|cell| cell.get().cloned())
    }

    /// Stores `value` unless the key is already populated.
    fn insert_if_absent(&self, key: &str, value: T) -> bool {
        self.cell(key).set(Arc::new(value)).is_ok()
    }

    async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<Arc<T>, RemoteError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let cell = self.cell(key);
        let value = cell
            .get_or_try_init(|| async { fetch().await.map(Arc::new) })
            .await?;
        Ok(Arc::clone(value))
    }

    fn len(&self) -> usize {
        let cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        cells.values().filter(|cell| cell.initialized()).count()
    }
}

/// Data known before a context is created, or added to it later.
#[derive(Debug, Clone, Default)]
pub struct ContextSeed {
    pub components: Vec<ComponentListing>,
    pub versions: Vec<FileVersion>,
    pub node_trees: Vec<NodeTree>,
    pub cache: Option<CacheHandle>,
}

/// How many entries of each kind a context currently holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    pub components: usize,
    pub versions: usize,
    pub variables: usize,
    pub node_trees: usize,
    pub has_cache: bool,
}

struct ContextInner {
    client: Arc<dyn Fetcher>,
    components: Keyed<ComponentListing>,
    versions: Keyed<FileVersion>,
    variables: Keyed<VariableSets>,
    node_trees: Keyed<NodeTree>,
    cache: OnceLock<CacheHandle>,
}

/// Shared, run-scoped context. See the module docs.
#[derive(Clone)]
pub struct ExportContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for ExportContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportContext")
            .field("stats", &self.stats())
            .finish()
    }
}

impl ExportContext {
    pub fn new(client: Arc<dyn Fetcher>, seed: ContextSeed) -> Self {
        let ctx = Self {
            inner: Arc::new(ContextInner {
                client,
                components: Keyed::new(),
                versions: Keyed::new(),
                variables: Keyed::new(),
                node_trees: Keyed::new(),
                cache: OnceLock::new(),
            }),
        };
        ctx.enrich(seed);
        ctx
    }

    pub fn client(&self) -> &Arc<dyn Fetcher> {
        &self.inner.client
    }

    /// Adds everything in `seed` that the context does not hold yet.
    ///
    /// Existing entries, including the cache handle, are never replaced.
    pub fn enrich(&self, seed: ContextSeed) {
        let inner = &self.inner;
        for listing in seed.components {
            let key = listing.file_id.clone();
            inner.components.insert_if_absent(&key, listing);
        }
        for version in seed.versions {
            let key = version.file_id.clone();
            inner.versions.insert_if_absent(&key, version);
        }
        for tree in seed.node_trees {
            let key = tree.file_id.clone();
            inner.node_trees.insert_if_absent(&key, tree);
        }
        if let Some(cache) = seed.cache {
            self.attach_cache(cache);
        }
    }

    /// Component listing of `file_id`, fetched on first use.
    pub async fn components(&self, file_id: &str) -> Result<Arc<ComponentListing>, RemoteError> {
        self.inner
            .components
            .get_or_fetch(file_id, || async {
                info!(file_id, "[CONTEXT] Fetching component listing");
                let endpoint = Endpoint::Components {
                    file_id: file_id.to_string(),
                };
                let content = self.inner.client.fetch(&endpoint).await?;
                decode::<ComponentListing>(&endpoint, content)
            })
            .await
    }

    /// Version metadata of `file_id`, fetched on first use.
    pub async fn file_version(&self, file_id: &str) -> Result<Arc<FileVersion>, RemoteError> {
        self.inner
            .versions
            .get_or_fetch(file_id, || async {
                debug!(file_id, "[CONTEXT] Fetching file version");
                let endpoint = Endpoint::FileVersion {
                    file_id: file_id.to_string(),
                };
                let content = self.inner.client.fetch(&endpoint).await?;
                decode::<FileVersion>(&endpoint, content)
            })
            .await
    }

    /// Variable collections of `file_id`, fetched on first use.
    pub async fn variables(&self, file_id: &str) -> Result<Arc<VariableSets>, RemoteError> {
        self.inner
            .variables
            .get_or_fetch(file_id, || async {
                info!(file_id, "[CONTEXT] Fetching variable collections");
                let endpoint = Endpoint::Variables {
                    file_id: file_id.to_string(),
                };
                let content = self.inner.client.fetch(&endpoint).await?;
                decode::<VariableSets>(&endpoint, content)
            })
            .await
    }

    /// The named variable collection of `file_id`.
    ///
    /// Fails with [`ValidationError::MissingCollection`] when the file has no
    /// collection of that name.
    pub async fn variable_collection(
        &self,
        file_id: &str,
        name: &str,
    ) -> Result<VariableCollection, ExportError> {
        let sets = self.variables(file_id).await?;
        match sets.collection(name) {
            Some(collection) => Ok(collection.clone()),
            None => Err(ValidationError::MissingCollection {
                file_id: file_id.to_string(),
                name: name.to_string(),
                available: sets.collection_names(),
            }
            .into()),
        }
    }

    /// Components already fetched for `file_id`, without fetching.
    pub fn cached_components(&self, file_id: &str) -> Option<Arc<ComponentListing>> {
        self.inner.components.get(file_id)
    }

    pub fn cached_version(&self, file_id: &str) -> Option<Arc<FileVersion>> {
        self.inner.versions.get(file_id)
    }

    pub fn node_tree(&self, file_id: &str) -> Option<Arc<NodeTree>> {
        self.inner.node_trees.get(file_id)
    }

    /// Adds a node tree unless one is already known for its file.
    pub fn add_node_tree(&self, tree: NodeTree) -> bool {
        let key = tree.file_id.clone();
        self.inner.node_trees.insert_if_absent(&key, tree)
    }

    pub fn cache(&self) -> Option<&CacheHandle> {
        self.inner.cache.get()
    }

    /// Attaches `cache` unless a cache is already attached.
    pub fn attach_cache(&self, cache: CacheHandle) -> bool {
        self.inner.cache.set(cache).is_ok()
    }

    /// Fetches version metadata for all `file_ids` up front.
    ///
    /// Failures are logged and left for the config that needs the file to
    /// report. Returns how many files now have version metadata.
    pub async fn prefetch_versions(&self, file_ids: Vec<String>, concurrency: usize) -> usize {
        let fetched = process_entries(file_ids, concurrency, |file_id| async move {
            match self.file_version(&file_id).await {
                Ok(_) => Ok::<bool, Infallible>(true),
                Err(e) => {
                    warn!(file_id = %file_id, error = %e, "[CONTEXT] Version prefetch failed");
                    Ok(false)
                }
            }
        })
        .await;
        match fetched {
            Ok(flags) => flags.into_iter().filter(|ok| *ok).count(),
            Err(failure) => match failure.into_source() {},
        }
    }

    pub fn stats(&self) -> ContextStats {
        ContextStats {
            components: self.inner.components.len(),
            versions: self.inner.versions.len(),
            variables: self.inner.variables.len(),
            node_trees: self.inner.node_trees.len(),
            has_cache: self.inner.cache.get().is_some(),
        }
    }
}

/// Runs `body` with the ambient context, or with a transient one.
///
/// With `ambient` set, `body` sees that context and whatever it adds stays
/// visible to the rest of the run. Without it, a fresh context around
/// `client` is created for this one call and dropped afterwards.
pub async fn with_context<F, Fut, T>(
    ambient: Option<&ExportContext>,
    client: Arc<dyn Fetcher>,
    body: F,
) -> T
where
    F: FnOnce(ExportContext) -> Fut,
    Fut: Future<Output = T>,
{
    match ambient {
        Some(ctx) => body(ctx.clone()).await,
        None => {
            debug!("[CONTEXT] No ambient context, using a transient one");
            body(ExportContext::new(client, ContextSeed::default())).await
        }
    }
}
