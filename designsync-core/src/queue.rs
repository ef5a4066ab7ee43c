//! Shared download queue.
//!
//! Configs hand the files they need to the queue as [`DownloadJob`]s and get a
//! [`JobId`] back immediately; a single dispatcher task services jobs in
//! priority order (lower value first, FIFO among equal priorities) with a
//! bounded number of jobs in flight. Within a job, files are fetched through
//! [`process_entries`], so one failing file fails the job, and only that job.
//!
//! The queue outlives individual configs of a batch, which lets the downloads
//! of one config overlap with the work of another.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::contract::{FileDownloader, FileRef, LocalFile, RemoteFile};
use crate::error::DownloadError;
use crate::processor::process_entries;

/// Unique identifier of a download job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A group of remote files requested by one config.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub id: JobId,
    pub config_id: String,
    pub files: Vec<RemoteFile>,
    /// Lower values are serviced first.
    pub priority: i32,
}

impl DownloadJob {
    pub fn new(config_id: impl Into<String>, files: Vec<RemoteFile>, priority: i32) -> Self {
        Self {
            id: JobId::new(),
            config_id: config_id.into(),
            files,
            priority,
        }
    }
}

/// Outcome of a completed job.
#[derive(Debug, Clone)]
pub struct DownloadJobResult {
    pub job_id: JobId,
    pub config_id: String,
    /// Retrieved files, in the order of [`DownloadJob::files`].
    pub files: Vec<LocalFile>,
    pub elapsed: Duration,
}

/// Tuning of the queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueOptions {
    /// Jobs serviced at the same time.
    pub max_concurrent_jobs: usize,
    /// Files fetched at the same time within one job.
    pub files_per_job: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            files_per_job: 8,
        }
    }
}

type JobReply = Result<DownloadJobResult, DownloadError>;

struct Queued {
    priority: i32,
    seq: u64,
    job: DownloadJob,
    reply: oneshot::Sender<JobReply>,
}

// BinaryHeap is a max-heap; the "greatest" entry is the lowest (priority, seq).
impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Queued {}

#[derive(Default)]
struct QueueState {
    pending: BinaryHeap<Queued>,
    next_seq: u64,
    waiters: HashMap<JobId, oneshot::Receiver<JobReply>>,
    active: usize,
}

struct Shared {
    state: Mutex<QueueState>,
    wake: Notify,
    downloader: Arc<dyn FileDownloader>,
    options: QueueOptions,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A job slot held for as long as one job is being serviced. Releasing it
/// frees the permit and lowers the active count, also when the job panics.
struct ActiveSlot {
    shared: Arc<Shared>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.shared.lock().active -= 1;
    }
}

/// Priority-ordered download pipeline shared by all configs of a run.
///
/// Must be created inside a tokio runtime. Dropping the queue stops the
/// dispatcher; jobs already being serviced run to completion.
pub struct DownloadQueue {
    shared: Arc<Shared>,
    dispatcher: JoinHandle<()>,
}

impl DownloadQueue {
    pub fn new(downloader: Arc<dyn FileDownloader>, options: QueueOptions) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            downloader,
            options,
        });
        let dispatcher = tokio::spawn(dispatch(Arc::clone(&shared)));
        info!(
            max_concurrent_jobs = options.max_concurrent_jobs,
            files_per_job = options.files_per_job,
            "[QUEUE] Download queue started"
        );
        Self { shared, dispatcher }
    }

    /// Enqueues `job` and returns without waiting for it.
    pub fn submit_and_process(&self, job: DownloadJob) -> JobId {
        let (reply, waiter) = oneshot::channel();
        let id = job.id;
        let (priority, files, config_id) = (job.priority, job.files.len(), job.config_id.clone());
        {
            let mut state = self.shared.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiters.insert(id, waiter);
            state.pending.push(Queued {
                priority,
                seq,
                job,
                reply,
            });
        }
        self.shared.wake.notify_one();
        info!(job_id = %id, config = %config_id, priority, files, "[QUEUE] Job submitted");
        id
    }

    /// Waits until job `job_id` has completed and returns its result.
    ///
    /// A result can be collected once; afterwards the id is unknown.
    pub async fn wait_for_completion(&self, job_id: JobId) -> Result<DownloadJobResult, DownloadError> {
        let waiter = self
            .shared
            .lock()
            .waiters
            .remove(&job_id)
            .ok_or(DownloadError::UnknownJob(job_id))?;
        waiter
            .await
            .map_err(|_| DownloadError::QueueClosed(job_id))?
    }

    /// Gives up on the result of `job_id`. The job still runs, its result is
    /// dropped on completion. Returns `false` if the id is unknown or its
    /// result was already collected.
    pub fn discard(&self, job_id: JobId) -> bool {
        let discarded = self.shared.lock().waiters.remove(&job_id).is_some();
        if discarded {
            debug!(job_id = %job_id, "[QUEUE] Job result discarded");
        }
        discarded
    }

    /// Resolves a unit's mixed inputs to local paths, in input order.
    ///
    /// Local inputs are returned unchanged. When there is no remote input no
    /// job is submitted at all.
    pub async fn resolve(
        &self,
        config_id: &str,
        priority: i32,
        inputs: Vec<FileRef>,
    ) -> Result<Vec<PathBuf>, DownloadError> {
        let mut resolved: Vec<Option<PathBuf>> = Vec::with_capacity(inputs.len());
        let mut remote = Vec::new();
        let mut remote_slots = Vec::new();
        for (slot, input) in inputs.into_iter().enumerate() {
            match input {
                FileRef::Local(path) => resolved.push(Some(path)),
                FileRef::Remote(file) => {
                    resolved.push(None);
                    remote_slots.push(slot);
                    remote.push(file);
                }
            }
        }

        if remote.is_empty() {
            debug!(config = config_id, files = resolved.len(), "[QUEUE] Local-only inputs, bypassing queue");
            return Ok(resolved.into_iter().flatten().collect());
        }

        let job_id = self.submit_and_process(DownloadJob::new(config_id, remote, priority));
        let result = self.wait_for_completion(job_id).await?;
        for (slot, local) in remote_slots.into_iter().zip(result.files) {
            resolved[slot] = Some(local.path);
        }
        Ok(resolved.into_iter().flatten().collect())
    }

    /// Jobs submitted but not yet started.
    pub fn pending_jobs(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Jobs currently being serviced.
    pub fn active_jobs(&self) -> usize {
        self.shared.lock().active
    }
}

impl Drop for DownloadQueue {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch(shared: Arc<Shared>) {
    let slots = Arc::new(Semaphore::new(shared.options.max_concurrent_jobs.max(1)));
    loop {
        let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
            return;
        };
        let next = loop {
            let popped = {
                let mut state = shared.lock();
                let popped = state.pending.pop();
                if popped.is_some() {
                    state.active += 1;
                }
                popped
            };
            match popped {
                Some(next) => break next,
                None => shared.wake.notified().await,
            }
        };

        let slot = ActiveSlot {
            shared: Arc::clone(&shared),
            _permit: permit,
        };
        tokio::spawn(async move {
            let Queued { job, reply, .. } = next;
            let options = slot.shared.options;
            let result = service_job(slot.shared.downloader.as_ref(), &job, options.files_per_job).await;
            drop(slot);
            if reply.send(result).is_err() {
                debug!(job_id = %job.id, "[QUEUE] Nobody waiting for job result, dropping it");
            }
        });
    }
}

async fn service_job(
    downloader: &dyn FileDownloader,
    job: &DownloadJob,
    files_per_job: usize,
) -> Result<DownloadJobResult, DownloadError> {
    let started = Instant::now();
    info!(job_id = %job.id, config = %job.config_id, priority = job.priority, files = job.files.len(), "[QUEUE] Servicing job");

    let fetched = process_entries(job.files.clone(), files_per_job, |file| async move {
        match downloader.download_file(&file).await {
            Ok(path) => Ok(LocalFile { remote: file, path }),
            Err(e) => Err((file.url, e)),
        }
    })
    .await;

    match fetched {
        Ok(files) => {
            let elapsed = started.elapsed();
            info!(job_id = %job.id, config = %job.config_id, files = files.len(), elapsed_ms = elapsed.as_millis() as u64, "[QUEUE] Job completed");
            Ok(DownloadJobResult {
                job_id: job.id,
                config_id: job.config_id.clone(),
                files,
                elapsed,
            })
        }
        Err(failure) => {
            let cancelled = failure.cancelled.len();
            let (file, source) = failure.into_source();
            error!(job_id = %job.id, config = %job.config_id, file = %file, error = %source, cancelled, "[QUEUE] Job failed");
            Err(DownloadError::FileFailed {
                job_id: job.id,
                file,
                source,
            })
        }
    }
}
