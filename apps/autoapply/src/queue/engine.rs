//! Apply queue: a durable, deduplicated queue of postings waiting for
//! an application, drained by single-flight batch runs.
//!
//! Per entry: Queued → Applying → Applied (dropped) | FailedRetained (kept).
//!
//! The persisted queue is only ever read-modify-written as a whole, under a
//! store lock shared with every other process on the same data directory. A
//! batch writes its outcome back once, after every entry has been attempted,
//! and holds a second store lock for its whole run.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::{Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::api_client::endpoints::JobsApi;
use crate::errors::{ApiError, ErrorSummary};
use crate::models::job::JobPosting;
use crate::models::queue::QueueEntry;
use crate::queue::dedup::dedup_key;
use crate::store::{self, LocalStore, StoreError, StoreLock, QUEUE_KEY};

const QUEUE_LOCK: &str = "maa_apply_queue";
const BATCH_LOCK: &str = "maa_apply_batch";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("No queued job at position {index} (queue has {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("A batch run is already in progress")]
    BatchInProgress,

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Apply queue storage failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Added { entry: QueueEntry },
    Duplicate { job_id: String },
}

#[derive(Debug, Serialize)]
pub struct AppliedEntry {
    pub entry: QueueEntry,
    /// Application record returned by the server.
    pub application: Value,
}

#[derive(Debug, Serialize)]
pub struct FailedEntry {
    pub entry: QueueEntry,
    #[serde(serialize_with = "serialize_error")]
    pub error: ApiError,
}

/// Outcome of one batch run. `succeeded` and `failed` partition the snapshot.
#[derive(Debug, Default, Serialize)]
pub struct BatchReport {
    pub succeeded: Vec<AppliedEntry>,
    pub failed: Vec<FailedEntry>,
    /// Server-confirmed applications list fetched after the batch.
    pub applications: Option<Vec<Value>>,
    pub refresh_error: Option<ErrorSummary>,
    /// Set when the outcome could not be written back. Applied entries are
    /// then still queued locally.
    pub persist_error: Option<String>,
}

fn serialize_error<S: Serializer>(error: &ApiError, serializer: S) -> Result<S::Ok, S::Error> {
    error.summary().serialize(serializer)
}

pub struct ApplyQueue {
    store: Arc<dyn LocalStore>,
    api: JobsApi,
    write_lock: Mutex<()>,
    running: AtomicBool,
}

/// Releases the single-flight flag on every exit path.
struct BatchGuard<'a>(&'a AtomicBool);

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ApplyQueue {
    pub fn new(store: Arc<dyn LocalStore>, api: JobsApi) -> Self {
        Self {
            store,
            api,
            write_lock: Mutex::new(()),
            running: AtomicBool::new(false),
        }
    }

    /// Current queue, most recently added first.
    pub fn list(&self) -> Result<Vec<QueueEntry>, QueueError> {
        Ok(self.load()?)
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn enqueue(&self, job: &JobPosting) -> Result<EnqueueOutcome, QueueError> {
        let _lock = self.lock()?;
        let now = Utc::now();
        let job_id = dedup_key(job, now);

        let mut entries = self.load()?;
        if entries.iter().any(|e| e.job_id == job_id) {
            info!("Job {job_id} already queued");
            return Ok(EnqueueOutcome::Duplicate { job_id });
        }

        let entry = QueueEntry {
            job_id,
            title: job.title.clone().unwrap_or_default(),
            company: job.company.clone().unwrap_or_default(),
            location: job.location.clone().unwrap_or_default(),
            source_url: job.url.clone().unwrap_or_default(),
            notes: job.notes.clone().unwrap_or_default(),
            enqueued_at: now,
        };
        entries.insert(0, entry.clone());
        self.save(&entries)?;
        info!("Queued job {} ({} pending)", entry.job_id, entries.len());
        Ok(EnqueueOutcome::Added { entry })
    }

    pub fn dequeue(&self, index: usize) -> Result<QueueEntry, QueueError> {
        let _lock = self.lock()?;
        let mut entries = self.load()?;
        if index >= entries.len() {
            return Err(QueueError::IndexOutOfRange {
                index,
                len: entries.len(),
            });
        }
        let removed = entries.remove(index);
        self.save(&entries)?;
        Ok(removed)
    }

    pub fn clear(&self) -> Result<(), QueueError> {
        let _lock = self.lock()?;
        self.save(&[])?;
        Ok(())
    }

    /// Attempts every queued entry once, in order.
    ///
    /// Individual failures are reported in the result, never returned as the
    /// error. `Err` means the batch could not start: already running here or
    /// in another process, no session, or the queue could not be read. Once
    /// any entry has been attempted the report is always returned.
    pub async fn run_batch(&self) -> Result<BatchReport, QueueError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(QueueError::BatchInProgress);
        }
        let _guard = BatchGuard(&self.running);
        let Some(_batch_lock) = self.store.try_lock(BATCH_LOCK)? else {
            info!("Another process is running an apply batch");
            return Err(QueueError::BatchInProgress);
        };

        if !self.api.orchestrator().session().is_authenticated() {
            return Err(QueueError::Api(ApiError::Unauthenticated));
        }

        let snapshot = {
            let _lock = self.lock()?;
            self.load()?
        };
        if snapshot.is_empty() {
            return Ok(BatchReport::default());
        }
        info!("Running apply batch over {} queued job(s)", snapshot.len());

        let snapshot_keys: HashSet<String> = snapshot.iter().map(|e| e.job_id.clone()).collect();
        let mut report = BatchReport::default();
        for entry in snapshot {
            match self.api.apply(&entry.apply_payload()).await {
                Ok(application) => {
                    info!("Applied to {} ({})", entry.job_id, entry.title);
                    report.succeeded.push(AppliedEntry { entry, application });
                }
                Err(error) => {
                    warn!("Apply for {} failed, keeping it queued: {}", entry.job_id, error);
                    report.failed.push(FailedEntry { entry, error });
                }
            }
        }

        if let Err(e) = self.merge_back(&snapshot_keys, &report.failed) {
            warn!("Could not write batch outcome back to the queue: {e}");
            report.persist_error = Some(e.to_string());
        }
        info!(
            "Batch finished: {} applied, {} retained",
            report.succeeded.len(),
            report.failed.len()
        );

        match self.api.list_applications().await {
            Ok(applications) => report.applications = Some(applications),
            Err(e) => {
                warn!("Could not refresh applications after batch: {e}");
                report.refresh_error = Some(e.summary());
            }
        }
        Ok(report)
    }

    /// Replaces the snapshot's entries with the failed ones. Entries enqueued
    /// while the batch was running stay at the front.
    fn merge_back(&self, snapshot_keys: &HashSet<String>, failed: &[FailedEntry]) -> Result<(), StoreError> {
        let _lock = self.lock()?;
        let mut merged: Vec<QueueEntry> = self
            .load()?
            .into_iter()
            .filter(|e| !snapshot_keys.contains(&e.job_id))
            .collect();
        merged.extend(failed.iter().map(|f| f.entry.clone()));
        self.save(&merged)
    }

    fn load(&self) -> Result<Vec<QueueEntry>, StoreError> {
        Ok(store::load(self.store.as_ref(), QUEUE_KEY)?.unwrap_or_default())
    }

    fn save(&self, entries: &[QueueEntry]) -> Result<(), StoreError> {
        store::save(self.store.as_ref(), QUEUE_KEY, &entries)
    }

    /// Guards one read-modify-write of the persisted queue against other
    /// threads and other processes.
    fn lock(&self) -> Result<(MutexGuard<'_, ()>, StoreLock), StoreError> {
        let local = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let shared = self.store.lock(QUEUE_LOCK)?;
        Ok((local, shared))
    }
}
