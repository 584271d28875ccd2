//! Crawl job lifecycle
//!
//! A job moves `pending → running → {completed, failed, cancelled}`. Counters
//! are kept in memory and flushed to storage every few items. Once the stored
//! job is terminal, whether by this run or by an out-of-band cancel or reaper,
//! every further write is ignored and reported as such.

use crate::state::JobStatus;
use crate::storage::{self, ErrorDetail, JobCounters, SharedStorage, Storage, StorageError};
use crate::{CrawlError, Result};
use chrono::{Duration, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Error context used for the fatal cause of a failed job
pub const FATAL_CONTEXT: &str = "fatal";

/// Tracks one crawl job from creation to its terminal state
pub struct JobLifecycle {
    storage: SharedStorage,
    job_id: i64,
    status: JobStatus,
    counters: JobCounters,
    pending_errors: Vec<ErrorDetail>,
    flush_every: u64,
    since_flush: u64,
}

impl JobLifecycle {
    /// Creates a pending job carrying `snapshot`
    pub fn create(
        storage: SharedStorage,
        source_id: i64,
        snapshot: &Value,
        flush_every: u64,
    ) -> Result<Self> {
        let job_id = storage::lock(&storage)?.create_job(source_id, snapshot)?;
        debug!("Created crawl job {} for source {}", job_id, source_id);
        Ok(Self::attach(storage, job_id, JobStatus::Pending, flush_every))
    }

    /// Adopts a caller-created pending job and replaces its snapshot
    pub fn adopt(
        storage: SharedStorage,
        job_id: i64,
        source_id: i64,
        snapshot: &Value,
        flush_every: u64,
    ) -> Result<Self> {
        {
            let mut guard = storage::lock(&storage)?;
            let job = guard.get_job(job_id).map_err(|e| match e {
                StorageError::JobNotFound(id) => CrawlError::JobNotFound(id),
                other => other.into(),
            })?;

            if job.status != JobStatus::Pending || job.source_id != source_id {
                return Err(CrawlError::JobNotAdoptable(job_id));
            }
            if !guard.update_job_config(job_id, snapshot)? {
                return Err(CrawlError::JobNotAdoptable(job_id));
            }
        }

        debug!("Adopted crawl job {} for source {}", job_id, source_id);
        Ok(Self::attach(storage, job_id, JobStatus::Pending, flush_every))
    }

    fn attach(storage: SharedStorage, job_id: i64, status: JobStatus, flush_every: u64) -> Self {
        Self {
            storage,
            job_id,
            status,
            counters: JobCounters::default(),
            pending_errors: Vec::new(),
            flush_every: flush_every.max(1),
            since_flush: 0,
        }
    }

    pub fn id(&self) -> i64 {
        self.job_id
    }

    /// Last known status; refreshed whenever storage ignores a write
    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn counters(&self) -> JobCounters {
        self.counters
    }

    /// Moves the job from pending to running
    pub fn start(&mut self) -> Result<bool> {
        self.check_transition(JobStatus::Running)?;
        if self.status.is_terminal() {
            return Ok(false);
        }

        let applied = storage::lock(&self.storage)?.start_job(self.job_id, Utc::now())?;
        if applied {
            self.status = JobStatus::Running;
            info!("Crawl job {} started", self.job_id);
        } else {
            self.refresh_status()?;
        }
        Ok(applied)
    }

    /// Adds to `documents_found`
    pub fn found(&mut self, count: u64) {
        self.counters.documents_found += count;
    }

    /// Counts one successfully processed item
    pub fn processed(&mut self) -> Result<()> {
        self.counters.documents_processed += 1;
        self.tick()
    }

    /// Records a non-fatal error
    pub fn error(&mut self, context: impl Into<String>, error: impl ToString) -> Result<()> {
        let detail = ErrorDetail::new(context, error);
        warn!(
            "Crawl job {}: {} failed: {}",
            self.job_id, detail.context, detail.error
        );
        self.counters.errors += 1;
        self.pending_errors.push(detail);
        self.tick()
    }

    fn tick(&mut self) -> Result<()> {
        self.since_flush += 1;
        if self.since_flush >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    /// Writes counters and buffered errors; returns false if the job is terminal
    pub fn flush(&mut self) -> Result<bool> {
        self.since_flush = 0;
        if self.status.is_terminal() {
            self.pending_errors.clear();
            return Ok(false);
        }

        let applied = storage::lock(&self.storage)?.record_job_progress(
            self.job_id,
            self.counters,
            &self.pending_errors,
        )?;
        self.pending_errors.clear();

        if applied {
            debug!(
                "Crawl job {} progress: found {}, processed {}, errors {}",
                self.job_id,
                self.counters.documents_found,
                self.counters.documents_processed,
                self.counters.errors
            );
        } else {
            self.refresh_status()?;
        }
        Ok(applied)
    }

    /// Cooperative cancellation check, run between units of work
    pub fn is_cancelled(&mut self) -> Result<bool> {
        self.refresh_status()?;
        Ok(self.status == JobStatus::Cancelled)
    }

    /// True once the stored job is terminal, by any hand
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Marks the job completed
    pub fn complete(&mut self) -> Result<bool> {
        self.finish(JobStatus::Completed, None)
    }

    /// Marks the job failed with `cause` as its final error entry
    pub fn fail(&mut self, cause: impl ToString) -> Result<bool> {
        let detail = ErrorDetail::new(FATAL_CONTEXT, cause);
        self.finish(JobStatus::Failed, Some(detail))
    }

    fn finish(&mut self, next: JobStatus, fatal: Option<ErrorDetail>) -> Result<bool> {
        self.check_transition(next)?;
        if self.status.is_terminal() {
            info!(
                "Crawl job {} is already {}, ignoring transition to {}",
                self.job_id, self.status, next
            );
            return Ok(false);
        }

        if let Some(detail) = fatal {
            self.counters.errors += 1;
            self.pending_errors.push(detail);
        }

        let applied = storage::lock(&self.storage)?.finish_job(
            self.job_id,
            next,
            Utc::now(),
            self.counters,
            &self.pending_errors,
        )?;
        self.pending_errors.clear();
        self.since_flush = 0;

        if applied {
            self.status = next;
            info!(
                "Crawl job {} {}: found {}, processed {}, errors {}",
                self.job_id,
                next,
                self.counters.documents_found,
                self.counters.documents_processed,
                self.counters.errors
            );
        } else {
            self.refresh_status()?;
            info!(
                "Crawl job {} was finished elsewhere as {}, ignoring transition to {}",
                self.job_id, self.status, next
            );
        }
        Ok(applied)
    }

    /// Rejects backward transitions from an active state
    fn check_transition(&self, next: JobStatus) -> Result<()> {
        if self.status.is_active() && !self.status.can_transition_to(next) {
            return Err(CrawlError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        Ok(())
    }

    fn refresh_status(&mut self) -> Result<()> {
        let job = storage::lock(&self.storage)?.get_job(self.job_id)?;
        self.status = job.status;
        Ok(())
    }
}

/// Cancels a job out of band; returns false if it was already terminal
pub fn cancel_job(storage: &SharedStorage, job_id: i64) -> Result<bool> {
    let mut guard = storage::lock(storage)?;
    let job = guard.get_job(job_id).map_err(|e| match e {
        StorageError::JobNotFound(id) => CrawlError::JobNotFound(id),
        other => other.into(),
    })?;

    if job.status.is_terminal() {
        return Ok(false);
    }

    let applied = guard.finish_job(job_id, JobStatus::Cancelled, Utc::now(), job.counters, &[])?;
    if applied {
        info!("Crawl job {} cancelled", job_id);
    }
    Ok(applied)
}

/// Force-fails jobs stuck in `running` for longer than `max_age`
///
/// # Returns
///
/// IDs of the jobs that were reaped
pub fn reap_stale_jobs(storage: &SharedStorage, max_age: Duration) -> Result<Vec<i64>> {
    let now = Utc::now();
    let mut guard = storage::lock(storage)?;
    let stale = guard.list_running_jobs_started_before(now - max_age)?;

    let mut reaped = Vec::new();
    for job in stale {
        let mut counters = job.counters;
        counters.errors += 1;
        let detail = ErrorDetail::new(
            FATAL_CONTEXT,
            format!(
                "job exceeded {} minutes in running state",
                max_age.num_minutes()
            ),
        );

        if guard.finish_job(job.id, JobStatus::Failed, now, counters, &[detail])? {
            warn!("Reaped stale crawl job {} of source {}", job.id, job.source_id);
            reaped.push(job.id);
        }
    }

    Ok(reaped)
}
