//! Storage traits and error types
//!
//! This module defines the trait interface for storage backends and
//! associated error types.

use crate::state::{CursorBag, JobStatus};
use crate::storage::{
    CrawlJobRecord, DiseaseRecord, DocumentRecord, DocumentVersion, ErrorDetail, JobCounters,
    NewSource, NormalizedDocument, SourceRecord, SourceRetirement,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Source not found: {0}")]
    SourceNotFound(i64),

    #[error("Disease not found: {0}")]
    DiseaseNotFound(i64),

    #[error("Crawl job not found: {0}")]
    JobNotFound(i64),

    #[error("Document not found: {0}")]
    DocumentNotFound(i64),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for storage backend implementations
///
/// Job writes are guarded: once a job is terminal every mutating job method
/// returns `Ok(false)` and leaves the row untouched.
pub trait Storage {
    // ===== Source Management =====

    /// Registers a new source and returns its ID
    fn create_source(&mut self, source: &NewSource) -> StorageResult<i64>;

    /// Inserts a source or updates the existing one with the same name
    ///
    /// Cursor state and crawl timestamps of an existing source are preserved.
    fn upsert_source(&mut self, source: &NewSource) -> StorageResult<i64>;

    /// Gets a source by ID
    fn get_source(&self, source_id: i64) -> StorageResult<SourceRecord>;

    /// Gets a source by its unique name
    fn get_source_by_name(&self, name: &str) -> StorageResult<Option<SourceRecord>>;

    /// Lists all sources ordered by name
    fn list_sources(&self) -> StorageResult<Vec<SourceRecord>>;

    /// Links a source to a disease (fixed association); idempotent
    fn link_source_disease(&mut self, source_id: i64, disease_id: i64) -> StorageResult<()>;

    /// Gets the disease IDs linked to a source
    fn linked_disease_ids(&self, source_id: i64) -> StorageResult<Vec<i64>>;

    /// Stamps the source with the time and job of its last successful crawl
    fn mark_source_crawled(
        &mut self,
        source_id: i64,
        job_id: i64,
        at: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Removes a source, or deactivates it when documents reference it
    fn retire_source(&mut self, source_id: i64) -> StorageResult<SourceRetirement>;

    // ===== Cursor State =====

    /// Gets the cursor bag stored under `key` (empty if none)
    fn get_cursor(&self, source_id: i64, key: &str) -> StorageResult<CursorBag>;

    /// Merges `fields` into the cursor bag under `key` and returns the result
    fn merge_cursor(&mut self, source_id: i64, key: &str, fields: &CursorBag)
        -> StorageResult<CursorBag>;

    /// Removes the cursor bag under `key`
    fn reset_cursor(&mut self, source_id: i64, key: &str) -> StorageResult<()>;

    // ===== Disease Management =====

    /// Inserts a disease or updates the one with the same name
    fn upsert_disease(
        &mut self,
        name: &str,
        synonyms: &[String],
        category: Option<&str>,
    ) -> StorageResult<i64>;

    /// Gets a disease by ID
    fn get_disease(&self, disease_id: i64) -> StorageResult<DiseaseRecord>;

    /// Finds diseases whose name matches one of `names` (case-insensitive)
    fn find_diseases_by_names(&self, names: &[String]) -> StorageResult<Vec<DiseaseRecord>>;

    // ===== Job Management =====

    /// Creates a pending job carrying a launch snapshot
    fn create_job(&mut self, source_id: i64, config: &Value) -> StorageResult<i64>;

    /// Gets a job by ID
    fn get_job(&self, job_id: i64) -> StorageResult<CrawlJobRecord>;

    /// Replaces the config snapshot of a non-terminal job
    fn update_job_config(&mut self, job_id: i64, config: &Value) -> StorageResult<bool>;

    /// Moves a pending job to running
    fn start_job(&mut self, job_id: i64, at: DateTime<Utc>) -> StorageResult<bool>;

    /// Writes counters and appends errors to a non-terminal job
    fn record_job_progress(
        &mut self,
        job_id: i64,
        counters: JobCounters,
        new_errors: &[ErrorDetail],
    ) -> StorageResult<bool>;

    /// Moves a non-terminal job into a terminal status and sets `completed_at`
    fn finish_job(
        &mut self,
        job_id: i64,
        status: JobStatus,
        at: DateTime<Utc>,
        counters: JobCounters,
        new_errors: &[ErrorDetail],
    ) -> StorageResult<bool>;

    /// Lists running jobs started before `cutoff`
    fn list_running_jobs_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StorageResult<Vec<CrawlJobRecord>>;

    /// Lists the most recent jobs of a source, newest first
    fn list_jobs_for_source(&self, source_id: i64, limit: u32)
        -> StorageResult<Vec<CrawlJobRecord>>;

    // ===== Document Management =====

    /// Gets the versioning info of a document by its natural key
    fn find_document_version(
        &self,
        source_id: i64,
        external_id: &str,
    ) -> StorageResult<Option<DocumentVersion>>;

    /// Inserts a document; returns `None` if the natural key already exists
    fn insert_document(
        &mut self,
        source_id: i64,
        doc: &NormalizedDocument,
        source_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<i64>>;

    /// Overwrites document content and bumps `update_count`
    fn update_document_content(
        &mut self,
        document_id: i64,
        doc: &NormalizedDocument,
        source_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Advances only the last-checked timestamp of a document
    fn touch_document(&mut self, document_id: i64, now: DateTime<Utc>) -> StorageResult<()>;

    /// Links a document to a disease; a duplicate link is a no-op
    fn link_document_disease(
        &mut self,
        document_id: i64,
        disease_id: i64,
        relevance: f64,
        confidence: f64,
    ) -> StorageResult<()>;

    /// Gets a document by ID
    fn get_document(&self, document_id: i64) -> StorageResult<DocumentRecord>;

    /// Gets a document by its natural key
    fn get_document_by_external_id(
        &self,
        source_id: i64,
        external_id: &str,
    ) -> StorageResult<Option<DocumentRecord>>;

    /// Gets the disease IDs linked to a document
    fn document_disease_ids(&self, document_id: i64) -> StorageResult<Vec<i64>>;

    // ===== Statistics =====

    /// Counts documents, optionally restricted to one source
    fn count_documents(&self, source_id: Option<i64>) -> StorageResult<u64>;

    /// Document counts per source name
    fn count_documents_by_source(&self) -> StorageResult<Vec<(String, u64)>>;

    /// Job counts per status
    fn count_jobs_by_status(&self) -> StorageResult<HashMap<JobStatus, u64>>;

    /// Total number of document-disease links
    fn count_document_links(&self) -> StorageResult<u64>;
}
