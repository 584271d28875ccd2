//! Storage module for persisting crawl data
//!
//! This module handles all database operations for the crawler, including:
//! - SQLite database initialization and schema management
//! - Source and disease catalog persistence
//! - Per-(source, term) cursor bags
//! - Crawl job tracking
//! - Document versioning and disease associations

mod schema;
mod sqlite;
mod traits;

pub use sqlite::{DocumentTransaction, SqliteStorage};
pub use traits::{Storage, StorageError, StorageResult};

use crate::state::JobStatus;
use crate::CrawlError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Storage handle shared between concurrently running jobs
pub type SharedStorage = Arc<Mutex<SqliteStorage>>;

/// Opens a storage database and wraps it for sharing across tasks
pub fn open_storage(path: &Path) -> Result<SharedStorage, CrawlError> {
    Ok(share(SqliteStorage::new(path)?))
}

/// Wraps an open storage for sharing across tasks
pub fn share(storage: SqliteStorage) -> SharedStorage {
    Arc::new(Mutex::new(storage))
}

/// Locks shared storage; the guard must be dropped before the next `.await`
pub fn lock(storage: &SharedStorage) -> StorageResult<MutexGuard<'_, SqliteStorage>> {
    storage.lock().map_err(|_| StorageError::LockPoisoned)
}

/// How a source decides which diseases it covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationMethod {
    /// Fixed, admin-curated mapping to specific diseases; scraped wholesale
    Linked,
    /// Queried once per disease term
    Search,
}

impl AssociationMethod {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Linked => "linked",
            Self::Search => "search",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "linked" => Some(Self::Linked),
            "search" => Some(Self::Search),
            _ => None,
        }
    }
}

/// Represents a source in the database
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub id: i64,
    pub name: String,
    pub category: Option<String>,
    pub connector: String,
    pub association_method: AssociationMethod,
    /// Maximum outbound calls per second
    pub rate_limit: f64,
    pub is_active: bool,
    pub config: Map<String, Value>,
    pub crawl_state: Map<String, Value>,
    pub last_crawled: Option<DateTime<Utc>>,
    pub last_crawled_id: Option<i64>,
}

/// Fields needed to register a source
#[derive(Debug, Clone)]
pub struct NewSource {
    pub name: String,
    pub category: Option<String>,
    pub connector: String,
    pub association_method: AssociationMethod,
    pub rate_limit: f64,
    pub config: Map<String, Value>,
}

/// Outcome of retiring a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRetirement {
    /// The source had no documents and was removed
    Deleted,
    /// The source has documents and was deactivated instead
    Deactivated,
}

/// Represents a disease in the database
#[derive(Debug, Clone)]
pub struct DiseaseRecord {
    pub id: i64,
    pub name: String,
    pub synonyms: Vec<String>,
    pub category: Option<String>,
}

/// One recorded failure inside a crawl job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Where the failure happened (unit of work, item id)
    pub context: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorDetail {
    pub fn new(context: impl Into<String>, error: impl ToString) -> Self {
        Self {
            context: context.into(),
            error: error.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Progress counters of a crawl job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounters {
    pub documents_found: u64,
    pub documents_processed: u64,
    pub errors: u64,
}

/// Represents a crawl job
#[derive(Debug, Clone)]
pub struct CrawlJobRecord {
    pub id: i64,
    pub source_id: i64,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counters: JobCounters,
    pub error_details: Vec<ErrorDetail>,
    /// Snapshot of the launch parameters
    pub config: Value,
}

/// The canonical document shape produced by connectors
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedDocument {
    pub external_id: String,
    pub url: Option<String>,
    pub title: String,
    pub content: Option<String>,
    pub summary: Option<String>,
    pub metadata: Map<String, Value>,
    pub relevance_score: Option<f64>,
}

/// Versioning information about a stored document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentVersion {
    pub id: i64,
    pub source_updated_at: DateTime<Utc>,
}

/// Represents a document in the database
#[derive(Debug, Clone)]
pub struct DocumentRecord {
    pub id: i64,
    pub source_id: i64,
    pub external_id: String,
    pub url: Option<String>,
    pub title: String,
    pub content: Option<String>,
    pub summary: Option<String>,
    pub metadata: Map<String, Value>,
    pub status: String,
    pub relevance_score: Option<f64>,
    pub source_updated_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub update_count: u32,
    pub scraped_at: DateTime<Utc>,
    pub last_checked_at: DateTime<Utc>,
}
