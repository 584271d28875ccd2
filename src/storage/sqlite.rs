//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Storage trait.

use crate::state::{CursorBag, JobStatus};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Storage, StorageError, StorageResult};
use crate::storage::{
    AssociationMethod, CrawlJobRecord, DiseaseRecord, DocumentRecord, DocumentVersion,
    ErrorDetail, JobCounters, NewSource, NormalizedDocument, SourceRecord, SourceRetirement,
};
use crate::CrawlError;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;

const SOURCE_COLUMNS: &str = "id, name, category, connector, association_method, rate_limit,
     is_active, config, crawl_state, last_crawled, last_crawled_id";

const JOB_COLUMNS: &str = "id, source_id, status, created_at, started_at, completed_at,
     documents_found, documents_processed, errors, error_details, config";

const DOCUMENT_COLUMNS: &str = "id, source_id, external_id, url, title, content, summary,
     metadata, status, relevance_score, source_updated_at, updated_at, update_count,
     scraped_at, last_checked_at";

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(CrawlError)` - Failed to open database
    pub fn new(path: &Path) -> Result<Self, CrawlError> {
        let conn = Connection::open(path)?;

        // Configure SQLite for better performance
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database (for testing)
    pub fn new_in_memory() -> Result<Self, CrawlError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Opens a write transaction for one document and its disease links
    pub fn document_transaction(&mut self) -> StorageResult<DocumentTransaction<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(DocumentTransaction { tx })
    }

    fn job_state(&self, job_id: i64) -> StorageResult<(JobStatus, Vec<ErrorDetail>)> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT status, error_details FROM crawl_jobs WHERE id = ?1",
                params![job_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (status, details) = row.ok_or(StorageError::JobNotFound(job_id))?;
        let status = JobStatus::from_db_string(&status)
            .ok_or_else(|| StorageError::Database(format!("Unknown job status '{}'", status)))?;
        Ok((status, serde_json::from_str(&details)?))
    }

    /// Shared write path for progress and terminal updates
    fn write_job(
        &mut self,
        job_id: i64,
        transition: Option<(JobStatus, DateTime<Utc>)>,
        counters: JobCounters,
        new_errors: &[ErrorDetail],
    ) -> StorageResult<bool> {
        let tx = self.conn.transaction()?;

        let row: Option<(String, String)> = tx
            .query_row(
                "SELECT status, error_details FROM crawl_jobs WHERE id = ?1",
                params![job_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (status, details) = row.ok_or(StorageError::JobNotFound(job_id))?;
        let current = JobStatus::from_db_string(&status)
            .ok_or_else(|| StorageError::Database(format!("Unknown job status '{}'", status)))?;

        if current.is_terminal() {
            return Ok(false);
        }
        if let Some((next, _)) = transition {
            if !current.can_transition_to(next) {
                return Ok(false);
            }
        }

        let mut details: Vec<ErrorDetail> = serde_json::from_str(&details)?;
        details.extend_from_slice(new_errors);
        let details = serde_json::to_string(&details)?;

        match transition {
            Some((next, at)) => {
                tx.execute(
                    "UPDATE crawl_jobs SET status = ?1, completed_at = ?2, documents_found = ?3,
                     documents_processed = ?4, errors = ?5, error_details = ?6 WHERE id = ?7",
                    params![
                        next.to_db_string(),
                        ts(at),
                        counters.documents_found as i64,
                        counters.documents_processed as i64,
                        counters.errors as i64,
                        details,
                        job_id
                    ],
                )?;
            }
            None => {
                tx.execute(
                    "UPDATE crawl_jobs SET documents_found = ?1, documents_processed = ?2,
                     errors = ?3, error_details = ?4 WHERE id = ?5",
                    params![
                        counters.documents_found as i64,
                        counters.documents_processed as i64,
                        counters.errors as i64,
                        details,
                        job_id
                    ],
                )?;
            }
        }

        tx.commit()?;
        Ok(true)
    }
}

impl Storage for SqliteStorage {
    // ===== Source Management =====

    fn create_source(&mut self, source: &NewSource) -> StorageResult<i64> {
        self.conn.execute(
            "INSERT INTO sources (name, category, connector, association_method, rate_limit, config)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                source.name,
                source.category,
                source.connector,
                source.association_method.to_db_string(),
                source.rate_limit,
                serde_json::to_string(&source.config)?
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn upsert_source(&mut self, source: &NewSource) -> StorageResult<i64> {
        self.conn.execute(
            "INSERT INTO sources (name, category, connector, association_method, rate_limit, config)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(name) DO UPDATE SET
                category = excluded.category,
                connector = excluded.connector,
                association_method = excluded.association_method,
                rate_limit = excluded.rate_limit,
                config = excluded.config",
            params![
                source.name,
                source.category,
                source.connector,
                source.association_method.to_db_string(),
                source.rate_limit,
                serde_json::to_string(&source.config)?
            ],
        )?;

        let id = self.conn.query_row(
            "SELECT id FROM sources WHERE name = ?1",
            params![source.name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn get_source(&self, source_id: i64) -> StorageResult<SourceRecord> {
        let sql = format!("SELECT {} FROM sources WHERE id = ?1", SOURCE_COLUMNS);
        self.conn
            .query_row(&sql, params![source_id], source_from_row)
            .optional()?
            .ok_or(StorageError::SourceNotFound(source_id))
    }

    fn get_source_by_name(&self, name: &str) -> StorageResult<Option<SourceRecord>> {
        let sql = format!("SELECT {} FROM sources WHERE name = ?1", SOURCE_COLUMNS);
        let source = self
            .conn
            .query_row(&sql, params![name], source_from_row)
            .optional()?;
        Ok(source)
    }

    fn list_sources(&self) -> StorageResult<Vec<SourceRecord>> {
        let sql = format!("SELECT {} FROM sources ORDER BY name", SOURCE_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let sources = stmt
            .query_map([], source_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sources)
    }

    fn link_source_disease(&mut self, source_id: i64, disease_id: i64) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO source_diseases (source_id, disease_id) VALUES (?1, ?2)",
            params![source_id, disease_id],
        )?;
        Ok(())
    }

    fn linked_disease_ids(&self, source_id: i64) -> StorageResult<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT disease_id FROM source_diseases WHERE source_id = ?1 ORDER BY disease_id",
        )?;
        let ids = stmt
            .query_map(params![source_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn mark_source_crawled(
        &mut self,
        source_id: i64,
        job_id: i64,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let changed = self.conn.execute(
            "UPDATE sources SET last_crawled = ?1, last_crawled_id = ?2 WHERE id = ?3",
            params![ts(at), job_id, source_id],
        )?;
        if changed == 0 {
            return Err(StorageError::SourceNotFound(source_id));
        }
        Ok(())
    }

    fn retire_source(&mut self, source_id: i64) -> StorageResult<SourceRetirement> {
        let tx = self.conn.transaction()?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT id FROM sources WHERE id = ?1",
                params![source_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StorageError::SourceNotFound(source_id));
        }

        let documents: i64 = tx.query_row(
            "SELECT COUNT(*) FROM documents WHERE source_id = ?1",
            params![source_id],
            |row| row.get(0),
        )?;

        let outcome = if documents > 0 {
            tx.execute(
                "UPDATE sources SET is_active = 0 WHERE id = ?1",
                params![source_id],
            )?;
            SourceRetirement::Deactivated
        } else {
            tx.execute("DELETE FROM sources WHERE id = ?1", params![source_id])?;
            SourceRetirement::Deleted
        };

        tx.commit()?;
        Ok(outcome)
    }

    // ===== Cursor State =====

    fn get_cursor(&self, source_id: i64, key: &str) -> StorageResult<CursorBag> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT crawl_state FROM sources WHERE id = ?1",
                params![source_id],
                |row| row.get(0),
            )
            .optional()?;
        let raw = raw.ok_or(StorageError::SourceNotFound(source_id))?;

        let mut state: Map<String, Value> = serde_json::from_str(&raw)?;
        match state.remove(key) {
            Some(Value::Object(bag)) => Ok(bag),
            _ => Ok(CursorBag::new()),
        }
    }

    fn merge_cursor(
        &mut self,
        source_id: i64,
        key: &str,
        fields: &CursorBag,
    ) -> StorageResult<CursorBag> {
        let tx = self.conn.transaction()?;

        let raw: Option<String> = tx
            .query_row(
                "SELECT crawl_state FROM sources WHERE id = ?1",
                params![source_id],
                |row| row.get(0),
            )
            .optional()?;
        let raw = raw.ok_or(StorageError::SourceNotFound(source_id))?;

        let mut state: Map<String, Value> = serde_json::from_str(&raw)?;
        let mut bag = match state.remove(key) {
            Some(Value::Object(bag)) => bag,
            _ => CursorBag::new(),
        };
        for (field, value) in fields {
            bag.insert(field.clone(), value.clone());
        }
        state.insert(key.to_string(), Value::Object(bag.clone()));

        tx.execute(
            "UPDATE sources SET crawl_state = ?1 WHERE id = ?2",
            params![serde_json::to_string(&state)?, source_id],
        )?;
        tx.commit()?;

        Ok(bag)
    }

    fn reset_cursor(&mut self, source_id: i64, key: &str) -> StorageResult<()> {
        let tx = self.conn.transaction()?;

        let raw: Option<String> = tx
            .query_row(
                "SELECT crawl_state FROM sources WHERE id = ?1",
                params![source_id],
                |row| row.get(0),
            )
            .optional()?;
        let raw = raw.ok_or(StorageError::SourceNotFound(source_id))?;

        let mut state: Map<String, Value> = serde_json::from_str(&raw)?;
        if state.remove(key).is_some() {
            tx.execute(
                "UPDATE sources SET crawl_state = ?1 WHERE id = ?2",
                params![serde_json::to_string(&state)?, source_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ===== Disease Management =====

    fn upsert_disease(
        &mut self,
        name: &str,
        synonyms: &[String],
        category: Option<&str>,
    ) -> StorageResult<i64> {
        self.conn.execute(
            "INSERT INTO diseases (name, synonyms, category) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET synonyms = excluded.synonyms,
                category = excluded.category",
            params![name, serde_json::to_string(synonyms)?, category],
        )?;

        let id = self.conn.query_row(
            "SELECT id FROM diseases WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn get_disease(&self, disease_id: i64) -> StorageResult<DiseaseRecord> {
        self.conn
            .query_row(
                "SELECT id, name, synonyms, category FROM diseases WHERE id = ?1",
                params![disease_id],
                disease_from_row,
            )
            .optional()?
            .ok_or(StorageError::DiseaseNotFound(disease_id))
    }

    fn find_diseases_by_names(&self, names: &[String]) -> StorageResult<Vec<DiseaseRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, synonyms, category FROM diseases WHERE name = ?1")?;

        let mut found: Vec<DiseaseRecord> = Vec::new();
        for name in names {
            if let Some(disease) = stmt
                .query_row(params![name.trim()], disease_from_row)
                .optional()?
            {
                if !found.iter().any(|d| d.id == disease.id) {
                    found.push(disease);
                }
            }
        }
        Ok(found)
    }

    // ===== Job Management =====

    fn create_job(&mut self, source_id: i64, config: &Value) -> StorageResult<i64> {
        self.conn.execute(
            "INSERT INTO crawl_jobs (source_id, status, created_at, config) VALUES (?1, ?2, ?3, ?4)",
            params![
                source_id,
                JobStatus::Pending.to_db_string(),
                ts(Utc::now()),
                serde_json::to_string(config)?
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get_job(&self, job_id: i64) -> StorageResult<CrawlJobRecord> {
        let sql = format!("SELECT {} FROM crawl_jobs WHERE id = ?1", JOB_COLUMNS);
        self.conn
            .query_row(&sql, params![job_id], job_from_row)
            .optional()?
            .ok_or(StorageError::JobNotFound(job_id))
    }

    fn update_job_config(&mut self, job_id: i64, config: &Value) -> StorageResult<bool> {
        let (status, _) = self.job_state(job_id)?;
        if status.is_terminal() {
            return Ok(false);
        }
        let changed = self.conn.execute(
            "UPDATE crawl_jobs SET config = ?1 WHERE id = ?2 AND status IN ('pending', 'running')",
            params![serde_json::to_string(config)?, job_id],
        )?;
        Ok(changed == 1)
    }

    fn start_job(&mut self, job_id: i64, at: DateTime<Utc>) -> StorageResult<bool> {
        let changed = self.conn.execute(
            "UPDATE crawl_jobs SET status = ?1, started_at = ?2 WHERE id = ?3 AND status = ?4",
            params![
                JobStatus::Running.to_db_string(),
                ts(at),
                job_id,
                JobStatus::Pending.to_db_string()
            ],
        )?;
        if changed == 0 {
            // Distinguish a missing job from one that already moved on
            self.job_state(job_id)?;
        }
        Ok(changed == 1)
    }

    fn record_job_progress(
        &mut self,
        job_id: i64,
        counters: JobCounters,
        new_errors: &[ErrorDetail],
    ) -> StorageResult<bool> {
        self.write_job(job_id, None, counters, new_errors)
    }

    fn finish_job(
        &mut self,
        job_id: i64,
        status: JobStatus,
        at: DateTime<Utc>,
        counters: JobCounters,
        new_errors: &[ErrorDetail],
    ) -> StorageResult<bool> {
        if !status.is_terminal() {
            return Ok(false);
        }
        self.write_job(job_id, Some((status, at)), counters, new_errors)
    }

    fn list_running_jobs_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StorageResult<Vec<CrawlJobRecord>> {
        let sql = format!(
            "SELECT {} FROM crawl_jobs WHERE status = ?1 AND started_at < ?2 ORDER BY id",
            JOB_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let jobs = stmt
            .query_map(
                params![JobStatus::Running.to_db_string(), ts(cutoff)],
                job_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    fn list_jobs_for_source(
        &self,
        source_id: i64,
        limit: u32,
    ) -> StorageResult<Vec<CrawlJobRecord>> {
        let sql = format!(
            "SELECT {} FROM crawl_jobs WHERE source_id = ?1 ORDER BY id DESC LIMIT ?2",
            JOB_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let jobs = stmt
            .query_map(params![source_id, limit], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    // ===== Document Management =====

    fn find_document_version(
        &self,
        source_id: i64,
        external_id: &str,
    ) -> StorageResult<Option<DocumentVersion>> {
        find_document_version(&self.conn, source_id, external_id)
    }

    fn insert_document(
        &mut self,
        source_id: i64,
        doc: &NormalizedDocument,
        source_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<i64>> {
        insert_document(&self.conn, source_id, doc, source_updated_at, now)
    }

    fn update_document_content(
        &mut self,
        document_id: i64,
        doc: &NormalizedDocument,
        source_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        update_document_content(&self.conn, document_id, doc, source_updated_at, now)
    }

    fn touch_document(&mut self, document_id: i64, now: DateTime<Utc>) -> StorageResult<()> {
        touch_document(&self.conn, document_id, now)
    }

    fn link_document_disease(
        &mut self,
        document_id: i64,
        disease_id: i64,
        relevance: f64,
        confidence: f64,
    ) -> StorageResult<()> {
        link_document_disease(&self.conn, document_id, disease_id, relevance, confidence)
    }

    fn get_document(&self, document_id: i64) -> StorageResult<DocumentRecord> {
        let sql = format!("SELECT {} FROM documents WHERE id = ?1", DOCUMENT_COLUMNS);
        self.conn
            .query_row(&sql, params![document_id], document_from_row)
            .optional()?
            .ok_or(StorageError::DocumentNotFound(document_id))
    }

    fn get_document_by_external_id(
        &self,
        source_id: i64,
        external_id: &str,
    ) -> StorageResult<Option<DocumentRecord>> {
        let sql = format!(
            "SELECT {} FROM documents WHERE source_id = ?1 AND external_id = ?2",
            DOCUMENT_COLUMNS
        );
        let document = self
            .conn
            .query_row(&sql, params![source_id, external_id], document_from_row)
            .optional()?;
        Ok(document)
    }

    fn document_disease_ids(&self, document_id: i64) -> StorageResult<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT disease_id FROM document_diseases WHERE document_id = ?1 ORDER BY disease_id",
        )?;
        let ids = stmt
            .query_map(params![document_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    // ===== Statistics =====

    fn count_documents(&self, source_id: Option<i64>) -> StorageResult<u64> {
        let count: i64 = match source_id {
            Some(id) => self.conn.query_row(
                "SELECT COUNT(*) FROM documents WHERE source_id = ?1",
                params![id],
                |row| row.get(0),
            )?,
            None => self
                .conn
                .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?,
        };
        Ok(count as u64)
    }

    fn count_documents_by_source(&self) -> StorageResult<Vec<(String, u64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.name, COUNT(d.id) AS count
             FROM sources s LEFT JOIN documents d ON d.source_id = s.id
             GROUP BY s.id ORDER BY count DESC, s.name",
        )?;
        let counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as u64)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(counts)
    }

    fn count_jobs_by_status(&self) -> StorageResult<HashMap<JobStatus, u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM crawl_jobs GROUP BY status")?;

        let mut summary = HashMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        for row in rows {
            let (status, count) = row?;
            if let Some(status) = JobStatus::from_db_string(&status) {
                summary.insert(status, count as u64);
            }
        }

        Ok(summary)
    }

    fn count_document_links(&self) -> StorageResult<u64> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM document_diseases", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

/// Formats a timestamp as fixed-width RFC 3339 so text comparison orders it
/// Document writes that commit or roll back together
///
/// Dropping the value without `commit` rolls every write back.
pub struct DocumentTransaction<'conn> {
    tx: Transaction<'conn>,
}

impl DocumentTransaction<'_> {
    pub fn find_version(
        &self,
        source_id: i64,
        external_id: &str,
    ) -> StorageResult<Option<DocumentVersion>> {
        find_document_version(&self.tx, source_id, external_id)
    }

    pub fn insert(
        &self,
        source_id: i64,
        doc: &NormalizedDocument,
        source_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<i64>> {
        insert_document(&self.tx, source_id, doc, source_updated_at, now)
    }

    pub fn update_content(
        &self,
        document_id: i64,
        doc: &NormalizedDocument,
        source_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        update_document_content(&self.tx, document_id, doc, source_updated_at, now)
    }

    pub fn touch(&self, document_id: i64, now: DateTime<Utc>) -> StorageResult<()> {
        touch_document(&self.tx, document_id, now)
    }

    pub fn link_disease(
        &self,
        document_id: i64,
        disease_id: i64,
        relevance: f64,
        confidence: f64,
    ) -> StorageResult<()> {
        link_document_disease(&self.tx, document_id, disease_id, relevance, confidence)
    }

    pub fn commit(self) -> StorageResult<()> {
        self.tx.commit()?;
        Ok(())
    }
}

fn find_document_version(
    conn: &Connection,
    source_id: i64,
    external_id: &str,
) -> StorageResult<Option<DocumentVersion>> {
    let version = conn
        .query_row(
            "SELECT id, source_updated_at FROM documents
             WHERE source_id = ?1 AND external_id = ?2",
            params![source_id, external_id],
            |row| {
                Ok(DocumentVersion {
                    id: row.get(0)?,
                    source_updated_at: parse_ts(1, &row.get::<_, String>(1)?)?,
                })
            },
        )
        .optional()?;
    Ok(version)
}

fn insert_document(
    conn: &Connection,
    source_id: i64,
    doc: &NormalizedDocument,
    source_updated_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> StorageResult<Option<i64>> {
    let changed = conn.execute(
        "INSERT INTO documents (source_id, external_id, url, title, content, summary, metadata,
            relevance_score, source_updated_at, updated_at, update_count, scraped_at,
            last_checked_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?10, ?10)
         ON CONFLICT(source_id, external_id) DO NOTHING",
        params![
            source_id,
            doc.external_id,
            doc.url,
            doc.title,
            doc.content,
            doc.summary,
            serde_json::to_string(&doc.metadata)?,
            doc.relevance_score,
            ts(source_updated_at),
            ts(now)
        ],
    )?;

    if changed == 0 {
        return Ok(None);
    }
    Ok(Some(conn.last_insert_rowid()))
}

fn update_document_content(
    conn: &Connection,
    document_id: i64,
    doc: &NormalizedDocument,
    source_updated_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> StorageResult<()> {
    let changed = conn.execute(
        "UPDATE documents SET url = ?1, title = ?2, content = ?3, summary = ?4, metadata = ?5,
            relevance_score = ?6, source_updated_at = ?7, updated_at = ?8,
            last_checked_at = ?8, update_count = update_count + 1
         WHERE id = ?9",
        params![
            doc.url,
            doc.title,
            doc.content,
            doc.summary,
            serde_json::to_string(&doc.metadata)?,
            doc.relevance_score,
            ts(source_updated_at),
            ts(now),
            document_id
        ],
    )?;
    if changed == 0 {
        return Err(StorageError::DocumentNotFound(document_id));
    }
    Ok(())
}

fn touch_document(conn: &Connection, document_id: i64, now: DateTime<Utc>) -> StorageResult<()> {
    let changed = conn.execute(
        "UPDATE documents SET last_checked_at = ?1 WHERE id = ?2",
        params![ts(now), document_id],
    )?;
    if changed == 0 {
        return Err(StorageError::DocumentNotFound(document_id));
    }
    Ok(())
}

fn link_document_disease(
    conn: &Connection,
    document_id: i64,
    disease_id: i64,
    relevance: f64,
    confidence: f64,
) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO document_diseases (document_id, disease_id, relevance, confidence)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(document_id, disease_id) DO NOTHING",
        params![document_id, disease_id, relevance, confidence],
    )?;
    Ok(())
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

fn parse_json<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn invalid_text(idx: usize, what: &str, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unknown {} '{}'", what, raw).into(),
    )
}

fn source_from_row(row: &Row<'_>) -> rusqlite::Result<SourceRecord> {
    let method: String = row.get(4)?;
    Ok(SourceRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        category: row.get(2)?,
        connector: row.get(3)?,
        association_method: AssociationMethod::from_db_string(&method)
            .ok_or_else(|| invalid_text(4, "association method", &method))?,
        rate_limit: row.get(5)?,
        is_active: row.get::<_, i64>(6)? != 0,
        config: parse_json(7, &row.get::<_, String>(7)?)?,
        crawl_state: parse_json(8, &row.get::<_, String>(8)?)?,
        last_crawled: parse_opt_ts(9, row.get(9)?)?,
        last_crawled_id: row.get(10)?,
    })
}

fn disease_from_row(row: &Row<'_>) -> rusqlite::Result<DiseaseRecord> {
    Ok(DiseaseRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        synonyms: parse_json(2, &row.get::<_, String>(2)?)?,
        category: row.get(3)?,
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<CrawlJobRecord> {
    let status: String = row.get(2)?;
    Ok(CrawlJobRecord {
        id: row.get(0)?,
        source_id: row.get(1)?,
        status: JobStatus::from_db_string(&status)
            .ok_or_else(|| invalid_text(2, "job status", &status))?,
        created_at: parse_ts(3, &row.get::<_, String>(3)?)?,
        started_at: parse_opt_ts(4, row.get(4)?)?,
        completed_at: parse_opt_ts(5, row.get(5)?)?,
        counters: JobCounters {
            documents_found: row.get::<_, i64>(6)? as u64,
            documents_processed: row.get::<_, i64>(7)? as u64,
            errors: row.get::<_, i64>(8)? as u64,
        },
        error_details: parse_json(9, &row.get::<_, String>(9)?)?,
        config: parse_json(10, &row.get::<_, String>(10)?)?,
    })
}

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<DocumentRecord> {
    Ok(DocumentRecord {
        id: row.get(0)?,
        source_id: row.get(1)?,
        external_id: row.get(2)?,
        url: row.get(3)?,
        title: row.get(4)?,
        content: row.get(5)?,
        summary: row.get(6)?,
        metadata: parse_json(7, &row.get::<_, String>(7)?)?,
        status: row.get(8)?,
        relevance_score: row.get(9)?,
        source_updated_at: parse_ts(10, &row.get::<_, String>(10)?)?,
        updated_at: parse_ts(11, &row.get::<_, String>(11)?)?,
        update_count: row.get(12)?,
        scraped_at: parse_ts(13, &row.get::<_, String>(13)?)?,
        last_checked_at: parse_ts(14, &row.get::<_, String>(14)?)?,
    })
}
