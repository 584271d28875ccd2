//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the Malady-Crawl database.
//! Timestamps are stored as fixed-width RFC 3339 UTC strings so that they
//! compare correctly as text.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Reference diseases
CREATE TABLE IF NOT EXISTS diseases (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE COLLATE NOCASE,
    synonyms TEXT NOT NULL DEFAULT '[]',
    category TEXT
);

-- External data providers
CREATE TABLE IF NOT EXISTS sources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    category TEXT,
    connector TEXT NOT NULL,
    association_method TEXT NOT NULL,
    rate_limit REAL NOT NULL DEFAULT 1.0,
    is_active INTEGER NOT NULL DEFAULT 1,
    config TEXT NOT NULL DEFAULT '{}',
    crawl_state TEXT NOT NULL DEFAULT '{}',
    last_crawled TEXT,
    last_crawled_id INTEGER
);

-- Fixed source-to-disease mapping for linked sources
CREATE TABLE IF NOT EXISTS source_diseases (
    source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
    disease_id INTEGER NOT NULL REFERENCES diseases(id) ON DELETE CASCADE,
    PRIMARY KEY (source_id, disease_id)
);

-- One row per crawl execution
CREATE TABLE IF NOT EXISTS crawl_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    documents_found INTEGER NOT NULL DEFAULT 0,
    documents_processed INTEGER NOT NULL DEFAULT 0,
    errors INTEGER NOT NULL DEFAULT 0,
    error_details TEXT NOT NULL DEFAULT '[]',
    config TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_crawl_jobs_source ON crawl_jobs(source_id);
CREATE INDEX IF NOT EXISTS idx_crawl_jobs_status ON crawl_jobs(status);

-- Normalized documents, unique per (source, external id)
CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id INTEGER NOT NULL REFERENCES sources(id),
    external_id TEXT NOT NULL,
    url TEXT,
    title TEXT NOT NULL,
    content TEXT,
    summary TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    status TEXT NOT NULL DEFAULT 'active',
    relevance_score REAL,
    source_updated_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    update_count INTEGER NOT NULL DEFAULT 0,
    scraped_at TEXT NOT NULL,
    last_checked_at TEXT NOT NULL,
    UNIQUE(source_id, external_id)
);

CREATE INDEX IF NOT EXISTS idx_documents_last_checked ON documents(last_checked_at);

-- Document-to-disease associations
CREATE TABLE IF NOT EXISTS document_diseases (
    document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    disease_id INTEGER NOT NULL REFERENCES diseases(id) ON DELETE CASCADE,
    relevance REAL NOT NULL DEFAULT 1.0,
    confidence REAL NOT NULL DEFAULT 1.0,
    PRIMARY KEY (document_id, disease_id)
);

CREATE INDEX IF NOT EXISTS idx_document_diseases_disease ON document_diseases(disease_id);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
