//! Malady-Crawl: incremental ingestion of disease literature
//!
//! This crate implements the crawl orchestration engine that drives many
//! independently written source connectors (literature databases, trial
//! registries, adverse-event feeds, forums) into one normalized document store,
//! with rate limiting, resumable cursors, job tracking and versioned upserts.

pub mod catalog;
pub mod config;
pub mod connector;
pub mod crawler;
pub mod output;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Main error type for Malady-Crawl operations
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connector error: {0}")]
    Connector(#[from] connector::ConnectorError),

    #[error("Source not found: {0}")]
    SourceNotFound(i64),

    #[error("Source {0} is inactive")]
    SourceInactive(i64),

    #[error("No connector registered for kind '{0}'")]
    UnknownConnector(String),

    #[error("Invalid job transition: {from} -> {to}")]
    InvalidTransition {
        from: state::JobStatus,
        to: state::JobStatus,
    },

    #[error("Crawl job not found: {0}")]
    JobNotFound(i64),

    #[error("Crawl job {0} is not pending and cannot be adopted")]
    JobNotAdoptable(i64),

    #[error("All {units} unit(s) of work failed; last error: {last_error}")]
    AllUnitsFailed { units: usize, last_error: String },

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for Malady-Crawl operations
pub type Result<T> = std::result::Result<T, CrawlError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::{Config, ConfigResolver};
pub use connector::{Connector, ConnectorRegistry, Extracted, RawItem, SearchContext};
pub use crawler::{Orchestrator, ScrapeOutcome, ScrapeRequest};
pub use state::{CursorPhase, JobStatus};
pub use storage::{AssociationMethod, NormalizedDocument, SqliteStorage};
