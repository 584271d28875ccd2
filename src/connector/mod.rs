//! Source connector contract
//!
//! A connector knows how to talk to one kind of external source. The
//! orchestrator drives every connector the same way: `search` for raw items,
//! optionally `fetch_details` for each, then `extract` a normalized document.

mod http;
mod json_api;
mod registry;

pub use http::build_http_client;
pub use json_api::JsonApiConnector;
pub use registry::ConnectorRegistry;

use crate::config::ConfigResolver;
use crate::crawler::{RateLimiter, TermCursor};
use crate::storage::{NormalizedDocument, SourceRecord, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

/// Cursor key and search term used for a wholesale pass over a linked source
pub const WHOLESALE_TERM: &str = "*";

/// Errors raised by connectors
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Invalid payload: {0}")]
    Payload(String),

    #[error("Missing field: {0}")]
    MissingField(String),

    #[error("Missing connector option: {0}")]
    MissingOption(String),

    #[error("Cursor error: {0}")]
    Cursor(#[from] StorageError),

    #[error("{0}")]
    Other(String),
}

/// Result type for connector operations
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// An item as returned by a source, before normalization
#[derive(Debug, Clone, PartialEq)]
pub struct RawItem {
    /// Stable identifier in the external system (may be empty if unknown)
    pub external_id: String,
    /// Connector-defined payload
    pub payload: Value,
}

impl RawItem {
    pub fn new(external_id: impl Into<String>, payload: Value) -> Self {
        Self {
            external_id: external_id.into(),
            payload,
        }
    }
}

/// Output of `Connector::extract`
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub document: NormalizedDocument,
    /// When the source last changed this item, if it says
    pub source_updated_at: Option<DateTime<Utc>>,
}

/// Everything a connector needs for one unit of work
pub struct SearchContext<'a> {
    pub source: &'a SourceRecord,
    /// Disease term, or `WHOLESALE_TERM` for linked sources
    pub term: &'a str,
    /// Only items changed after this instant are wanted (incremental runs)
    pub since: Option<DateTime<Utc>>,
    pub resolver: &'a ConfigResolver,
    pub limiter: &'a RateLimiter,
    /// Resume state for this (source, term) pair
    pub cursor: TermCursor,
}

impl SearchContext<'_> {
    /// Waits for the source's rate limiter; call before every outbound request
    pub async fn throttle(&self) {
        self.limiter.acquire().await;
    }

    /// True for the single unit of a linked source
    pub fn is_wholesale(&self) -> bool {
        self.term == WHOLESALE_TERM
    }
}

/// A source connector
#[async_trait]
pub trait Connector: Send + Sync {
    /// Registry key; matches `SourceRecord::connector`
    fn kind(&self) -> &'static str;

    /// Returns raw items for `term`, recording cursor progress as pages are consumed
    ///
    /// Cursor writes are staged and only committed after the returned items
    /// are stored; an error discards them.
    async fn search(&self, ctx: &SearchContext<'_>, term: &str) -> ConnectorResult<Vec<RawItem>>;

    /// Fetches a fuller payload for one item; `None` keeps the search payload
    async fn fetch_details(
        &self,
        _ctx: &SearchContext<'_>,
        _external_id: &str,
    ) -> ConnectorResult<Option<RawItem>> {
        Ok(None)
    }

    /// Normalizes one raw item
    fn extract(&self, raw: &RawItem) -> ConnectorResult<Extracted>;
}
