use crate::storage::AssociationMethod;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Main configuration structure for Malady-Crawl
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(rename = "user-agent")]
    pub user_agent: UserAgentConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub disease: Vec<DiseaseEntry>,
    #[serde(default)]
    pub source: Vec<SourceEntry>,
}

/// Crawler behavior configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlerConfig {
    /// Calls per second used when a source entry does not set one
    #[serde(rename = "default-rate-limit", default = "default_rate_limit")]
    pub default_rate_limit: f64,

    /// Number of processed items between job counter flushes
    #[serde(rename = "progress-flush-every", default = "default_flush_every")]
    pub progress_flush_every: u64,

    /// Running jobs older than this are force-failed by the reaper
    #[serde(rename = "stale-job-minutes", default = "default_stale_minutes")]
    pub stale_job_minutes: u64,
}

fn default_rate_limit() -> f64 {
    1.0
}

fn default_flush_every() -> u64 {
    10
}

fn default_stale_minutes() -> u64 {
    120
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            default_rate_limit: default_rate_limit(),
            progress_flush_every: default_flush_every(),
            stale_job_minutes: default_stale_minutes(),
        }
    }
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentConfig {
    /// Name of the crawler
    #[serde(rename = "crawler-name")]
    pub crawler_name: String,

    /// Version of the crawler
    #[serde(rename = "crawler-version")]
    pub crawler_version: String,

    /// URL with information about the crawler
    #[serde(rename = "contact-url")]
    pub contact_url: String,

    /// Email address for crawler-related contact
    #[serde(rename = "contact-email")]
    pub contact_email: String,
}

impl UserAgentConfig {
    /// Formats the header value: `CrawlerName/Version (+ContactURL; ContactEmail)`
    pub fn header_value(&self) -> String {
        format!(
            "{}/{} (+{}; {})",
            self.crawler_name, self.crawler_version, self.contact_url, self.contact_email
        )
    }
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,
}

/// Reference disease entry
#[derive(Debug, Clone, Deserialize)]
pub struct DiseaseEntry {
    pub name: String,

    #[serde(default)]
    pub synonyms: Vec<String>,

    pub category: Option<String>,
}

/// Source catalog entry
#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    /// Unique source name
    pub name: String,

    pub category: Option<String>,

    /// Registry key of the connector that scrapes this source
    pub connector: String,

    #[serde(rename = "association-method")]
    pub association_method: AssociationMethod,

    /// Calls per second; falls back to `crawler.default-rate-limit`
    #[serde(rename = "rate-limit")]
    pub rate_limit: Option<f64>,

    /// Connector defaults, lowest precedence in option resolution
    #[serde(default)]
    pub config: Map<String, Value>,

    /// Disease names a linked source covers
    #[serde(rename = "linked-diseases", default)]
    pub linked_diseases: Vec<String>,
}
