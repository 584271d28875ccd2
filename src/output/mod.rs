//! Output module for reporting on the document store
//!
//! This module handles loading and printing ingestion statistics.

pub mod stats;

pub use stats::{load_statistics, print_statistics, CrawlStatistics};
