//! Statistics generation from the document store
//!
//! This module provides functionality for extracting and displaying
//! ingestion statistics from the storage layer.

use crate::state::JobStatus;
use crate::storage::Storage;
use crate::CrawlError;
use std::collections::HashMap;

/// Ingestion statistics summary
#[derive(Debug, Clone)]
pub struct CrawlStatistics {
    /// Total number of stored documents
    pub total_documents: u64,

    /// Document counts per source name, largest first
    pub documents_by_source: Vec<(String, u64)>,

    /// Count of crawl jobs by status
    pub jobs_by_status: HashMap<JobStatus, u64>,

    /// Total number of document-disease links
    pub total_disease_links: u64,
}

impl CrawlStatistics {
    /// Total number of crawl jobs in any state
    pub fn total_jobs(&self) -> u64 {
        self.jobs_by_status.values().sum()
    }
}

/// Loads statistics from storage
///
/// # Arguments
///
/// * `storage` - The storage backend to query
///
/// # Returns
///
/// * `Ok(CrawlStatistics)` - Successfully loaded statistics
/// * `Err(CrawlError)` - Failed to query statistics
pub fn load_statistics(storage: &dyn Storage) -> Result<CrawlStatistics, CrawlError> {
    Ok(CrawlStatistics {
        total_documents: storage.count_documents(None)?,
        documents_by_source: storage.count_documents_by_source()?,
        jobs_by_status: storage.count_jobs_by_status()?,
        total_disease_links: storage.count_document_links()?,
    })
}

/// Prints statistics to stdout in a formatted manner
///
/// # Arguments
///
/// * `stats` - The statistics to display
pub fn print_statistics(stats: &CrawlStatistics) {
    println!("=== Ingestion Statistics ===\n");

    println!("Overview:");
    println!("  Total documents: {}", stats.total_documents);
    println!("  Disease links: {}", stats.total_disease_links);
    println!("  Crawl jobs: {}", stats.total_jobs());
    println!();

    println!("Documents by Source:");
    for (source, count) in &stats.documents_by_source {
        let percentage = if stats.total_documents > 0 {
            (*count as f64 / stats.total_documents as f64) * 100.0
        } else {
            0.0
        };
        println!("  {}: {} ({:.1}%)", source, count, percentage);
    }
    println!();

    println!("Jobs by Status:");
    for status in JobStatus::all_states() {
        if let Some(count) = stats.jobs_by_status.get(&status) {
            println!("  {}: {}", status, count);
        }
    }
    println!();

    let completed = stats
        .jobs_by_status
        .get(&JobStatus::Completed)
        .copied()
        .unwrap_or(0);
    let finished: u64 = stats
        .jobs_by_status
        .iter()
        .filter(|(status, _)| status.is_terminal())
        .map(|(_, count)| count)
        .sum();
    let success_rate = if finished > 0 {
        (completed as f64 / finished as f64) * 100.0
    } else {
        0.0
    };

    println!(
        "Success Rate: {:.1}% ({} / {} finished jobs completed)",
        success_rate, completed, finished
    );
}
