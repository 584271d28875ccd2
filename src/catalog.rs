//! Disease and source catalog management
//!
//! The configuration file is the source of truth for the catalog. Syncing
//! upserts by unique name, so it is safe to run on every start.

use crate::config::Config;
use crate::storage::{self, NewSource, SharedStorage, SourceRetirement, Storage, StorageError};
use crate::{CrawlError, Result};
use std::collections::HashMap;
use tracing::{debug, info};

/// Counts of what a catalog sync touched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogSummary {
    pub diseases: usize,
    pub sources: usize,
    pub links: usize,
}

/// Upserts configured diseases, sources and linked-disease sets
pub fn sync_catalog(storage: &SharedStorage, config: &Config) -> Result<CatalogSummary> {
    let mut guard = storage::lock(storage)?;
    let mut summary = CatalogSummary::default();
    let mut disease_ids: HashMap<String, i64> = HashMap::new();

    for entry in &config.disease {
        let name = entry.name.trim();
        let id = guard.upsert_disease(name, &entry.synonyms, entry.category.as_deref())?;
        disease_ids.insert(name.to_lowercase(), id);
        summary.diseases += 1;
    }

    for entry in &config.source {
        let source_id = guard.upsert_source(&NewSource {
            name: entry.name.clone(),
            category: entry.category.clone(),
            connector: entry.connector.clone(),
            association_method: entry.association_method,
            rate_limit: entry
                .rate_limit
                .unwrap_or(config.crawler.default_rate_limit),
            config: entry.config.clone(),
        })?;
        summary.sources += 1;

        for disease in &entry.linked_diseases {
            let key = disease.trim().to_lowercase();
            let disease_id = match disease_ids.get(&key) {
                Some(id) => *id,
                // Not in this config file but possibly already in the store
                None => guard
                    .find_diseases_by_names(&[disease.clone()])?
                    .first()
                    .map(|d| d.id)
                    .ok_or_else(|| {
                        crate::ConfigError::Validation(format!(
                            "Source '{}' links unknown disease '{}'",
                            entry.name, disease
                        ))
                    })?,
            };
            guard.link_source_disease(source_id, disease_id)?;
            summary.links += 1;
        }

        debug!("Synced source '{}' as {}", entry.name, source_id);
    }

    info!(
        "Catalog synced: {} disease(s), {} source(s), {} link(s)",
        summary.diseases, summary.sources, summary.links
    );
    Ok(summary)
}

/// Deletes a source without documents, deactivates one with documents
pub fn retire_source(storage: &SharedStorage, source_id: i64) -> Result<SourceRetirement> {
    let outcome = storage::lock(storage)?
        .retire_source(source_id)
        .map_err(|e| match e {
            StorageError::SourceNotFound(id) => CrawlError::SourceNotFound(id),
            other => other.into(),
        })?;

    match outcome {
        SourceRetirement::Deleted => info!("Source {} deleted", source_id),
        SourceRetirement::Deactivated => {
            info!("Source {} has documents and was deactivated", source_id)
        }
    }
    Ok(outcome)
}
