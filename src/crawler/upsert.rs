//! Versioned document writes
//!
//! Documents are keyed by (source, external id). A re-scraped document only
//! overwrites stored content when the source reports a newer version, or
//! reports no version at all.

use crate::connector::Extracted;
use crate::storage::{
    self, DocumentTransaction, DocumentVersion, SharedStorage, StorageError, StorageResult,
};
use chrono::{DateTime, Utc};
use tracing::debug;

/// What `decide` wants done with an incoming document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertDecision {
    Insert,
    /// Overwrite content of the existing document
    Update { id: i64 },
    /// Leave content alone; only mark the document as checked
    Skip { id: i64 },
}

/// Decides between insert, update and skip
///
/// An incoming timestamp equal to the stored one is not newer.
pub fn decide(
    existing: Option<DocumentVersion>,
    incoming: Option<DateTime<Utc>>,
) -> UpsertDecision {
    match (existing, incoming) {
        (None, _) => UpsertDecision::Insert,
        (Some(version), Some(at)) if at <= version.source_updated_at => {
            UpsertDecision::Skip { id: version.id }
        }
        (Some(version), _) => UpsertDecision::Update { id: version.id },
    }
}

/// What actually happened to a saved document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: i64,
    pub action: UpsertAction,
}

/// Saves extracted documents and links them to diseases
#[derive(Clone)]
pub struct DocumentUpsertEngine {
    storage: SharedStorage,
}

impl DocumentUpsertEngine {
    pub fn new(storage: SharedStorage) -> Self {
        Self { storage }
    }

    /// Inserts, updates or skips one document, then links it to every disease
    ///
    /// Linking happens on every path, so a document found again under a new
    /// disease gains that association even when its content is unchanged.
    /// The document write and its links commit together or not at all.
    pub fn save(
        &self,
        source_id: i64,
        extracted: &Extracted,
        disease_ids: &[i64],
    ) -> StorageResult<UpsertOutcome> {
        let now = Utc::now();
        let external_id = &extracted.document.external_id;
        let mut guard = storage::lock(&self.storage)?;
        let tx = guard.document_transaction()?;

        let outcome = match tx.find_version(source_id, external_id)? {
            Some(version) => apply_existing(&tx, version, extracted, now)?,
            None => {
                let stamp = extracted.source_updated_at.unwrap_or(now);
                let id = tx
                    .insert(source_id, &extracted.document, stamp, now)?
                    .ok_or_else(|| {
                        StorageError::Database(format!(
                            "document '{}' appeared during insert",
                            external_id
                        ))
                    })?;
                UpsertOutcome {
                    id,
                    action: UpsertAction::Inserted,
                }
            }
        };

        let relevance = extracted.document.relevance_score.unwrap_or(1.0);
        for &disease_id in disease_ids {
            tx.link_disease(outcome.id, disease_id, relevance, 1.0)?;
        }
        tx.commit()?;

        debug!(
            "Saved document '{}' of source {} as {}: {:?}",
            external_id, source_id, outcome.id, outcome.action
        );

        Ok(outcome)
    }
}

/// Update-or-skip path for a document that is already stored
fn apply_existing(
    tx: &DocumentTransaction<'_>,
    version: DocumentVersion,
    extracted: &Extracted,
    now: DateTime<Utc>,
) -> StorageResult<UpsertOutcome> {
    if let UpsertDecision::Skip { id } = decide(Some(version), extracted.source_updated_at) {
        tx.touch(id, now)?;
        return Ok(UpsertOutcome {
            id,
            action: UpsertAction::Unchanged,
        });
    }

    // Without a source timestamp the version still never moves backward
    let stamp = extracted
        .source_updated_at
        .unwrap_or(now)
        .max(version.source_updated_at);
    tx.update_content(version.id, &extracted.document, stamp, now)?;

    Ok(UpsertOutcome {
        id: version.id,
        action: UpsertAction::Updated,
    })
}
