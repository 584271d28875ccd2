//! Crawl orchestration
//!
//! The orchestrator turns a scrape request into units of work and drives a
//! connector through each of them:
//!
//! 1. Resolve the source and its connector
//! 2. Plan units: one per disease term for search sources, one wholesale pass
//!    for linked sources
//! 3. Create or adopt the crawl job and mark it running
//! 4. Per unit: search, then fetch details, extract and upsert each item
//! 5. Finalize the job and stamp the source

use crate::config::{ConfigResolver, CrawlerConfig, Options};
use crate::connector::{
    Connector, ConnectorError, ConnectorRegistry, RawItem, SearchContext, WHOLESALE_TERM,
};
use crate::crawler::cursor::CursorStore;
use crate::crawler::job::JobLifecycle;
use crate::crawler::rate_limiter::RateLimiter;
use crate::crawler::upsert::{DocumentUpsertEngine, UpsertOutcome};
use crate::state::JobStatus;
use crate::storage::{
    self, AssociationMethod, DiseaseRecord, SharedStorage, SourceRecord, SqliteStorage, Storage,
    StorageError,
};
use crate::{CrawlError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Parameters of one scrape call
#[derive(Debug, Clone, Default)]
pub struct ScrapeRequest {
    /// Diseases the documents should be associated with
    pub disease_ids: Vec<i64>,
    /// Search terms; derived from disease names when empty
    pub disease_terms: Vec<String>,
    /// Runtime connector options, highest precedence
    pub options: Options,
    /// Pre-created pending job to adopt instead of creating one
    pub job_id: Option<i64>,
}

/// Result of a scrape call
///
/// `job_id` is `None` when there was no work and no job was created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapeOutcome {
    pub job_id: Option<i64>,
    pub status: Option<JobStatus>,
    pub documents_found: u64,
    pub documents_processed: u64,
    pub errors: u64,
}

/// Tunables passed to the orchestrator at construction
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Items between job counter flushes
    pub progress_flush_every: u64,
    /// Hash of the configuration file, recorded in job snapshots
    pub config_hash: Option<String>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            progress_flush_every: 10,
            config_hash: None,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &CrawlerConfig, config_hash: Option<String>) -> Self {
        Self {
            progress_flush_every: config.progress_flush_every,
            config_hash,
        }
    }
}

/// One unit of work: a search term and the diseases its documents belong to
#[derive(Debug, Clone, PartialEq, Eq)]
struct WorkUnit {
    term: String,
    disease_ids: Vec<i64>,
}

/// Drives connectors through scrape runs
#[derive(Clone)]
pub struct Orchestrator {
    storage: SharedStorage,
    registry: Arc<ConnectorRegistry>,
    upsert: DocumentUpsertEngine,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        storage: SharedStorage,
        registry: Arc<ConnectorRegistry>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            upsert: DocumentUpsertEngine::new(storage.clone()),
            storage,
            registry,
            settings,
        }
    }

    /// Full scrape of one source
    pub async fn scrape(&self, source_id: i64, request: ScrapeRequest) -> Result<ScrapeOutcome> {
        self.run(source_id, request, None).await
    }

    /// Scrape of items changed since the source's last successful crawl
    ///
    /// Behaves as a full scrape when the source was never crawled.
    pub async fn scrape_incremental(
        &self,
        source_id: i64,
        request: ScrapeRequest,
    ) -> Result<ScrapeOutcome> {
        let since = self.load_source(source_id)?.last_crawled;
        if let Some(since) = since {
            debug!("Incremental scrape of source {} since {}", source_id, since);
        }
        self.run(source_id, request, since).await
    }

    fn load_source(&self, source_id: i64) -> Result<SourceRecord> {
        storage::lock(&self.storage)?
            .get_source(source_id)
            .map_err(|e| match e {
                StorageError::SourceNotFound(id) => CrawlError::SourceNotFound(id),
                other => other.into(),
            })
    }

    async fn run(
        &self,
        source_id: i64,
        request: ScrapeRequest,
        since: Option<DateTime<Utc>>,
    ) -> Result<ScrapeOutcome> {
        let source = self.load_source(source_id)?;
        if !source.is_active {
            return Err(CrawlError::SourceInactive(source_id));
        }
        let connector = self
            .registry
            .get(&source.connector)
            .ok_or_else(|| CrawlError::UnknownConnector(source.connector.clone()))?;

        let units = self.plan_units(&source, &request)?;
        if units.is_empty() {
            info!(
                "Nothing to scrape for source '{}' with the requested diseases",
                source.name
            );
            return Ok(ScrapeOutcome::default());
        }

        // Options persisted on an adopted job sit between runtime options and
        // the source defaults
        let snapshot_options = match request.job_id {
            Some(job_id) => self.snapshot_options(job_id)?,
            None => Options::new(),
        };
        let mut persisted_options = snapshot_options.clone();
        for (key, value) in &request.options {
            persisted_options.insert(key.clone(), value.clone());
        }

        let snapshot = self.snapshot(&source, &units, &persisted_options, since);
        let flush_every = self.settings.progress_flush_every;
        let mut job = match request.job_id {
            Some(job_id) => JobLifecycle::adopt(
                self.storage.clone(),
                job_id,
                source_id,
                &snapshot,
                flush_every,
            )?,
            None => JobLifecycle::create(self.storage.clone(), source_id, &snapshot, flush_every)?,
        };

        let resolver = ConfigResolver::new(request.options, snapshot_options, source.config.clone());

        info!(
            "Scraping source '{}' ({} unit(s), job {})",
            source.name,
            units.len(),
            job.id()
        );

        let started = Utc::now();
        let result = match job.start() {
            Ok(true) => {
                self.run_units(connector.as_ref(), &source, &units, since, &resolver, &mut job)
                    .await
            }
            Ok(false) => {
                info!(
                    "Crawl job {} was {} before it started",
                    job.id(),
                    job.status()
                );
                return Ok(outcome(&job));
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => self.finalize(&source, &mut job, started),
            Err(e) => {
                error!("Crawl job {} failed: {}", job.id(), e);
                if let Err(fail_error) = job.fail(&e) {
                    error!(
                        "Could not mark crawl job {} as failed: {}",
                        job.id(),
                        fail_error
                    );
                }
                Err(e)
            }
        }
    }

    /// Splits a request into units of work
    fn plan_units(&self, source: &SourceRecord, request: &ScrapeRequest) -> Result<Vec<WorkUnit>> {
        let guard = storage::lock(&self.storage)?;

        let terms = clean_terms(&request.disease_terms);
        let mut requested: Vec<i64> = dedup_ids(&request.disease_ids);

        match source.association_method {
            AssociationMethod::Linked => {
                let linked = guard.linked_disease_ids(source.id)?;
                if requested.is_empty() && !terms.is_empty() {
                    requested = guard
                        .find_diseases_by_names(&terms)?
                        .into_iter()
                        .map(|d| d.id)
                        .collect();
                } else if requested.is_empty() {
                    requested = linked.clone();
                }

                let active: Vec<i64> = requested
                    .into_iter()
                    .filter(|id| linked.contains(id))
                    .collect();
                if active.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(vec![WorkUnit {
                    term: WHOLESALE_TERM.to_string(),
                    disease_ids: active,
                }])
            }
            AssociationMethod::Search => {
                let diseases = known_diseases(&guard, &requested)?;
                if !terms.is_empty() && !diseases.is_empty() {
                    // Explicit terms and diseases: every term serves every disease
                    return Ok(terms
                        .into_iter()
                        .map(|term| WorkUnit {
                            term,
                            disease_ids: diseases.iter().map(|d| d.id).collect(),
                        })
                        .collect());
                }

                if !terms.is_empty() {
                    let named = guard.find_diseases_by_names(&terms)?;
                    return Ok(terms
                        .into_iter()
                        .map(|term| {
                            let disease_ids = named
                                .iter()
                                .filter(|d| d.name.eq_ignore_ascii_case(&term))
                                .map(|d| d.id)
                                .collect();
                            WorkUnit { term, disease_ids }
                        })
                        .collect());
                }

                let mut units: Vec<WorkUnit> = Vec::new();
                for disease in diseases {
                    match units
                        .iter_mut()
                        .find(|u| u.term.eq_ignore_ascii_case(&disease.name))
                    {
                        Some(unit) => unit.disease_ids.push(disease.id),
                        None => units.push(WorkUnit {
                            term: disease.name,
                            disease_ids: vec![disease.id],
                        }),
                    }
                }
                Ok(units)
            }
        }
    }

    fn snapshot_options(&self, job_id: i64) -> Result<Options> {
        let job = storage::lock(&self.storage)?
            .get_job(job_id)
            .map_err(|e| match e {
                StorageError::JobNotFound(id) => CrawlError::JobNotFound(id),
                other => other.into(),
            })?;
        Ok(job
            .config
            .get("options")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default())
    }

    fn snapshot(
        &self,
        source: &SourceRecord,
        units: &[WorkUnit],
        options: &Options,
        since: Option<DateTime<Utc>>,
    ) -> Value {
        let mut disease_ids: Vec<i64> = units
            .iter()
            .flat_map(|u| u.disease_ids.iter().copied())
            .collect();
        disease_ids.sort_unstable();
        disease_ids.dedup();
        let terms: Vec<&str> = units.iter().map(|u| u.term.as_str()).collect();

        json!({
            "association_method": source.association_method,
            "disease_ids": disease_ids,
            "disease_terms": terms,
            "options": options,
            "since": since.map(|s| s.to_rfc3339_opts(SecondsFormat::Micros, true)),
            "config_hash": self.settings.config_hash,
        })
    }

    async fn run_units(
        &self,
        connector: &dyn Connector,
        source: &SourceRecord,
        units: &[WorkUnit],
        since: Option<DateTime<Utc>>,
        resolver: &ConfigResolver,
        job: &mut JobLifecycle,
    ) -> Result<()> {
        let limiter = RateLimiter::new(source.rate_limit);
        let cursors = CursorStore::new(self.storage.clone(), source.id);

        let mut units_run = 0usize;
        let mut units_failed = 0usize;
        let mut last_unit_error: Option<String> = None;

        for unit in units {
            if job.is_cancelled()? || job.is_finished() {
                info!(
                    "Crawl job {} is {}, stopping before '{}'",
                    job.id(),
                    job.status(),
                    unit.term
                );
                return Ok(());
            }

            let ctx = SearchContext {
                source,
                term: &unit.term,
                since,
                resolver,
                limiter: &limiter,
                cursor: cursors.for_term(unit.term.as_str()),
            };

            units_run += 1;
            info!("Searching '{}' on source '{}'", unit.term, source.name);
            let items = match connector.search(&ctx, &unit.term).await {
                Ok(items) => items,
                Err(e) => {
                    units_failed += 1;
                    last_unit_error = Some(e.to_string());
                    job.error(format!("search:{}", unit.term), &e)?;
                    continue;
                }
            };

            debug!("'{}' returned {} item(s)", unit.term, items.len());
            job.found(items.len() as u64);

            for raw in items {
                let context = format!("item:{}/{}", unit.term, raw.external_id);
                match self
                    .process_item(connector, &ctx, raw, &unit.disease_ids)
                    .await
                {
                    Ok(_) => job.processed()?,
                    Err(e) => job.error(context, e)?,
                }
            }

            // Cursor progress lands only once the items behind it are stored
            let phase = ctx.cursor.commit()?;
            debug!("Cursor '{}' is now {:?}", unit.term, phase);
            job.flush()?;
        }

        if units_run > 0 && units_failed == units_run {
            return Err(CrawlError::AllUnitsFailed {
                units: units_run,
                last_error: last_unit_error.unwrap_or_default(),
            });
        }

        Ok(())
    }

    /// Details, extract and upsert for one raw item
    async fn process_item(
        &self,
        connector: &dyn Connector,
        ctx: &SearchContext<'_>,
        raw: RawItem,
        disease_ids: &[i64],
    ) -> Result<UpsertOutcome> {
        let raw = if raw.external_id.is_empty() {
            raw
        } else {
            match connector.fetch_details(ctx, &raw.external_id).await? {
                Some(detailed) => detailed,
                None => raw,
            }
        };

        let extracted = connector.extract(&raw)?;
        if extracted.document.external_id.trim().is_empty() {
            return Err(ConnectorError::MissingField("external_id".to_string()).into());
        }

        Ok(self.upsert.save(ctx.source.id, &extracted, disease_ids)?)
    }

    fn finalize(
        &self,
        source: &SourceRecord,
        job: &mut JobLifecycle,
        started: DateTime<Utc>,
    ) -> Result<ScrapeOutcome> {
        if job.is_finished() {
            return Ok(outcome(job));
        }

        if job.complete()? {
            storage::lock(&self.storage)?.mark_source_crawled(source.id, job.id(), started)?;
        }
        Ok(outcome(job))
    }
}

fn outcome(job: &JobLifecycle) -> ScrapeOutcome {
    let counters = job.counters();
    ScrapeOutcome {
        job_id: Some(job.id()),
        status: Some(job.status()),
        documents_found: counters.documents_found,
        documents_processed: counters.documents_processed,
        errors: counters.errors,
    }
}

/// Trims terms and drops empty and case-insensitive duplicate ones
fn clean_terms(terms: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    terms
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty() && seen.insert(t.to_lowercase()))
        .map(str::to_string)
        .collect()
}

/// Looks up requested diseases, skipping unknown ids with a warning
fn known_diseases(storage: &SqliteStorage, ids: &[i64]) -> Result<Vec<DiseaseRecord>> {
    let mut diseases = Vec::with_capacity(ids.len());
    for &disease_id in ids {
        match storage.get_disease(disease_id) {
            Ok(disease) => diseases.push(disease),
            Err(StorageError::DiseaseNotFound(id)) => {
                warn!("Requested disease {} does not exist", id);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(diseases)
}

fn dedup_ids(ids: &[i64]) -> Vec<i64> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}
