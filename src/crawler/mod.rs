//! Crawl engine
//!
//! This module contains the runtime that drives connectors, including:
//! - Per-source rate limiting
//! - Resumable per-term cursors
//! - Crawl job lifecycle tracking
//! - Versioned document upserts
//! - Overall scrape orchestration

mod cursor;
mod job;
mod orchestrator;
mod rate_limiter;
mod upsert;

pub use cursor::{CursorStore, TermCursor};
pub use job::{cancel_job, reap_stale_jobs, JobLifecycle, FATAL_CONTEXT};
pub use orchestrator::{Orchestrator, OrchestratorSettings, ScrapeOutcome, ScrapeRequest};
pub use rate_limiter::RateLimiter;
pub use upsert::{decide, DocumentUpsertEngine, UpsertAction, UpsertDecision, UpsertOutcome};
