//! Per-(source, term) resume state backed by `sources.crawl_state`
//!
//! Every write merges into the stored bag. Offsets and the newest-seen
//! timestamp only move forward; `reset` is the one way back.
//!
//! Connectors work through a `TermCursor`, which stages its writes in memory.
//! The orchestrator commits them once the unit's items are stored, so a unit
//! that fails partway leaves the stored cursor where the last stored item was.

use crate::state::{CursorBag, CursorPhase};
use crate::storage::{self, SharedStorage, Storage, StorageError, StorageResult};
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard};

/// A typed cursor transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorStep {
    Advance(u64),
    Observe(DateTime<Utc>),
    Exhaust,
}

impl CursorStep {
    fn apply(self, phase: CursorPhase) -> CursorPhase {
        match self {
            Self::Advance(offset) => phase.advance(offset),
            Self::Observe(seen) => phase.observe(seen),
            Self::Exhaust => phase.exhaust(),
        }
    }
}

fn replay(steps: &[CursorStep], phase: CursorPhase) -> CursorPhase {
    steps.iter().fold(phase, |phase, step| step.apply(phase))
}

/// Cursor bags of one source
#[derive(Clone)]
pub struct CursorStore {
    storage: SharedStorage,
    source_id: i64,
}

impl CursorStore {
    pub fn new(storage: SharedStorage, source_id: i64) -> Self {
        Self { storage, source_id }
    }

    /// Bag stored under `key`, empty if none
    pub fn get(&self, key: &str) -> StorageResult<CursorBag> {
        storage::lock(&self.storage)?.get_cursor(self.source_id, key)
    }

    /// Merges `fields` into the bag under `key` and returns the merged bag
    pub fn save(&self, key: &str, fields: CursorBag) -> StorageResult<CursorBag> {
        storage::lock(&self.storage)?.merge_cursor(self.source_id, key, &fields)
    }

    /// Flags the backfill under `key` as complete
    pub fn mark_exhausted(&self, key: &str) -> StorageResult<CursorPhase> {
        self.transition(key, &[CursorStep::Exhaust], &CursorBag::new())
    }

    /// Moves the stored offset to `offset` unless it is already further along
    pub fn advance_offset(&self, key: &str, offset: u64) -> StorageResult<CursorPhase> {
        self.transition(key, &[CursorStep::Advance(offset)], &CursorBag::new())
    }

    /// Keeps the newer of the stored and the observed source timestamp
    pub fn record_newest_seen(&self, key: &str, seen: DateTime<Utc>) -> StorageResult<CursorPhase> {
        self.transition(key, &[CursorStep::Observe(seen)], &CursorBag::new())
    }

    /// Clears the bag under `key`
    pub fn reset(&self, key: &str) -> StorageResult<()> {
        storage::lock(&self.storage)?.reset_cursor(self.source_id, key)
    }

    /// Typed view over the bag under `key`
    pub fn phase(&self, key: &str) -> StorageResult<CursorPhase> {
        Ok(CursorPhase::from_bag(&self.get(key)?))
    }

    /// Handle bound to one cursor key, staging its writes until `commit`
    pub fn for_term(&self, key: impl Into<String>) -> TermCursor {
        TermCursor {
            store: self.clone(),
            key: key.into(),
            staged: Mutex::new(Staged::default()),
        }
    }

    /// Replays `steps` on the stored phase and merges the result with `fields`
    ///
    /// Runs under one storage lock, so steps apply to the latest stored state
    /// even when another run moved the cursor in the meantime.
    fn transition(
        &self,
        key: &str,
        steps: &[CursorStep],
        fields: &CursorBag,
    ) -> StorageResult<CursorPhase> {
        let mut guard = storage::lock(&self.storage)?;
        let bag = guard.get_cursor(self.source_id, key)?;

        let current = CursorPhase::from_bag(&bag);
        let next = replay(steps, current.clone());

        let mut update = fields.clone();
        if next != current {
            update.extend(next.to_bag());
        }
        if !update.is_empty() {
            guard.merge_cursor(self.source_id, key, &update)?;
        }
        Ok(next)
    }
}

#[derive(Debug, Default)]
struct Staged {
    steps: Vec<CursorStep>,
    fields: CursorBag,
}

impl Staged {
    fn is_empty(&self) -> bool {
        self.steps.is_empty() && self.fields.is_empty()
    }
}

/// A `CursorStore` bound to one key, handed to connectors
///
/// Reads see the stored bag with staged writes applied on top.
pub struct TermCursor {
    store: CursorStore,
    key: String,
    staged: Mutex<Staged>,
}

impl TermCursor {
    pub fn key(&self) -> &str {
        &self.key
    }

    fn staged(&self) -> StorageResult<MutexGuard<'_, Staged>> {
        self.staged.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn stage(&self, step: CursorStep) -> StorageResult<CursorPhase> {
        self.staged()?.steps.push(step);
        self.phase()
    }

    pub fn get(&self) -> StorageResult<CursorBag> {
        let mut bag = self.store.get(&self.key)?;
        let staged = self.staged()?;
        bag.extend(staged.fields.clone());

        let stored = CursorPhase::from_bag(&bag);
        let next = replay(&staged.steps, stored.clone());
        if next != stored {
            bag.extend(next.to_bag());
        }
        Ok(bag)
    }

    /// Stages connector-specific fields
    pub fn save(&self, fields: CursorBag) -> StorageResult<CursorBag> {
        self.staged()?.fields.extend(fields);
        self.get()
    }

    pub fn mark_exhausted(&self) -> StorageResult<CursorPhase> {
        self.stage(CursorStep::Exhaust)
    }

    pub fn advance_offset(&self, offset: u64) -> StorageResult<CursorPhase> {
        self.stage(CursorStep::Advance(offset))
    }

    pub fn record_newest_seen(&self, seen: DateTime<Utc>) -> StorageResult<CursorPhase> {
        self.stage(CursorStep::Observe(seen))
    }

    /// Drops staged writes and clears the stored bag
    pub fn reset(&self) -> StorageResult<()> {
        *self.staged()? = Staged::default();
        self.store.reset(&self.key)
    }

    pub fn phase(&self) -> StorageResult<CursorPhase> {
        Ok(CursorPhase::from_bag(&self.get()?))
    }

    /// Writes staged changes through to storage
    pub fn commit(&self) -> StorageResult<CursorPhase> {
        let staged = std::mem::take(&mut *self.staged()?);
        if staged.is_empty() {
            return self.store.phase(&self.key);
        }
        self.store.transition(&self.key, &staged.steps, &staged.fields)
    }
}
