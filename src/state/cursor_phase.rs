//! Resume state for one (source, search term) pair
//!
//! A cursor starts out backfilling: walking pages of history from wherever the
//! previous run stopped. Once a connector reaches the end of available history
//! the cursor is exhausted and later runs only tail items newer than the last
//! one seen.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

/// Opaque progress bag persisted per cursor key
pub type CursorBag = Map<String, Value>;

/// Bag key holding the backfill offset
pub const OFFSET_KEY: &str = "offset";

/// Bag key holding the newest source timestamp observed (RFC 3339)
pub const NEWEST_SEEN_KEY: &str = "newest_seen";

/// Bag key flagging a completed backfill
pub const EXHAUSTED_KEY: &str = "exhausted";

/// Typed view over a cursor bag
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorPhase {
    /// Historical backfill is still in progress
    Backfilling {
        /// Next offset to fetch
        offset: u64,
        /// Newest source timestamp seen so far
        newest_seen: Option<DateTime<Utc>>,
    },

    /// History is exhausted; only newer items are fetched
    Tailing {
        /// Newest source timestamp seen so far
        newest_seen: Option<DateTime<Utc>>,
    },
}

impl CursorPhase {
    /// A fresh cursor with no progress
    pub fn new() -> Self {
        Self::Backfilling {
            offset: 0,
            newest_seen: None,
        }
    }

    /// Reads the phase out of a persisted bag
    ///
    /// Unknown keys are ignored; malformed well-known keys fall back to their
    /// defaults.
    pub fn from_bag(bag: &CursorBag) -> Self {
        let newest_seen = bag
            .get(NEWEST_SEEN_KEY)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let exhausted = bag
            .get(EXHAUSTED_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if exhausted {
            Self::Tailing { newest_seen }
        } else {
            let offset = bag.get(OFFSET_KEY).and_then(Value::as_u64).unwrap_or(0);
            Self::Backfilling {
                offset,
                newest_seen,
            }
        }
    }

    /// Returns true once the backfill has reached the end of history
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Tailing { .. })
    }

    /// Backfill offset, or `None` while tailing
    pub fn offset(&self) -> Option<u64> {
        match self {
            Self::Backfilling { offset, .. } => Some(*offset),
            Self::Tailing { .. } => None,
        }
    }

    /// Newest source timestamp observed in either phase
    pub fn newest_seen(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Backfilling { newest_seen, .. } | Self::Tailing { newest_seen } => *newest_seen,
        }
    }

    /// Moves the backfill offset forward; never moves it backward
    pub fn advance(self, to: u64) -> Self {
        match self {
            Self::Backfilling {
                offset,
                newest_seen,
            } => Self::Backfilling {
                offset: offset.max(to),
                newest_seen,
            },
            tailing => tailing,
        }
    }

    /// Records an observed source timestamp, keeping the newest
    pub fn observe(self, seen: DateTime<Utc>) -> Self {
        let keep = |current: Option<DateTime<Utc>>| Some(current.map_or(seen, |c| c.max(seen)));
        match self {
            Self::Backfilling {
                offset,
                newest_seen,
            } => Self::Backfilling {
                offset,
                newest_seen: keep(newest_seen),
            },
            Self::Tailing { newest_seen } => Self::Tailing {
                newest_seen: keep(newest_seen),
            },
        }
    }

    /// Transitions a backfilling cursor to tailing
    pub fn exhaust(self) -> Self {
        Self::Tailing {
            newest_seen: self.newest_seen(),
        }
    }

    /// Renders the well-known fields of this phase as a bag fragment
    pub fn to_bag(&self) -> CursorBag {
        let mut bag = CursorBag::new();
        match self {
            Self::Backfilling { offset, .. } => {
                bag.insert(OFFSET_KEY.to_string(), Value::from(*offset));
                bag.insert(EXHAUSTED_KEY.to_string(), Value::Bool(false));
            }
            Self::Tailing { .. } => {
                bag.insert(EXHAUSTED_KEY.to_string(), Value::Bool(true));
            }
        }
        if let Some(seen) = self.newest_seen() {
            bag.insert(
                NEWEST_SEEN_KEY.to_string(),
                Value::String(seen.to_rfc3339_opts(SecondsFormat::Micros, true)),
            );
        }
        bag
    }
}

impl Default for CursorPhase {
    fn default() -> Self {
        Self::new()
    }
}
