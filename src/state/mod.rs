//! State module for tracking crawl progress
//!
//! # Components
//!
//! - `JobStatus`: lifecycle of one crawl execution (pending, running, terminal)
//! - `CursorPhase`: per-(source, term) resume state, backfilling or tailing

mod cursor_phase;
mod job_status;

// Re-export main types
pub use cursor_phase::{CursorBag, CursorPhase, EXHAUSTED_KEY, NEWEST_SEEN_KEY, OFFSET_KEY};
pub use job_status::JobStatus;
