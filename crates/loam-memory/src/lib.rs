//! # loam-memory
//!
//! The Memory V2 subsystem: everything Loam persists across sessions and
//! the logic that decides what survives.
//!
//! - **Fingerprinter**: noisy failure output → stable recurrence keys + tags.
//! - **Lesson store**: JSONL-backed lifecycle store with dedup and
//!   conflict links.
//! - **Retriever**: two-lane ranked retrieval (strict / transfer) used
//!   pre-run and on-error.
//! - **Promoter**: outcome-based utility driving promote / suppress /
//!   archive transitions.
//! - **Event log / metrics**: per-session JSONL event stream and the
//!   end-of-run metrics object.

pub mod event_log;
pub mod fingerprint;
pub mod lesson;
pub mod metrics;
pub mod promotion;
pub mod retrieval;
pub mod store;

pub use event_log::{ErrorEvent, SessionEvent, SessionEventLog};
pub use fingerprint::{FingerprintInput, Fingerprinter};
pub use lesson::{ActivationRecord, CandidateLesson, Lesson, LessonStatus, ScopeHint};
pub use metrics::SessionMetrics;
pub use promotion::{Promoter, SessionOutcome};
pub use retrieval::{RankedLesson, RetrievalQuery, Retriever};
pub use store::{LessonFilter, LessonStore};
