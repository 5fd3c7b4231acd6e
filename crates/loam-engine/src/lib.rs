//! # loam-engine
//!
//! The session engine: the per-session step loop that drives model turns
//! and tool executions, plus the two end-of-run authorities — the critic
//! (candidate-lesson extraction) and the referee (verdict production).

pub mod critic;
pub mod knowledge;
pub mod prompt;
pub mod referee;
pub mod step_loop;
pub mod validate;

pub use critic::{Critic, CriticParams, TraceEntry};
pub use knowledge::KnowledgeProvider;
pub use referee::{Referee, RefereeReport};
pub use step_loop::{SessionReport, SessionRunner, SessionSpec};
pub use validate::{validate_shape, ValidationError};
