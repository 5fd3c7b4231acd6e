//! # loam-core
//!
//! Core types, traits, and primitives for the Loam cross-session learning
//! layer. This crate defines the shared vocabulary used by every other
//! crate in the workspace: the error type, the Adapter SPI, conversation
//! messages, task contracts, and session verdicts.

pub mod adapter;
pub mod contract;
pub mod error;
pub mod message;
pub mod types;

pub use adapter::{ToolAdapter, ToolCallIntent, ToolOutcome, ToolSpec};
pub use contract::{ContractResult, ContractSpec, Predicate, PredicateOutcome};
pub use error::{LoamError, Result};
pub use message::{Message, MessageContent, Role};
pub use types::*;
