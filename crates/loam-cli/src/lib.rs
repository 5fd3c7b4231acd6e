//! # loam-cli
//!
//! Command-line interface for the Loam learning layer.
//!
//! ## Commands
//!
//! - `loam run` — Run one session and write its artifacts
//! - `loam lessons` — Inspect the lesson store
//! - `loam compact` — Compact the lesson log
//! - `loam config` — Show the effective configuration
//! - `loam version` — Show version info

pub mod commands;

pub use commands::Cli;
