//! # loam-testing
//!
//! Deterministic fixtures for exercising the full session loop with zero
//! network: two table-processing fixture domains behind the Adapter SPI
//! (`gridtool` and its renamed sibling `fluxtool`, for transfer
//! scenarios), and a scripted model client that replays turns from a
//! JSONL file.

pub mod script;
pub mod table;

pub use script::{ScriptTurn, ScriptedModel};
pub use table::{fluxtool, gridtool, TableAdapter};
