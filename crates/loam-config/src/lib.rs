//! # loam-config
//!
//! Configuration for the Loam learning layer — maps to `loam.toml`.
//! Resolution order: explicit path > `LOAM_CONFIG` env > `~/.loam/loam.toml`,
//! with per-field environment overrides applied after file load.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    LearningConfig, LoamConfig, LoggingConfig, ModelConfig, PromotionConfig, SessionConfig,
    StorageConfig,
};
