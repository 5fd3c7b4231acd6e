use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::schema::LoamConfig;

/// Loads the Loam configuration from disk with env overrides.
pub struct ConfigLoader {
    config: LoamConfig,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > LOAM_CONFIG env > ~/.loam/loam.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("LOAM_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".loam")
            .join("loam.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> loam_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            toml::from_str::<LoamConfig>(&raw).map_err(|e| {
                loam_core::LoamError::Config(format!(
                    "failed to parse {}: {}",
                    config_path.display(),
                    e
                ))
            })?
        } else {
            LoamConfig::default()
        };

        // Apply environment variable overrides
        let config = Self::apply_env_overrides(config);

        // Validate config — log warnings, fail on errors
        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => {
                return Err(loam_core::LoamError::Config(e));
            }
        }

        Ok(Self {
            config,
            config_path,
        })
    }

    /// Get a clone of the loaded config.
    pub fn get(&self) -> LoamConfig {
        self.config.clone()
    }

    /// Path the config was resolved from.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Apply env var overrides (LOAM_MODEL, LOAM_LEARNING_MODE, etc.)
    fn apply_env_overrides(mut config: LoamConfig) -> LoamConfig {
        if let Ok(v) = std::env::var("LOAM_MODEL") {
            config.model.model = v;
        }
        if let Ok(v) = std::env::var("LOAM_JUDGE_MODEL") {
            config.model.judge_model = Some(v);
        }
        if let Ok(v) = std::env::var("LOAM_LEARNING_MODE") {
            match v.parse() {
                Ok(mode) => config.learning.mode = mode,
                Err(e) => warn!("ignoring LOAM_LEARNING_MODE: {e}"),
            }
        }
        if let Ok(v) = std::env::var("LOAM_TRANSFER_POLICY") {
            match v.parse() {
                Ok(policy) => config.learning.transfer = policy,
                Err(e) => warn!("ignoring LOAM_TRANSFER_POLICY: {e}"),
            }
        }
        if let Ok(v) = std::env::var("LOAM_MAX_STEPS") {
            if let Ok(steps) = v.parse::<u32>() {
                config.session.max_steps = steps;
            }
        }
        if let Ok(v) = std::env::var("LOAM_WALL_CLOCK_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                config.session.wall_clock_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("LOAM_DATA_DIR") {
            config.storage.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("LOAM_LOG") {
            config.logging.level = v;
        }
        config
    }
}
