use loam_core::{LearningMode, TransferPolicy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration — maps to `loam.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoamConfig {
    pub model: ModelConfig,
    pub session: SessionConfig,
    pub learning: LearningConfig,
    pub promotion: PromotionConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

// ── Model ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Primary model identifier handed to the transport.
    pub model: String,
    /// Model used for the LLM judge (defaults to the primary).
    pub judge_model: Option<String>,
    /// Small/fast model for the critic (defaults to the primary).
    pub critic_model: Option<String>,
    /// Maximum tokens per response.
    pub max_tokens: u32,
    /// Temperature (0.0 - 2.0).
    pub temperature: f32,
    /// Bounded transport retry attempts before the session fails.
    pub transport_retries: u32,
    /// Base backoff in milliseconds between transport retries.
    pub backoff_base_ms: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "anthropic/claude-sonnet-4-20250514".into(),
            judge_model: None,
            critic_model: Some("anthropic/claude-haiku-3-5".into()),
            max_tokens: 4096,
            temperature: 0.2,
            transport_retries: 3,
            backoff_base_ms: 500,
        }
    }
}

// ── Session ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum steps before the session ends as fail (reason=budget).
    pub max_steps: u32,
    /// Wall-clock budget in seconds. 0 = no wall-clock limit.
    pub wall_clock_secs: u64,
    /// Same-step shape-validation retries before a forced reflection.
    pub validation_retry_cap: u32,
    /// Accumulated hard failures that trigger a reflection turn.
    pub reflection_failure_threshold: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_steps: 20,
            wall_clock_secs: 300,
            validation_retry_cap: 2,
            reflection_failure_threshold: 3,
        }
    }
}

// ── Learning / retrieval ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Critic prompting mode: strict / legacy / auto.
    pub mode: LearningMode,
    /// Transfer-lane policy: off / auto / always.
    pub transfer: TransferPolicy,
    /// Lessons injected into the pre-run prompt block.
    pub prerun_top_k: usize,
    /// Hints appended to a failing tool result.
    pub onerror_top_m: usize,
    /// Score multiplier applied to transfer-lane candidates.
    pub transfer_multiplier: f64,
    /// Transfer-lane quota in the pre-run block.
    pub transfer_prerun_cap: usize,
    /// Transfer-lane quota per on-error retrieval.
    pub transfer_onerror_cap: usize,
    /// `auto` transfer fires only when the strict lane has no hit at or
    /// above this score.
    pub strict_confidence_threshold: f64,
    /// Max lessons from any single source session per retrieval.
    pub per_session_cap: usize,
    /// Max lessons sharing a tag per retrieval.
    pub per_tag_cap: usize,
    /// Recency half-life in days for the ranking formula.
    pub recency_half_life_days: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            mode: LearningMode::Auto,
            transfer: TransferPolicy::Auto,
            prerun_top_k: 10,
            onerror_top_m: 2,
            transfer_multiplier: 0.6,
            transfer_prerun_cap: 2,
            transfer_onerror_cap: 1,
            strict_confidence_threshold: 0.5,
            per_session_cap: 2,
            per_tag_cap: 3,
            recency_half_life_days: 14.0,
        }
    }
}

// ── Promotion ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionConfig {
    /// Aggregate utility required to promote a candidate.
    pub utility_threshold: f64,
    /// Relevant runs required before promotion is considered.
    pub evidence_window: usize,
    /// A single activation at or below this utility blocks promotion.
    pub regression_floor: f64,
    /// Retrievals with mean utility ≤ 0 before suppression.
    pub suppression_retrievals: usize,
    /// Conflict losses to the same opponent before suppression.
    pub suppression_conflict_losses: usize,
    /// Days without retrieval before archival is considered.
    pub archive_age_days: i64,
    /// Reliability below which an idle lesson is archived.
    pub archive_reliability_floor: f64,
    /// Rule-text token Jaccard at or above which candidates merge.
    pub dedup_jaccard: f64,
    /// Rule-text token Jaccard below which trigger-overlapping lessons
    /// are linked as conflicts.
    pub conflict_jaccard: f64,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            utility_threshold: 0.20,
            evidence_window: 3,
            regression_floor: -0.5,
            suppression_retrievals: 3,
            suppression_conflict_losses: 3,
            archive_age_days: 60,
            archive_reliability_floor: 0.4,
            dedup_jaccard: 0.65,
            conflict_jaccard: 0.25,
        }
    }
}

// ── Storage ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for lessons.jsonl, events/, metrics/.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".loam"),
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter, e.g. "info", "loam_engine=debug".
    pub level: String,
    /// Output format: "text" or "json".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl LoamConfig {
    /// Validate the config. Returns non-fatal warnings; errors are fatal.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();

        if self.session.max_steps == 0 {
            return Err("session.max_steps must be at least 1".into());
        }
        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(format!(
                "model.temperature must be in [0.0, 2.0], got {}",
                self.model.temperature
            ));
        }
        if !(0.0..=1.0).contains(&self.learning.transfer_multiplier) {
            return Err(format!(
                "learning.transfer_multiplier must be in [0.0, 1.0], got {}",
                self.learning.transfer_multiplier
            ));
        }
        if !(0.0..=1.0).contains(&self.promotion.dedup_jaccard) {
            return Err("promotion.dedup_jaccard must be in [0.0, 1.0]".into());
        }
        if self.promotion.conflict_jaccard >= self.promotion.dedup_jaccard {
            return Err(
                "promotion.conflict_jaccard must be below promotion.dedup_jaccard".into(),
            );
        }
        if self.learning.onerror_top_m == 0 {
            warnings.push("learning.onerror_top_m = 0 disables on-error hints".into());
        }
        if self.learning.prerun_top_k == 0 {
            warnings.push("learning.prerun_top_k = 0 disables the pre-run lessons block".into());
        }
        if self.session.wall_clock_secs == 0 {
            warnings.push("session.wall_clock_secs = 0 disables the wall-clock budget".into());
        }
        if self.promotion.evidence_window == 0 {
            return Err("promotion.evidence_window must be at least 1".into());
        }

        Ok(warnings)
    }
}
