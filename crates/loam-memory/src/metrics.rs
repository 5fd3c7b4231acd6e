use serde::{Deserialize, Serialize};
use std::path::Path;

use loam_core::{EvalSource, Result, SessionId, SCHEMA_VERSION};

/// End-of-run metrics, one object per session, written to
/// `metrics/session-<id>.json`. Always written, even for sessions that
/// die on the first turn — downstream reporting and learning depend on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub session_id: SessionId,
    pub task_id: String,
    pub domain_key: String,
    pub passed: bool,
    pub score: f64,
    pub steps: u32,
    pub tool_errors: u32,
    /// Lessons injected into the pre-run prompt block.
    pub v2_prerun_lesson_ids: Vec<String>,
    /// Count of hint injections (pre-run block counts as one when
    /// non-empty, plus one per on-error injection).
    pub v2_lesson_activations: u32,
    /// Store size at session start. Distinct from the injected set —
    /// timeline views must not conflate the two.
    pub store_snapshot_lessons: usize,
    /// Fraction of failing steps whose fingerprint appeared in prior
    /// sessions.
    pub fingerprint_recurrence_before: f64,
    /// Fraction of failing steps whose fingerprint repeated within this
    /// session after a hint was injected for it.
    pub fingerprint_recurrence_after: f64,
    pub validation_retry_attempts: u32,
    pub validation_retry_capped_events: u32,
    pub reflection_turns: u32,
    pub eval_source: EvalSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
    pub wall_clock_ms: u64,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl SessionMetrics {
    pub fn new(session_id: SessionId, task_id: &str, domain_key: &str) -> Self {
        Self {
            session_id,
            task_id: task_id.to_string(),
            domain_key: domain_key.to_string(),
            passed: false,
            score: 0.0,
            steps: 0,
            tool_errors: 0,
            v2_prerun_lesson_ids: Vec::new(),
            v2_lesson_activations: 0,
            store_snapshot_lessons: 0,
            fingerprint_recurrence_before: 0.0,
            fingerprint_recurrence_after: 0.0,
            validation_retry_attempts: 0,
            validation_retry_capped_events: 0,
            reflection_turns: 0,
            eval_source: EvalSource::None,
            fail_reason: None,
            wall_clock_ms: 0,
            schema_version: SCHEMA_VERSION,
        }
    }

    /// Write the metrics object to `<metrics_dir>/session-<id>.json`.
    pub fn write(&self, metrics_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(metrics_dir)?;
        let path = metrics_dir.join(format!("session-{}.json", self.session_id));
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Read a metrics object back.
    pub fn read(metrics_dir: &Path, session_id: SessionId) -> Result<Self> {
        let path = metrics_dir.join(format!("session-{session_id}.json"));
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}
