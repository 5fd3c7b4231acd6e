use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a session.
pub type SessionId = Uuid;

/// Opaque stable identifier for a lesson. Stable across store rewrites.
pub type LessonId = String;

/// Stable identifier for an execution context: tool family + adapter name,
/// e.g. "table:gridtool". Used for strict-lane retrieval scoping.
pub type DomainKey = String;

/// Version stamp carried by every persisted record. Readers tolerate
/// unknown fields so this only needs to bump on incompatible changes.
pub const SCHEMA_VERSION: u32 = 1;

/// The kind of failure signal a step produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureChannel {
    /// The tool itself reported an error.
    HardFailure,
    /// A task constraint was violated without a tool error.
    ConstraintFailure,
    /// The action executed but left the observable state unchanged.
    NoProgress,
    /// The action succeeded but took a markedly worse path.
    EfficiencyRegression,
}

impl FailureChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureChannel::HardFailure => "hard_failure",
            FailureChannel::ConstraintFailure => "constraint_failure",
            FailureChannel::NoProgress => "no_progress",
            FailureChannel::EfficiencyRegression => "efficiency_regression",
        }
    }
}

/// Final session verdict produced by the referee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    /// The deterministic contract and the LLM judge disagreed.
    /// Treated as Fail for promotion purposes.
    Uncertain,
}

impl Verdict {
    /// Whether the promoter counts this as a passing run.
    pub fn counts_as_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

/// Which authority produced the final verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalSource {
    /// A declared contract was evaluated deterministically.
    Contract,
    /// No contract was declared; the LLM judge decided alone.
    JudgePrimary,
    /// Contract evaluation errored; the judge filled in.
    JudgeFallback,
    /// The session ended before any evaluation ran.
    None,
}

/// Where in the session a lesson was injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationPoint {
    Prerun,
    OnError,
}

/// Which retrieval lane produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Strict,
    Transfer,
}

/// Transfer-lane policy: `off` / `auto` / `always`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPolicy {
    Off,
    #[default]
    Auto,
    Always,
}

impl std::str::FromStr for TransferPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "off" => Ok(TransferPolicy::Off),
            "auto" => Ok(TransferPolicy::Auto),
            "always" => Ok(TransferPolicy::Always),
            other => Err(format!("unknown transfer policy: {other}")),
        }
    }
}

/// Critic prompting mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningMode {
    /// Schema-only critic prompt; domain context comes from the adapter's
    /// docs manifest, never from hard-coded exemplars.
    Strict,
    /// Critic prompt may carry domain-specific exemplars.
    Legacy,
    #[default]
    Auto,
}

impl std::str::FromStr for LearningMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "strict" => Ok(LearningMode::Strict),
            "legacy" => Ok(LearningMode::Legacy),
            "auto" => Ok(LearningMode::Auto),
            other => Err(format!("unknown learning mode: {other}")),
        }
    }
}
