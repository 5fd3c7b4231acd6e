use thiserror::Error;

/// Unified error type for the entire Loam workspace.
#[derive(Error, Debug)]
pub enum LoamError {
    // ── Model / transport errors ───────────────────────────────
    #[error("model transport error: {0}")]
    Transport(String),

    #[error("model rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("model returned malformed output: {0}")]
    ModelOutput(String),

    // ── Adapter / tool errors ──────────────────────────────────
    #[error("adapter error: {domain}: {reason}")]
    Adapter { domain: String, reason: String },

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    // ── Lesson store errors ────────────────────────────────────
    #[error("lesson store error: {0}")]
    Store(String),

    // ── Session errors ─────────────────────────────────────────
    #[error("session budget exhausted: {resource}: used {used}, limit {limit}")]
    BudgetExceeded {
        resource: String,
        used: u64,
        limit: u64,
    },

    #[error("session cancelled")]
    Cancelled,

    // ── Contract / referee errors ──────────────────────────────
    #[error("contract evaluation error: {0}")]
    Contract(String),

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl LoamError {
    /// Whether this error is a transport-level failure that should surface
    /// to the caller (and the process exit code). Everything else becomes
    /// session data.
    pub fn is_transport(&self) -> bool {
        matches!(self, LoamError::Transport(_) | LoamError::RateLimited { .. })
    }
}

pub type Result<T> = std::result::Result<T, LoamError>;
