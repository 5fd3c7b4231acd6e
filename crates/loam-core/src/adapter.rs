use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Description of the tool a domain adapter exposes to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Unique name, e.g. "gridtool", "sqltool".
    pub name: String,
    /// Human-readable description for the model.
    pub description: String,
    /// JSON Schema of the input payload. Shape validation (required keys,
    /// top-level types, forbidden extras) runs against this before
    /// execution; semantic errors inside the payload do not.
    pub input_schema: Value,
    /// Local documentation consulted by the strict-mode critic.
    #[serde(default)]
    pub docs_manifest: Vec<PathBuf>,
}

/// A request from the model to call the adapter's tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallIntent {
    pub id: String,
    pub tool_name: String,
    pub payload: Value,
}

/// The outcome of one tool execution. A populated `error` is session
/// data driving the learning loop, not an adapter fault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Optional structured description of how the tool changed its state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_delta: Option<Value>,
}

impl ToolOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: None,
            state_delta: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            error: Some(error.into()),
            state_delta: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// The Adapter SPI — what the core requires of each domain.
///
/// Adapters wrap one external tool (CLI, HTTP endpoint, GUI driver) and
/// are data from the core's viewpoint: the step loop never downcasts.
/// `execute` must be serial-safe; the core never issues overlapping calls
/// within a session. Returning `Err` is reserved for adapter
/// infrastructure faults — tool-level failures go in `ToolOutcome.error`.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Declare the tool exposed to the model.
    fn tool_spec(&self) -> ToolSpec;

    /// Stable short identifier for this execution context, used for
    /// strict-lane retrieval scoping. Convention: "<family>:<adapter>".
    fn domain_key(&self) -> String;

    /// Perform one tool call.
    async fn execute(&self, payload: &Value) -> crate::Result<ToolOutcome>;

    /// Evidence string handed to the referee after the session ends.
    async fn capture_final_state(&self) -> crate::Result<String>;
}
