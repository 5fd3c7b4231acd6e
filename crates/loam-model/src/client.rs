use async_trait::async_trait;
use loam_core::{Message, Result, ToolCallIntent, ToolSpec};
use serde::{Deserialize, Serialize};

/// A request for one model turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// The model to use, e.g. "anthropic/claude-sonnet-4-20250514".
    pub model: String,
    /// Conversation history.
    pub messages: Vec<Message>,
    /// Tool available this session (the adapter declares exactly one).
    pub tools: Vec<ToolSpec>,
    /// System prompt (separate from messages for transports that support it).
    pub system: Option<String>,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Temperature.
    pub temperature: f32,
    /// Stop conditions forwarded to the transport.
    pub stop_conditions: Vec<String>,
}

/// One complete model turn: optional narration plus zero-or-one tool-call
/// intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelTurn {
    pub text_blocks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallIntent>,
    pub stop_reason: StopReason,
    #[serde(default)]
    pub usage: Usage,
}

impl ModelTurn {
    /// Narration text joined together.
    pub fn text(&self) -> String {
        self.text_blocks.join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

/// Token usage statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    pub fn merge(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// The Model SPI — what the core requires of each LLM transport.
///
/// Implementations must be idempotent-safe under retry at the transport
/// layer; the core does not replay turns.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Human-readable transport name, e.g. "anthropic-http", "mock".
    fn name(&self) -> &str;

    /// Produce one turn.
    async fn turn(&self, request: &TurnRequest) -> Result<ModelTurn>;
}
