//! Mock model client for deterministic testing.
//!
//! Returns pre-configured turns without making any network calls.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::client::{ModelClient, ModelTurn, StopReason, TurnRequest, Usage};
use loam_core::{LoamError, Result, ToolCallIntent};

/// A mock model client that returns pre-configured turns in order.
///
/// # Example
/// ```
/// use loam_model::MockModel;
/// let model = MockModel::new("test")
///     .with_text("done")
///     .with_transport_error("connection reset");
/// ```
pub struct MockModel {
    turns: Arc<Mutex<Vec<MockTurn>>>,
    /// Track all requests received (for assertions in tests).
    requests: Arc<Mutex<Vec<TurnRequest>>>,
    name: String,
}

/// A pre-configured turn from the mock model.
#[derive(Clone)]
pub struct MockTurn {
    pub text: String,
    pub tool_call: Option<ToolCallIntent>,
    pub stop_reason: StopReason,
    pub usage: Usage,
    /// If set, the client returns this error instead of a turn.
    pub error: Option<MockError>,
}

#[derive(Clone)]
pub enum MockError {
    Transport(String),
    Malformed(String),
}

impl Default for MockTurn {
    fn default() -> Self {
        Self {
            text: String::new(),
            tool_call: None,
            stop_reason: StopReason::EndTurn,
            usage: Usage {
                input_tokens: 100,
                output_tokens: 50,
            },
            error: None,
        }
    }
}

impl MockTurn {
    /// A text-only turn (session ends normally after it).
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Default::default()
        }
    }

    /// A turn requesting one tool call.
    pub fn tool_call(tool_name: &str, payload: serde_json::Value) -> Self {
        Self {
            tool_call: Some(ToolCallIntent {
                id: format!("call_{}", uuid::Uuid::new_v4()),
                tool_name: tool_name.to_string(),
                payload,
            }),
            stop_reason: StopReason::ToolUse,
            ..Default::default()
        }
    }

    /// A transport failure.
    pub fn transport_error(msg: &str) -> Self {
        Self {
            error: Some(MockError::Transport(msg.to_string())),
            ..Default::default()
        }
    }

    /// Malformed model output (not retried).
    pub fn malformed(msg: &str) -> Self {
        Self {
            error: Some(MockError::Malformed(msg.to_string())),
            ..Default::default()
        }
    }
}

impl MockModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            turns: Arc::new(Mutex::new(vec![])),
            requests: Arc::new(Mutex::new(vec![])),
            name: name.into(),
        }
    }

    /// Queue a text-only turn.
    pub fn with_text(self, text: &str) -> Self {
        self.turns.lock().push(MockTurn::text(text));
        self
    }

    /// Queue a tool-call turn.
    pub fn with_tool_call(self, tool_name: &str, payload: serde_json::Value) -> Self {
        self.turns.lock().push(MockTurn::tool_call(tool_name, payload));
        self
    }

    /// Queue a transport error.
    pub fn with_transport_error(self, msg: &str) -> Self {
        self.turns.lock().push(MockTurn::transport_error(msg));
        self
    }

    /// Queue a fully custom turn.
    pub fn with_turn(self, turn: MockTurn) -> Self {
        self.turns.lock().push(turn);
        self
    }

    /// All requests made to this client so far.
    pub fn recorded_requests(&self) -> Arc<Mutex<Vec<TurnRequest>>> {
        Arc::clone(&self.requests)
    }

    /// Pop the next queued turn, or a default end-of-conversation turn.
    fn next_turn(&self) -> MockTurn {
        let mut turns = self.turns.lock();
        if turns.is_empty() {
            MockTurn::text("(mock: no more queued turns)")
        } else {
            turns.remove(0)
        }
    }
}

#[async_trait]
impl ModelClient for MockModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn turn(&self, request: &TurnRequest) -> Result<ModelTurn> {
        self.requests.lock().push(request.clone());
        let mock = self.next_turn();

        if let Some(error) = mock.error {
            return Err(match error {
                MockError::Transport(msg) => LoamError::Transport(msg),
                MockError::Malformed(msg) => LoamError::ModelOutput(msg),
            });
        }

        let mut text_blocks = vec![];
        if !mock.text.is_empty() {
            text_blocks.push(mock.text);
        }

        Ok(ModelTurn {
            text_blocks,
            tool_call: mock.tool_call,
            stop_reason: mock.stop_reason,
            usage: mock.usage,
        })
    }
}
