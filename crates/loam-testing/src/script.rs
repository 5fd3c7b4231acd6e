use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use loam_core::{Result, ToolCallIntent};
use loam_model::{ModelClient, ModelTurn, StopReason, TurnRequest, Usage};

/// One scripted turn, as stored in a replay JSONL file. A turn with a
/// `tool` issues that call; a turn without one ends the session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptTurn {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl ScriptTurn {
    pub fn say(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Default::default()
        }
    }

    pub fn call(tool: &str, payload: Value) -> Self {
        Self {
            text: None,
            tool: Some(tool.to_string()),
            payload: Some(payload),
        }
    }
}

/// A model client that replays a fixed turn sequence — the deterministic
/// transport behind benchmark fixtures and the `loam run --script` path.
/// Identical scripts against identical stores produce identical sessions.
pub struct ScriptedModel {
    turns: Mutex<Vec<ScriptTurn>>,
    cursor: Mutex<usize>,
}

impl ScriptedModel {
    pub fn new(turns: Vec<ScriptTurn>) -> Self {
        Self {
            turns: Mutex::new(turns),
            cursor: Mutex::new(0),
        }
    }

    /// Load a script from a JSONL file, one turn object per line.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut turns = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            turns.push(serde_json::from_str::<ScriptTurn>(line)?);
        }
        Ok(Self::new(turns))
    }

    fn next(&self) -> Option<ScriptTurn> {
        let turns = self.turns.lock();
        let mut cursor = self.cursor.lock();
        let turn = turns.get(*cursor).cloned();
        if turn.is_some() {
            *cursor += 1;
        }
        turn
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn turn(&self, _request: &TurnRequest) -> Result<ModelTurn> {
        let scripted = self.next().unwrap_or_else(|| ScriptTurn::say("done"));
        let tool_call = match (&scripted.tool, &scripted.payload) {
            (Some(tool), payload) => Some(ToolCallIntent {
                id: format!("call_{}", uuid::Uuid::new_v4()),
                tool_name: tool.clone(),
                payload: payload.clone().unwrap_or(Value::Null),
            }),
            _ => None,
        };
        let stop_reason = if tool_call.is_some() {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        };
        Ok(ModelTurn {
            text_blocks: scripted.text.into_iter().collect(),
            tool_call,
            stop_reason,
            usage: Usage::default(),
        })
    }
}
