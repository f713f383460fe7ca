use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::attachments::AttachmentDescriptor;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// A tool call requested by the model. `id` is the provider's correlation token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

/// Tool call map keyed by correlation token.
pub type ToolCalls = IndexMap<String, ToolCall>;

/// Tool definition forwarded to the engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// Text plus zero or more attachments.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EngineContent {
    pub text: String,
    pub attachments: Vec<AttachmentDescriptor>,
}

impl EngineContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, attachment: AttachmentDescriptor) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty() && self.attachments.is_empty()
    }
}

/// Engine-side representation of a single turn.
///
/// This is what the engine consumes during replay and what it hands back
/// when a turn ends.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineTurn {
    pub role: Role,
    pub content: EngineContent,
    pub model_id: Option<String>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    /// Tool calls this turn originates.
    pub tool_calls: ToolCalls,
    /// Correlation token of the tool call this turn answers.
    pub tool_call_id: Option<String>,
}

impl EngineTurn {
    pub fn new(role: Role, content: EngineContent) -> Self {
        Self {
            role,
            content,
            model_id: None,
            input_tokens: None,
            output_tokens: None,
            tool_calls: ToolCalls::new(),
            tool_call_id: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, EngineContent::text(text))
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, EngineContent::text(text))
    }

    pub fn tool_result(tool_call_id: impl Into<String>, text: impl Into<String>) -> Self {
        let mut turn = Self::new(Role::Tool, EngineContent::text(text));
        turn.tool_call_id = Some(tool_call_id.into());
        turn
    }

    pub fn with_usage(mut self, model_id: impl Into<String>, input_tokens: u32, output_tokens: u32) -> Self {
        self.model_id = Some(model_id.into());
        self.input_tokens = Some(input_tokens);
        self.output_tokens = Some(output_tokens);
        self
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        let _ = self.tool_calls.insert(call.id.clone(), call);
        self
    }

    pub fn is_tool_call(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn is_tool_result(&self) -> bool {
        self.tool_call_id.is_some()
    }
}
