//! Record shapes the synchronization layer depends on.
//!
//! The sync layer is generic over [`ChatStore`], whose associated types pick
//! the concrete conversation, turn and tool invocation records once, at
//! construction.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use parley_core::ids::{ConversationId, ToolInvocationId, TurnId};
use parley_core::messages::Role;

use crate::error::StoreError;

pub type Arguments = serde_json::Map<String, serde_json::Value>;

pub trait ConversationRecord: Clone + fmt::Debug + Send + Sync {
    fn id(&self) -> &ConversationId;
    fn model_id(&self) -> &str;
}

pub trait TurnRecord: Clone + fmt::Debug + Send + Sync {
    fn id(&self) -> &TurnId;
    fn conversation_id(&self) -> &ConversationId;
    fn role(&self) -> Role;
    fn content(&self) -> &str;
    fn state(&self) -> TurnState;
    fn model_id(&self) -> Option<&str>;
    fn input_tokens(&self) -> Option<u32>;
    fn output_tokens(&self) -> Option<u32>;
    /// The invocation this turn answers, if resolved.
    fn tool_invocation_id(&self) -> Option<&ToolInvocationId>;
    fn created_at(&self) -> &str;

    /// Placeholder that never received content.
    fn is_empty(&self) -> bool {
        self.state() == TurnState::Empty && self.content().trim().is_empty()
    }
}

pub trait ToolInvocationRecord: Clone + fmt::Debug + Send + Sync {
    fn id(&self) -> &ToolInvocationId;
    fn turn_id(&self) -> &TurnId;
    fn correlation_id(&self) -> &str;
    fn name(&self) -> &str;
    fn arguments(&self) -> &Arguments;
}

/// Persisted lifecycle state of a turn. Rolled-back turns no longer exist.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Empty,
    Complete,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TurnState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "empty" => Ok(Self::Empty),
            "complete" => Ok(Self::Complete),
            other => Err(format!("unknown turn state: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: ConversationId,
    pub model_id: String,
    pub created_at: String,
    pub updated_at: String,
}

impl ConversationRecord for ConversationRow {
    fn id(&self) -> &ConversationId {
        &self.id
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnRow {
    pub id: TurnId,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub content: String,
    pub state: TurnState,
    pub model_id: Option<String>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub tool_invocation_id: Option<ToolInvocationId>,
    pub created_at: String,
    pub updated_at: String,
}

impl TurnRecord for TurnRow {
    fn id(&self) -> &TurnId {
        &self.id
    }

    fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    fn role(&self) -> Role {
        self.role
    }

    fn content(&self) -> &str {
        &self.content
    }

    fn state(&self) -> TurnState {
        self.state
    }

    fn model_id(&self) -> Option<&str> {
        self.model_id.as_deref()
    }

    fn input_tokens(&self) -> Option<u32> {
        self.input_tokens
    }

    fn output_tokens(&self) -> Option<u32> {
        self.output_tokens
    }

    fn tool_invocation_id(&self) -> Option<&ToolInvocationId> {
        self.tool_invocation_id.as_ref()
    }

    fn created_at(&self) -> &str {
        &self.created_at
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationRow {
    pub id: ToolInvocationId,
    pub turn_id: TurnId,
    pub correlation_id: String,
    pub name: String,
    pub arguments: Arguments,
    pub created_at: String,
}

impl ToolInvocationRecord for ToolInvocationRow {
    fn id(&self) -> &ToolInvocationId {
        &self.id
    }

    fn turn_id(&self) -> &TurnId {
        &self.turn_id
    }

    fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn arguments(&self) -> &Arguments {
        &self.arguments
    }
}

/// Final fields written when a turn completes.
#[derive(Clone, Debug, PartialEq)]
pub struct TurnFields {
    pub role: Role,
    pub content: String,
    pub model_id: Option<String>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewToolInvocation {
    pub correlation_id: String,
    pub name: String,
    pub arguments: Arguments,
}

/// One write inside an atomic group passed to [`ChatStore::apply`].
#[derive(Clone, Debug, PartialEq)]
pub enum TurnWrite {
    /// Insert an empty turn with a known id, to be finalized later in the
    /// same group.
    Create {
        turn_id: TurnId,
        conversation_id: ConversationId,
        role: Role,
    },
    /// Write final fields and mark the turn complete.
    Finalize { turn_id: TurnId, fields: TurnFields },
    /// Point the turn's back-reference at the invocation it answers.
    LinkToolResult {
        turn_id: TurnId,
        invocation_id: ToolInvocationId,
    },
    /// Create an invocation owned by the turn.
    CreateToolInvocation {
        turn_id: TurnId,
        invocation: NewToolInvocation,
    },
}

/// Durable storage for conversations, turns and tool invocations.
pub trait ChatStore: Send + Sync {
    type Conversation: ConversationRecord;
    type Turn: TurnRecord;
    type ToolInvocation: ToolInvocationRecord;

    fn create_conversation(&self, model_id: &str) -> Result<Self::Conversation, StoreError>;

    fn conversation(&self, id: &ConversationId) -> Result<Self::Conversation, StoreError>;

    fn set_conversation_model(&self, id: &ConversationId, model_id: &str) -> Result<(), StoreError>;

    /// Delete a conversation with all its turns and their invocations.
    fn delete_conversation(&self, id: &ConversationId) -> Result<bool, StoreError>;

    /// Create a turn that is complete on arrival (user, system). Engine turns
    /// go through [`TurnWrite::Create`] instead.
    fn create_turn(&self, conversation_id: &ConversationId, role: Role, content: &str)
        -> Result<Self::Turn, StoreError>;

    /// Create an empty assistant placeholder.
    fn create_placeholder(&self, conversation_id: &ConversationId) -> Result<Self::Turn, StoreError>;

    /// Delete every system turn of the conversation and create a new one, atomically.
    fn replace_system_turns(&self, conversation_id: &ConversationId, content: &str)
        -> Result<Self::Turn, StoreError>;

    fn turn(&self, id: &TurnId) -> Result<Self::Turn, StoreError>;

    /// Turns in ascending creation order.
    fn turns(&self, conversation_id: &ConversationId) -> Result<Vec<Self::Turn>, StoreError>;

    /// Delete a turn and the invocations it owns. Turns answering those
    /// invocations keep existing with their back-reference cleared.
    fn delete_turn(&self, id: &TurnId) -> Result<bool, StoreError>;

    fn tool_invocation(&self, id: &ToolInvocationId) -> Result<Self::ToolInvocation, StoreError>;

    /// Invocations owned by a turn, in creation order.
    fn tool_invocations(&self, turn_id: &TurnId) -> Result<Vec<Self::ToolInvocation>, StoreError>;

    /// Exact-match lookup of an invocation by correlation token within a conversation.
    fn find_tool_invocation(
        &self,
        conversation_id: &ConversationId,
        correlation_id: &str,
    ) -> Result<Option<Self::ToolInvocation>, StoreError>;

    /// Apply writes as one atomic group: all or none.
    fn apply(&self, writes: &[TurnWrite]) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(state: TurnState, content: &str) -> TurnRow {
        TurnRow {
            id: TurnId::new(),
            conversation_id: ConversationId::new(),
            role: Role::Assistant,
            content: content.into(),
            state,
            model_id: None,
            input_tokens: None,
            output_tokens: None,
            tool_invocation_id: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn empty_means_placeholder_without_content() {
        assert!(turn(TurnState::Empty, "").is_empty());
        assert!(turn(TurnState::Empty, "  \n").is_empty());
        assert!(!turn(TurnState::Empty, "partial").is_empty());
        assert!(!turn(TurnState::Complete, "").is_empty());
    }

    #[test]
    fn turn_state_roundtrip() {
        for state in [TurnState::Empty, TurnState::Complete] {
            assert_eq!(state.as_str().parse::<TurnState>().unwrap(), state);
        }
        assert!("streaming".parse::<TurnState>().is_err());
    }
}
