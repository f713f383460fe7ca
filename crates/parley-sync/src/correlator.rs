use tracing::debug;

use parley_core::ids::{ConversationId, ToolInvocationId, TurnId};
use parley_core::messages::{ToolCall, ToolCalls};
use parley_store::{ChatStore, NewToolInvocation, StoreError, ToolInvocationRecord, TurnRecord, TurnWrite};

/// Links tool invocations to the turns that originate and answer them.
pub struct ToolCallCorrelator<'a, S: ChatStore> {
    store: &'a S,
}

impl<'a, S: ChatStore> ToolCallCorrelator<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Exact-match lookup of `token` in the conversation. A miss is not an error.
    pub fn resolve(&self, conversation_id: &ConversationId, token: &str) -> Result<Option<ToolInvocationId>, StoreError> {
        let found = self.store.find_tool_invocation(conversation_id, token)?;
        if found.is_none() {
            debug!(%conversation_id, token, "no tool invocation for result token");
        }
        Ok(found.map(|invocation| invocation.id().clone()))
    }

    /// One create per tool call, owned by `owner`, in call order.
    pub fn invocation_writes(owner: &TurnId, tool_calls: &ToolCalls) -> Vec<TurnWrite> {
        tool_calls
            .iter()
            .map(|(token, call)| TurnWrite::CreateToolInvocation {
                turn_id: owner.clone(),
                invocation: NewToolInvocation {
                    correlation_id: token.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                },
            })
            .collect()
    }

    /// Token -> call map for every invocation the turn owns.
    pub fn tool_calls(&self, turn_id: &TurnId) -> Result<ToolCalls, StoreError> {
        Ok(self
            .store
            .tool_invocations(turn_id)?
            .into_iter()
            .map(|invocation| {
                let token = invocation.correlation_id().to_string();
                let call = ToolCall {
                    id: token.clone(),
                    name: invocation.name().to_string(),
                    arguments: invocation.arguments().clone(),
                };
                (token, call)
            })
            .collect())
    }

    /// Correlation token of the invocation this turn answers, if linked.
    pub fn result_token(&self, turn: &S::Turn) -> Result<Option<String>, StoreError> {
        match turn.tool_invocation_id() {
            Some(id) => Ok(Some(self.store.tool_invocation(id)?.correlation_id().to_string())),
            None => Ok(None),
        }
    }
}
