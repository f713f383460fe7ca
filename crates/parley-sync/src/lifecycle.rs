//! Drives one turn record through `empty -> complete` or `empty -> rolled back`.

use tracing::{debug, warn};

use parley_core::ids::{ConversationId, TurnId};
use parley_core::messages::EngineTurn;
use parley_store::{ChatStore, StoreError, TurnFields, TurnRecord, TurnWrite};

use crate::correlator::ToolCallCorrelator;

pub struct MessageLifecycle<'a, S: ChatStore> {
    store: &'a S,
    correlator: ToolCallCorrelator<'a, S>,
}

impl<'a, S: ChatStore> MessageLifecycle<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            correlator: ToolCallCorrelator::new(store),
        }
    }

    /// Create the empty assistant row that a later completion fills in.
    pub fn open_placeholder(&self, conversation_id: &ConversationId) -> Result<S::Turn, StoreError> {
        let turn = self.store.create_placeholder(conversation_id)?;
        debug!(turn_id = %turn.id(), "placeholder opened");
        Ok(turn)
    }

    /// Complete a placeholder from the engine's final turn data. Field update,
    /// result-token link and invocation creation are one atomic group.
    pub fn complete(
        &self,
        turn_id: &TurnId,
        conversation_id: &ConversationId,
        data: &EngineTurn,
    ) -> Result<S::Turn, StoreError> {
        let writes = self.completion_writes(turn_id, conversation_id, data)?;
        self.store.apply(&writes)?;
        debug!(%turn_id, role = %data.role, invocations = data.tool_calls.len(), "turn completed");
        self.store.turn(turn_id)
    }

    /// Persist a turn the engine reported without a preceding start event.
    /// The insert joins the completion group, so nothing remains if any part
    /// of it fails.
    pub fn create_complete(&self, conversation_id: &ConversationId, data: &EngineTurn) -> Result<S::Turn, StoreError> {
        let turn_id = TurnId::new();
        let mut writes = vec![TurnWrite::Create {
            turn_id: turn_id.clone(),
            conversation_id: conversation_id.clone(),
            role: data.role,
        }];
        writes.extend(self.completion_writes(&turn_id, conversation_id, data)?);
        self.store.apply(&writes)?;
        debug!(%turn_id, role = %data.role, invocations = data.tool_calls.len(), "turn created complete");
        self.store.turn(&turn_id)
    }

    /// Delete the placeholder if it never received content. Returns whether it was removed.
    pub fn rollback(&self, turn_id: &TurnId) -> Result<bool, StoreError> {
        let turn = match self.store.turn(turn_id) {
            Ok(turn) => turn,
            Err(StoreError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if !turn.is_empty() {
            return Ok(false);
        }
        let deleted = self.store.delete_turn(turn_id)?;
        warn!(%turn_id, "empty placeholder rolled back");
        Ok(deleted)
    }

    fn completion_writes(
        &self,
        turn_id: &TurnId,
        conversation_id: &ConversationId,
        data: &EngineTurn,
    ) -> Result<Vec<TurnWrite>, StoreError> {
        let mut writes = vec![TurnWrite::Finalize {
            turn_id: turn_id.clone(),
            fields: TurnFields {
                role: data.role,
                content: data.content.text.clone(),
                model_id: data.model_id.clone(),
                input_tokens: data.input_tokens,
                output_tokens: data.output_tokens,
            },
        }];
        if let Some(token) = &data.tool_call_id {
            if let Some(invocation_id) = self.correlator.resolve(conversation_id, token)? {
                writes.push(TurnWrite::LinkToolResult {
                    turn_id: turn_id.clone(),
                    invocation_id,
                });
            }
        }
        writes.extend(ToolCallCorrelator::<S>::invocation_writes(turn_id, &data.tool_calls));
        Ok(writes)
    }
}
