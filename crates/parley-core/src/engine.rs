//! Contract for the external conversation engine.
//!
//! The engine performs provider calls and keeps only transient state. Turn
//! lifecycle notifications are delivered to a [`TurnObserver`] passed to
//! [`EngineSession::complete`], synchronously and in order, before
//! `complete` returns.

use async_trait::async_trait;

use crate::errors::EngineError;
use crate::messages::{EngineTurn, ToolDefinition};

/// Returned by an observer to stop the engine mid-completion.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ObserverAbort(pub String);

/// Receives turn lifecycle notifications during a completion.
///
/// `turn_started` fires before the engine produces a turn; `turn_ended`
/// fires with the finished turn. A tool round emits one pair for the
/// assistant turn and one pair per tool result turn.
pub trait TurnObserver: Send {
    fn turn_started(&mut self) -> Result<(), ObserverAbort>;
    fn turn_ended(&mut self, turn: &EngineTurn) -> Result<(), ObserverAbort>;
}

/// Factory for engine sessions.
pub trait ConversationEngine: Send + Sync {
    type Session: EngineSession;

    fn new_session(&self, model_id: &str) -> Self::Session;
}

/// A transient, in-memory conversation with the model provider.
#[async_trait]
pub trait EngineSession: Send {
    fn model_id(&self) -> &str;

    /// Turns currently held by the session, in order.
    fn messages(&self) -> &[EngineTurn];

    fn add_message(&mut self, turn: EngineTurn);

    /// Drop all held turns.
    fn reset(&mut self);

    fn with_instructions(&mut self, instructions: &str, replace: bool) -> &mut Self;

    fn with_tool(&mut self, tool: ToolDefinition) -> &mut Self;

    /// Switch model. Returns an error if the engine does not know the model.
    fn with_model(&mut self, model_id: &str) -> Result<&mut Self, EngineError>;

    fn with_temperature(&mut self, temperature: f64) -> &mut Self;

    /// Run the model until it produces a final (non tool-call) turn.
    async fn complete(&mut self, observer: &mut dyn TurnObserver) -> Result<EngineTurn, EngineError>;
}
