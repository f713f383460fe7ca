//! Scripted conversation engine for deterministic tests without provider calls.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use parley_core::engine::{ConversationEngine, EngineSession, TurnObserver};
use parley_core::errors::EngineError;
use parley_core::messages::{EngineTurn, Role, ToolCall, ToolDefinition};

pub const MOCK_MODEL: &str = "mock-model";

/// Pre-programmed outcome of one engine round.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Emit turn-started and turn-ended for this turn. If it requests tools,
    /// answer each from the canned outputs and continue with the next response.
    Reply(EngineTurn),
    /// Emit turn-started, then fail.
    FailAfterStart(EngineError),
    /// Fail before any event.
    FailBeforeStart(EngineError),
    /// Emit turn-started, then return this turn without a turn-ended event.
    ReturnWithoutEnd(EngineTurn),
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self::Reply(EngineTurn::assistant(text).with_usage(MOCK_MODEL, 10, 20))
    }

    pub fn tool_call(token: &str, name: &str, arguments: serde_json::Value) -> Self {
        let call = ToolCall {
            id: token.to_string(),
            name: name.to_string(),
            arguments: arguments.as_object().cloned().unwrap_or_default(),
        };
        Self::Reply(EngineTurn::assistant("").with_usage(MOCK_MODEL, 10, 5).with_tool_call(call))
    }
}

#[derive(Default)]
struct MockState {
    script: Mutex<VecDeque<MockResponse>>,
    tool_outputs: Mutex<HashMap<String, String>>,
    sessions: AtomicUsize,
    completions: AtomicUsize,
}

/// Engine whose sessions pop responses from one shared script.
#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<MockState>,
}

impl MockEngine {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        let engine = Self::default();
        engine.state.script.lock().extend(responses);
        engine
    }

    pub fn push(&self, response: MockResponse) {
        self.state.script.lock().push_back(response);
    }

    /// Canned output returned whenever a tool with this name is called.
    pub fn with_tool_output(self, name: &str, output: &str) -> Self {
        let _ = self.state.tool_outputs.lock().insert(name.to_string(), output.to_string());
        self
    }

    pub fn sessions_created(&self) -> usize {
        self.state.sessions.load(Ordering::Relaxed)
    }

    pub fn completions(&self) -> usize {
        self.state.completions.load(Ordering::Relaxed)
    }

    pub fn remaining(&self) -> usize {
        self.state.script.lock().len()
    }
}

impl ConversationEngine for MockEngine {
    type Session = MockSession;

    fn new_session(&self, model_id: &str) -> MockSession {
        let _ = self.state.sessions.fetch_add(1, Ordering::Relaxed);
        MockSession {
            state: self.state.clone(),
            model_id: model_id.to_string(),
            messages: Vec::new(),
            added: 0,
            tools: Vec::new(),
            temperature: None,
        }
    }
}

pub struct MockSession {
    state: Arc<MockState>,
    model_id: String,
    messages: Vec<EngineTurn>,
    added: usize,
    tools: Vec<ToolDefinition>,
    temperature: Option<f64>,
}

impl MockSession {
    /// Number of `add_message` calls since the session was created.
    pub fn added(&self) -> usize {
        self.added
    }

    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    pub fn temperature(&self) -> Option<f64> {
        self.temperature
    }

    pub fn instructions(&self) -> Vec<&str> {
        self.messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.text.as_str())
            .collect()
    }

    fn emit(&mut self, observer: &mut dyn TurnObserver, turn: &EngineTurn) -> Result<(), EngineError> {
        observer.turn_started().map_err(|e| EngineError::Aborted(e.0))?;
        observer.turn_ended(turn).map_err(|e| EngineError::Aborted(e.0))?;
        self.messages.push(turn.clone());
        Ok(())
    }
}

#[async_trait]
impl EngineSession for MockSession {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn messages(&self) -> &[EngineTurn] {
        &self.messages
    }

    fn add_message(&mut self, turn: EngineTurn) {
        self.added += 1;
        self.messages.push(turn);
    }

    fn reset(&mut self) {
        self.messages.clear();
    }

    fn with_instructions(&mut self, instructions: &str, replace: bool) -> &mut Self {
        if replace {
            self.messages.retain(|m| m.role != Role::System);
        }
        self.messages.push(EngineTurn::new(
            Role::System,
            parley_core::messages::EngineContent::text(instructions),
        ));
        self
    }

    fn with_tool(&mut self, tool: ToolDefinition) -> &mut Self {
        self.tools.push(tool);
        self
    }

    fn with_model(&mut self, model_id: &str) -> Result<&mut Self, EngineError> {
        if model_id.trim().is_empty() {
            return Err(EngineError::InvalidRequest("model id must not be blank".into()));
        }
        self.model_id = model_id.to_string();
        Ok(self)
    }

    fn with_temperature(&mut self, temperature: f64) -> &mut Self {
        self.temperature = Some(temperature);
        self
    }

    async fn complete(&mut self, observer: &mut dyn TurnObserver) -> Result<EngineTurn, EngineError> {
        let _ = self.state.completions.fetch_add(1, Ordering::Relaxed);
        loop {
            let next = self.state.script.lock().pop_front();
            let response = next.ok_or_else(|| EngineError::InvalidRequest("MockEngine: no response scripted".into()))?;
            tokio::task::yield_now().await;

            let (mut turn, ends) = match response {
                MockResponse::FailBeforeStart(e) => return Err(e),
                MockResponse::FailAfterStart(e) => {
                    observer.turn_started().map_err(|abort| EngineError::Aborted(abort.0))?;
                    return Err(e);
                }
                MockResponse::Reply(turn) => (turn, true),
                MockResponse::ReturnWithoutEnd(turn) => (turn, false),
            };
            if turn.model_id.is_none() {
                turn.model_id = Some(self.model_id.clone());
            }
            if !ends {
                observer.turn_started().map_err(|abort| EngineError::Aborted(abort.0))?;
                self.messages.push(turn.clone());
                return Ok(turn);
            }
            self.emit(observer, &turn)?;
            if !turn.is_tool_call() {
                return Ok(turn);
            }

            for call in turn.tool_calls.values() {
                let output = self
                    .state
                    .tool_outputs
                    .lock()
                    .get(&call.name)
                    .cloned()
                    .unwrap_or_else(|| format!("unknown tool: {}", call.name));
                self.emit(observer, &EngineTurn::tool_result(call.id.clone(), output))?;
            }
        }
    }
}
