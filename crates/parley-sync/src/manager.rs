//! Binds persisted conversations to engine sessions and keeps them in sync.

use tracing::{debug, info, instrument, warn};

use parley_core::blob::BlobStore;
use parley_core::engine::{ConversationEngine, EngineSession, ObserverAbort, TurnObserver};
use parley_core::errors::EngineError;
use parley_core::ids::{ConversationId, TurnId};
use parley_core::messages::{EngineContent, EngineTurn, Role, ToolDefinition};
use parley_store::{ChatStore, ConversationRecord, Database, SqliteBlobStore, SqliteChatStore, TurnRecord};

use crate::attachments::{AttachmentNormalizer, AttachmentSource};
use crate::correlator::ToolCallCorrelator;
use crate::error::SyncError;
use crate::lifecycle::MessageLifecycle;
use crate::settings::{AttachmentSettings, SyncSettings};

/// An engine session bound to the conversation it was replayed from.
pub struct BoundSession<T> {
    conversation_id: ConversationId,
    session: T,
}

impl<T: EngineSession> BoundSession<T> {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn session(&self) -> &T {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut T {
        &mut self.session
    }

    pub fn into_session(self) -> T {
        self.session
    }
}

/// Top-level orchestrator over a store, an engine and a blob store, all picked
/// once at construction.
pub struct ChatSync<S, E, B> {
    store: S,
    engine: E,
    blobs: B,
    normalizer: AttachmentNormalizer,
    default_model: String,
}

impl<E: ConversationEngine> ChatSync<SqliteChatStore, E, SqliteBlobStore> {
    /// Open the SQLite stack described by `settings`.
    pub fn open(settings: &SyncSettings, engine: E) -> Result<Self, SyncError> {
        let db = Database::open(&settings.database_path)?;
        let store = SqliteChatStore::new(db.clone()).with_touch_conversation(settings.touch_conversation);
        Ok(Self::new(store, engine, SqliteBlobStore::new(db))
            .with_attachment_settings(&settings.attachments)
            .with_default_model(&settings.default_model))
    }
}

impl<S, E, B> ChatSync<S, E, B>
where
    S: ChatStore,
    E: ConversationEngine,
    B: BlobStore,
{
    pub fn new(store: S, engine: E, blobs: B) -> Self {
        Self {
            store,
            engine,
            blobs,
            normalizer: AttachmentNormalizer::default(),
            default_model: SyncSettings::default().default_model,
        }
    }

    pub fn with_default_model(mut self, model_id: &str) -> Self {
        self.default_model = model_id.to_string();
        self
    }

    pub fn with_attachment_settings(mut self, settings: &AttachmentSettings) -> Self {
        self.normalizer = AttachmentNormalizer::new(settings);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn blobs(&self) -> &B {
        &self.blobs
    }

    #[instrument(skip(self))]
    pub fn create_conversation(&self, model_id: &str) -> Result<S::Conversation, SyncError> {
        let conversation = self.store.create_conversation(model_id)?;
        info!(conversation_id = %conversation.id(), "conversation created");
        Ok(conversation)
    }

    /// New conversation on the configured default model.
    pub fn start_conversation(&self) -> Result<S::Conversation, SyncError> {
        self.create_conversation(&self.default_model)
    }

    pub fn conversation(&self, id: &ConversationId) -> Result<S::Conversation, SyncError> {
        Ok(self.store.conversation(id)?)
    }

    #[instrument(skip_all, fields(conversation_id = %id))]
    pub fn delete_conversation(&self, id: &ConversationId) -> Result<bool, SyncError> {
        let deleted = self.store.delete_conversation(id)?;
        if deleted {
            info!("conversation deleted");
        }
        Ok(deleted)
    }

    /// Turns in ascending creation order.
    pub fn turns(&self, conversation_id: &ConversationId) -> Result<Vec<S::Turn>, SyncError> {
        Ok(self.store.turns(conversation_id)?)
    }

    #[instrument(skip_all, fields(turn_id = %id))]
    pub fn delete_turn(&self, id: &TurnId) -> Result<bool, SyncError> {
        Ok(self.store.delete_turn(id)?)
    }

    /// Fresh engine session with every persisted turn replayed in order.
    #[instrument(skip_all, fields(conversation_id = %conversation_id))]
    pub fn bind(&self, conversation_id: &ConversationId) -> Result<BoundSession<E::Session>, SyncError> {
        let conversation = self.store.conversation(conversation_id)?;
        let mut session = self.engine.new_session(conversation.model_id());
        session.reset();

        let turns = self.store.turns(conversation_id)?;
        for turn in &turns {
            session.add_message(self.to_engine_turn(turn)?);
        }
        debug!(replayed = turns.len(), "conversation bound");

        Ok(BoundSession {
            conversation_id: conversation_id.clone(),
            session,
        })
    }

    /// Engine-facing form of a persisted turn.
    pub fn to_engine_turn(&self, turn: &S::Turn) -> Result<EngineTurn, SyncError> {
        let correlator = ToolCallCorrelator::new(&self.store);
        let stored = self.blobs.attachments(turn.id())?;

        let mut engine_turn = EngineTurn::new(turn.role(), self.normalizer.to_engine_content(turn.content(), &stored));
        engine_turn.model_id = turn.model_id().map(str::to_string);
        engine_turn.input_tokens = turn.input_tokens();
        engine_turn.output_tokens = turn.output_tokens();
        engine_turn.tool_calls = correlator.tool_calls(turn.id())?;
        engine_turn.tool_call_id = correlator.result_token(turn)?;
        Ok(engine_turn)
    }

    /// Persist a user turn with its attachments and append it to the session.
    #[instrument(skip_all, fields(conversation_id = %bound.conversation_id))]
    pub fn create_user_turn(
        &self,
        bound: &mut BoundSession<E::Session>,
        text: &str,
        attachments: Option<&AttachmentSource>,
    ) -> Result<S::Turn, SyncError> {
        let descriptors = attachments
            .map(|source| self.normalizer.normalize(source))
            .unwrap_or_default();

        let turn = self.store.create_turn(&bound.conversation_id, Role::User, text)?;
        if !descriptors.is_empty() {
            if let Err(e) = self.blobs.attach(turn.id(), &descriptors) {
                let _ = self.store.delete_turn(turn.id())?;
                return Err(e.into());
            }
        }

        bound.session.add_message(EngineTurn::new(
            Role::User,
            EngineContent {
                text: text.to_string(),
                attachments: descriptors,
            },
        ));
        Ok(turn)
    }

    /// Create the user turn, then run the engine to completion.
    pub async fn ask(
        &self,
        bound: &mut BoundSession<E::Session>,
        text: &str,
        attachments: Option<&AttachmentSource>,
    ) -> Result<S::Turn, SyncError> {
        self.ask_with(bound, text, attachments, &mut NoHooks).await
    }

    /// [`ChatSync::ask`] with caller hooks; see [`ChatSync::complete_with`].
    pub async fn ask_with(
        &self,
        bound: &mut BoundSession<E::Session>,
        text: &str,
        attachments: Option<&AttachmentSource>,
        hooks: &mut dyn TurnObserver,
    ) -> Result<S::Turn, SyncError> {
        let _ = self.create_user_turn(bound, text, attachments)?;
        self.complete_with(bound, hooks).await
    }

    /// Run the engine without adding a user turn. Turn events are persisted as
    /// they arrive; on failure an empty placeholder is rolled back and the
    /// original error is returned.
    pub async fn complete(&self, bound: &mut BoundSession<E::Session>) -> Result<S::Turn, SyncError> {
        self.complete_with(bound, &mut NoHooks).await
    }

    /// [`ChatSync::complete`] that forwards every turn event to `hooks` once
    /// it has been persisted. A hook that aborts stops the engine; the
    /// caller gets `EngineError::Aborted` with the hook's message.
    #[instrument(skip_all, fields(conversation_id = %bound.conversation_id))]
    pub async fn complete_with(
        &self,
        bound: &mut BoundSession<E::Session>,
        hooks: &mut dyn TurnObserver,
    ) -> Result<S::Turn, SyncError> {
        let mut observer = PersistingObserver {
            lifecycle: MessageLifecycle::new(&self.store),
            blobs: &self.blobs,
            conversation_id: &bound.conversation_id,
            hooks,
            placeholder: None,
            last: None,
            failure: None,
        };

        match bound.session.complete(&mut observer).await {
            Ok(data) => {
                if observer.placeholder.is_none() {
                    if let Some(last) = observer.last.take() {
                        return Ok(last);
                    }
                }
                // The engine returned a turn it never reported as ended.
                let turn = match observer.finish(&data) {
                    Ok(turn) => turn,
                    Err(e) => {
                        observer.rollback_open();
                        return Err(e);
                    }
                };
                observer
                    .hooks
                    .turn_ended(&data)
                    .map_err(|abort| SyncError::Engine(EngineError::Aborted(abort.0)))?;
                Ok(turn)
            }
            Err(engine_error) => {
                observer.rollback_open();
                Err(observer.failure.take().unwrap_or(SyncError::Engine(engine_error)))
            }
        }
    }

    /// Persist a system turn and forward the instructions to the engine. With
    /// `replace`, existing system turns are deleted in the same write.
    #[instrument(skip_all, fields(conversation_id = %bound.conversation_id, replace = replace))]
    pub fn with_instructions<'b>(
        &self,
        bound: &'b mut BoundSession<E::Session>,
        instructions: &str,
        replace: bool,
    ) -> Result<&'b mut BoundSession<E::Session>, SyncError> {
        if replace {
            let _ = self.store.replace_system_turns(&bound.conversation_id, instructions)?;
        } else {
            let _ = self.store.create_turn(&bound.conversation_id, Role::System, instructions)?;
        }
        let _ = bound.session.with_instructions(instructions, replace);
        Ok(bound)
    }

    /// Switch the engine's model and persist the one it resolved to.
    #[instrument(skip(self, bound), fields(conversation_id = %bound.conversation_id))]
    pub fn with_model<'b>(
        &self,
        bound: &'b mut BoundSession<E::Session>,
        model_id: &str,
    ) -> Result<&'b mut BoundSession<E::Session>, SyncError> {
        let resolved = bound.session.with_model(model_id)?.model_id().to_string();
        self.store.set_conversation_model(&bound.conversation_id, &resolved)?;
        Ok(bound)
    }

    pub fn with_tool<'b>(
        &self,
        bound: &'b mut BoundSession<E::Session>,
        tool: ToolDefinition,
    ) -> &'b mut BoundSession<E::Session> {
        let _ = bound.session.with_tool(tool);
        bound
    }

    pub fn with_tools<'b>(
        &self,
        bound: &'b mut BoundSession<E::Session>,
        tools: impl IntoIterator<Item = ToolDefinition>,
    ) -> &'b mut BoundSession<E::Session> {
        for tool in tools {
            let _ = bound.session.with_tool(tool);
        }
        bound
    }

    pub fn with_temperature<'b>(
        &self,
        bound: &'b mut BoundSession<E::Session>,
        temperature: f64,
    ) -> &'b mut BoundSession<E::Session> {
        let _ = bound.session.with_temperature(temperature);
        bound
    }
}

/// Turn hooks that accept every event.
struct NoHooks;

impl TurnObserver for NoHooks {
    fn turn_started(&mut self) -> Result<(), ObserverAbort> {
        Ok(())
    }

    fn turn_ended(&mut self, _turn: &EngineTurn) -> Result<(), ObserverAbort> {
        Ok(())
    }
}

/// Persists engine turn events as they happen, then hands them to the
/// caller's hooks. Keeps the real failure so the caller sees it instead of
/// the engine's generic abort.
struct PersistingObserver<'a, S: ChatStore, B: BlobStore> {
    lifecycle: MessageLifecycle<'a, S>,
    blobs: &'a B,
    conversation_id: &'a ConversationId,
    hooks: &'a mut dyn TurnObserver,
    /// Placeholder opened by the last start event and not yet completed.
    placeholder: Option<TurnId>,
    last: Option<S::Turn>,
    failure: Option<SyncError>,
}

impl<S: ChatStore, B: BlobStore> PersistingObserver<'_, S, B> {
    fn abort(&mut self, error: SyncError) -> ObserverAbort {
        let abort = ObserverAbort(error.to_string());
        self.failure = Some(error);
        abort
    }

    fn rollback_open(&mut self) {
        if let Some(open) = self.placeholder.take() {
            if let Err(e) = self.lifecycle.rollback(&open) {
                warn!(turn_id = %open, error = %e, "placeholder rollback failed");
            }
        }
    }

    /// Complete the open placeholder (or create the turn) and store its
    /// attachments. The placeholder stays open if completion fails.
    fn finish(&mut self, data: &EngineTurn) -> Result<S::Turn, SyncError> {
        let turn = match &self.placeholder {
            Some(open) => self.lifecycle.complete(open, self.conversation_id, data)?,
            None => self.lifecycle.create_complete(self.conversation_id, data)?,
        };
        self.placeholder = None;
        if data.content.has_attachments() {
            let _ = self.blobs.attach(turn.id(), &data.content.attachments)?;
        }
        Ok(turn)
    }
}

impl<S: ChatStore, B: BlobStore> TurnObserver for PersistingObserver<'_, S, B> {
    fn turn_started(&mut self) -> Result<(), ObserverAbort> {
        if let Some(stale) = self.placeholder.take() {
            if let Err(e) = self.lifecycle.rollback(&stale) {
                return Err(self.abort(e.into()));
            }
        }
        match self.lifecycle.open_placeholder(self.conversation_id) {
            Ok(turn) => self.placeholder = Some(turn.id().clone()),
            Err(e) => return Err(self.abort(e.into())),
        }
        self.hooks.turn_started()
    }

    fn turn_ended(&mut self, turn: &EngineTurn) -> Result<(), ObserverAbort> {
        match self.finish(turn) {
            Ok(persisted) => self.last = Some(persisted),
            Err(e) => return Err(self.abort(e)),
        }
        self.hooks.turn_ended(turn)
    }
}

#[cfg(test)]
mod tests {
    use parley_core::attachments::AttachmentDescriptor;
    use parley_core::blob::StoredBlob;
    use parley_core::errors::EngineError;
    use parley_store::{Database, SqliteBlobStore, SqliteChatStore, TurnState};

    use super::*;
    use crate::mock::{MockEngine, MockResponse, MOCK_MODEL};

    type TestSync = ChatSync<SqliteChatStore, MockEngine, SqliteBlobStore>;

    fn sync(responses: Vec<MockResponse>) -> TestSync {
        let db = Database::in_memory().unwrap();
        ChatSync::new(
            SqliteChatStore::new(db.clone()),
            MockEngine::new(responses),
            SqliteBlobStore::new(db),
        )
    }

    #[tokio::test]
    async fn ask_persists_user_and_assistant() {
        let sync = sync(vec![MockResponse::text("hi there")]);
        let conv = sync.create_conversation("m").unwrap();
        let mut bound = sync.bind(&conv.id).unwrap();

        let reply = sync.ask(&mut bound, "hello", None).await.unwrap();
        assert_eq!(reply.content, "hi there");
        assert_eq!(reply.state, TurnState::Complete);
        assert_eq!(reply.model_id.as_deref(), Some(MOCK_MODEL));

        let roles: Vec<_> = sync.turns(&conv.id).unwrap().iter().map(|t| t.role).collect();
        assert_eq!(roles, [Role::User, Role::Assistant]);
    }

    /// Records each event with the number of turns persisted at that moment.
    struct Hooks {
        store: SqliteChatStore,
        conversation_id: ConversationId,
        events: Vec<String>,
        abort_on_start: bool,
    }

    impl Hooks {
        fn persisted(&self) -> usize {
            self.store.turns(&self.conversation_id).unwrap().len()
        }
    }

    impl TurnObserver for Hooks {
        fn turn_started(&mut self) -> Result<(), ObserverAbort> {
            if self.abort_on_start {
                return Err(ObserverAbort("stop".into()));
            }
            let line = format!("started:{}", self.persisted());
            self.events.push(line);
            Ok(())
        }

        fn turn_ended(&mut self, turn: &EngineTurn) -> Result<(), ObserverAbort> {
            let line = format!("ended:{}:{}", turn.role, self.persisted());
            self.events.push(line);
            Ok(())
        }
    }

    #[tokio::test]
    async fn hooks_fire_in_order_after_each_write() {
        let sync = sync(vec![
            MockResponse::tool_call("t1", "calculator", serde_json::json!({"expression": "2 + 2"})),
            MockResponse::text("it is 4"),
        ]);
        let conv = sync.create_conversation("m").unwrap();
        let mut bound = sync.bind(&conv.id).unwrap();
        let mut hooks = Hooks {
            store: sync.store().clone(),
            conversation_id: conv.id.clone(),
            events: Vec::new(),
            abort_on_start: false,
        };

        let reply = sync.ask_with(&mut bound, "what is 2 + 2?", None, &mut hooks).await.unwrap();
        assert_eq!(reply.content, "it is 4");
        assert_eq!(
            hooks.events,
            [
                "started:2",
                "ended:assistant:2",
                "started:3",
                "ended:tool:3",
                "started:4",
                "ended:assistant:4",
            ]
        );
    }

    #[tokio::test]
    async fn aborting_hook_stops_the_engine_and_rolls_back() {
        let sync = sync(vec![MockResponse::text("never stored")]);
        let conv = sync.create_conversation("m").unwrap();
        let mut bound = sync.bind(&conv.id).unwrap();
        let mut hooks = Hooks {
            store: sync.store().clone(),
            conversation_id: conv.id.clone(),
            events: Vec::new(),
            abort_on_start: true,
        };

        let err = sync.ask_with(&mut bound, "hello", None, &mut hooks).await.unwrap_err();
        assert!(matches!(err, SyncError::Engine(EngineError::Aborted(ref msg)) if msg == "stop"), "{err:?}");
        let roles: Vec<_> = sync.turns(&conv.id).unwrap().iter().map(|t| t.role).collect();
        assert_eq!(roles, [Role::User]);
    }

    #[tokio::test]
    async fn turn_returned_without_end_event_keeps_its_attachments() {
        let reply = EngineTurn::new(
            Role::Assistant,
            EngineContent {
                text: "here is the chart".into(),
                attachments: vec![AttachmentDescriptor::new(b"png".to_vec(), "chart.png", None)],
            },
        );
        let sync = sync(vec![MockResponse::ReturnWithoutEnd(reply)]);
        let conv = sync.create_conversation("m").unwrap();
        let mut bound = sync.bind(&conv.id).unwrap();

        let turn = sync.ask(&mut bound, "draw it", None).await.unwrap();
        assert_eq!(turn.state, TurnState::Complete);
        assert_eq!(turn.content, "here is the chart");
        let stored = sync.blobs().attachments(&turn.id).unwrap();
        let names: Vec<_> = stored.iter().map(|b| b.filename()).collect();
        assert_eq!(names, ["chart.png"]);
        assert_eq!(sync.turns(&conv.id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failure_after_start_rolls_back_placeholder() {
        let sync = sync(vec![MockResponse::FailAfterStart(EngineError::Timeout(
            std::time::Duration::from_secs(1),
        ))]);
        let conv = sync.create_conversation("m").unwrap();
        let mut bound = sync.bind(&conv.id).unwrap();

        let err = sync.ask(&mut bound, "hello", None).await.unwrap_err();
        assert!(matches!(err, SyncError::Engine(EngineError::Timeout(_))));
        let turns = sync.turns(&conv.id).unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, Role::User);
    }

    #[tokio::test]
    async fn store_failure_inside_observer_surfaces_as_store_error() {
        let sync = sync(vec![MockResponse::text("orphan")]);
        let conv = sync.create_conversation("m").unwrap();
        let mut bound = sync.bind(&conv.id).unwrap();
        assert!(sync.delete_conversation(&conv.id).unwrap());

        let err = sync.complete(&mut bound).await.unwrap_err();
        assert!(matches!(err, SyncError::Store(_)), "{err:?}");
    }

    #[test]
    fn open_wires_settings() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SyncSettings {
            default_model: "m-default".into(),
            database_path: dir.path().join("db").join("parley.db"),
            touch_conversation: true,
            ..SyncSettings::default()
        };
        let sync = ChatSync::open(&settings, MockEngine::default()).unwrap();
        let conv = sync.start_conversation().unwrap();
        assert_eq!(conv.model_id, "m-default");
        assert!(settings.database_path.exists());
    }

    #[tokio::test]
    async fn with_model_persists_resolved_model() {
        let sync = sync(Vec::new());
        let conv = sync.create_conversation("m").unwrap();
        let mut bound = sync.bind(&conv.id).unwrap();

        let _ = sync.with_model(&mut bound, "m-large").unwrap();
        assert_eq!(sync.conversation(&conv.id).unwrap().model_id, "m-large");
        assert!(matches!(sync.with_model(&mut bound, ""), Err(SyncError::Engine(_))));
        assert_eq!(sync.conversation(&conv.id).unwrap().model_id, "m-large");
    }

    #[tokio::test]
    async fn tool_and_temperature_chain() {
        let sync = sync(Vec::new());
        let conv = sync.create_conversation("m").unwrap();
        let mut bound = sync.bind(&conv.id).unwrap();
        let tool = ToolDefinition {
            name: "calculator".into(),
            description: "Evaluates arithmetic".into(),
            parameters_schema: serde_json::json!({"type": "object"}),
        };

        let bound = sync.with_temperature(sync.with_tool(&mut bound, tool), 0.3);
        assert_eq!(bound.session().tools().len(), 1);
        assert_eq!(bound.session().temperature(), Some(0.3));
    }

    #[tokio::test]
    async fn with_tools_registers_each_in_order() {
        let sync = sync(Vec::new());
        let conv = sync.create_conversation("m").unwrap();
        let mut bound = sync.bind(&conv.id).unwrap();
        let tools = ["search", "calculator"].map(|name| ToolDefinition {
            name: name.into(),
            description: String::new(),
            parameters_schema: serde_json::json!({"type": "object"}),
        });

        let bound = sync.with_tools(&mut bound, tools);
        let names: Vec<_> = bound.session().tools().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["search", "calculator"]);
    }
}
