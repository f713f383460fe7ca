use tracing::{debug, instrument};

use parley_core::ids::{ConversationId, ToolInvocationId, TurnId};
use parley_core::messages::Role;

use crate::conversations::ConversationRepo;
use crate::database::Database;
use crate::error::StoreError;
use crate::records::{ChatStore, ConversationRow, ToolInvocationRow, TurnRow, TurnState, TurnWrite};
use crate::tool_invocations::ToolInvocationRepo;
use crate::turns::TurnRepo;

/// [`ChatStore`] over SQLite.
///
/// When `touch_conversation` is set, every turn write also bumps the owning
/// conversation's `updated_at` inside the same transaction.
#[derive(Clone)]
pub struct SqliteChatStore {
    db: Database,
    touch_conversation: bool,
}

impl SqliteChatStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            touch_conversation: false,
        }
    }

    pub fn with_touch_conversation(mut self, touch: bool) -> Self {
        self.touch_conversation = touch;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn touch(&self, conn: &rusqlite::Connection, conversation_id: &ConversationId) -> Result<(), StoreError> {
        if self.touch_conversation {
            ConversationRepo::touch(conn, conversation_id)?;
        }
        Ok(())
    }

    fn insert_turn(
        &self,
        conversation_id: &ConversationId,
        role: Role,
        content: &str,
        state: TurnState,
    ) -> Result<TurnRow, StoreError> {
        self.db.with_tx(|tx| {
            if !ConversationRepo::exists(tx, conversation_id)? {
                return Err(StoreError::NotFound(format!("conversation {conversation_id}")));
            }
            let turn = TurnRepo::insert(tx, conversation_id, role, content, state)?;
            self.touch(tx, conversation_id)?;
            Ok(turn)
        })
    }
}

impl ChatStore for SqliteChatStore {
    type Conversation = ConversationRow;
    type Turn = TurnRow;
    type ToolInvocation = ToolInvocationRow;

    #[instrument(skip_all, fields(model_id = %model_id))]
    fn create_conversation(&self, model_id: &str) -> Result<ConversationRow, StoreError> {
        self.db.with_conn(|conn| ConversationRepo::insert(conn, model_id))
    }

    fn conversation(&self, id: &ConversationId) -> Result<ConversationRow, StoreError> {
        self.db.with_conn(|conn| ConversationRepo::get(conn, id))
    }

    #[instrument(skip_all, fields(conversation_id = %id, model_id = %model_id))]
    fn set_conversation_model(&self, id: &ConversationId, model_id: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| ConversationRepo::set_model(conn, id, model_id))
    }

    #[instrument(skip_all, fields(conversation_id = %id))]
    fn delete_conversation(&self, id: &ConversationId) -> Result<bool, StoreError> {
        self.db.with_tx(|tx| ConversationRepo::delete(tx, id))
    }

    #[instrument(skip_all, fields(conversation_id = %conversation_id, role = %role))]
    fn create_turn(&self, conversation_id: &ConversationId, role: Role, content: &str) -> Result<TurnRow, StoreError> {
        self.insert_turn(conversation_id, role, content, TurnState::Complete)
    }

    #[instrument(skip_all, fields(conversation_id = %conversation_id))]
    fn create_placeholder(&self, conversation_id: &ConversationId) -> Result<TurnRow, StoreError> {
        self.insert_turn(conversation_id, Role::Assistant, "", TurnState::Empty)
    }

    #[instrument(skip_all, fields(conversation_id = %conversation_id))]
    fn replace_system_turns(&self, conversation_id: &ConversationId, content: &str) -> Result<TurnRow, StoreError> {
        self.db.with_tx(|tx| {
            if !ConversationRepo::exists(tx, conversation_id)? {
                return Err(StoreError::NotFound(format!("conversation {conversation_id}")));
            }
            let existing = TurnRepo::ids_by_role(tx, conversation_id, Role::System)?;
            for id in &existing {
                let _ = TurnRepo::delete(tx, id)?;
            }
            debug!(replaced = existing.len(), "system turns replaced");
            let turn = TurnRepo::insert(tx, conversation_id, Role::System, content, TurnState::Complete)?;
            self.touch(tx, conversation_id)?;
            Ok(turn)
        })
    }

    fn turn(&self, id: &TurnId) -> Result<TurnRow, StoreError> {
        self.db.with_conn(|conn| TurnRepo::get(conn, id))
    }

    fn turns(&self, conversation_id: &ConversationId) -> Result<Vec<TurnRow>, StoreError> {
        self.db.with_conn(|conn| TurnRepo::list_by_conversation(conn, conversation_id))
    }

    #[instrument(skip_all, fields(turn_id = %id))]
    fn delete_turn(&self, id: &TurnId) -> Result<bool, StoreError> {
        self.db.with_tx(|tx| {
            let conversation = TurnRepo::conversation_of(tx, id)?;
            let deleted = TurnRepo::delete(tx, id)?;
            if let Some(conversation_id) = conversation {
                self.touch(tx, &conversation_id)?;
            }
            Ok(deleted)
        })
    }

    fn tool_invocation(&self, id: &ToolInvocationId) -> Result<ToolInvocationRow, StoreError> {
        self.db.with_conn(|conn| ToolInvocationRepo::get(conn, id))
    }

    fn tool_invocations(&self, turn_id: &TurnId) -> Result<Vec<ToolInvocationRow>, StoreError> {
        self.db.with_conn(|conn| ToolInvocationRepo::list_by_turn(conn, turn_id))
    }

    fn find_tool_invocation(
        &self,
        conversation_id: &ConversationId,
        correlation_id: &str,
    ) -> Result<Option<ToolInvocationRow>, StoreError> {
        self.db
            .with_conn(|conn| ToolInvocationRepo::find_in_conversation(conn, conversation_id, correlation_id))
    }

    #[instrument(skip_all, fields(writes = writes.len()))]
    fn apply(&self, writes: &[TurnWrite]) -> Result<(), StoreError> {
        self.db.with_tx(|tx| {
            let mut touched: Vec<ConversationId> = Vec::new();
            for write in writes {
                let turn_id = match write {
                    TurnWrite::Create {
                        turn_id,
                        conversation_id,
                        role,
                    } => {
                        if !ConversationRepo::exists(tx, conversation_id)? {
                            return Err(StoreError::NotFound(format!("conversation {conversation_id}")));
                        }
                        let _ = TurnRepo::insert_with_id(tx, turn_id.clone(), conversation_id, *role, "", TurnState::Empty)?;
                        turn_id
                    }
                    TurnWrite::Finalize { turn_id, fields } => {
                        TurnRepo::finalize(tx, turn_id, fields)?;
                        turn_id
                    }
                    TurnWrite::LinkToolResult { turn_id, invocation_id } => {
                        TurnRepo::link_tool_result(tx, turn_id, invocation_id)?;
                        turn_id
                    }
                    TurnWrite::CreateToolInvocation { turn_id, invocation } => {
                        let _ = ToolInvocationRepo::insert(tx, turn_id, invocation)?;
                        turn_id
                    }
                };
                if self.touch_conversation {
                    if let Some(conversation_id) = TurnRepo::conversation_of(tx, turn_id)? {
                        if !touched.contains(&conversation_id) {
                            touched.push(conversation_id);
                        }
                    }
                }
            }
            for conversation_id in &touched {
                ConversationRepo::touch(tx, conversation_id)?;
            }
            Ok(())
        })
    }
}
