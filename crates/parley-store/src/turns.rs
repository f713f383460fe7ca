use rusqlite::{params, Connection, OptionalExtension};

use parley_core::ids::{ConversationId, ToolInvocationId, TurnId};
use parley_core::messages::Role;

use crate::error::StoreError;
use crate::records::{TurnFields, TurnRow, TurnState};
use crate::row_helpers;

const TURN_COLUMNS: &str = "id, conversation_id, role, content, state, model_id, input_tokens, output_tokens,
                            tool_invocation_id, created_at, updated_at";

/// Turn repository. Stateless: every method takes `&Connection`.
pub struct TurnRepo;

impl TurnRepo {
    /// Insert a turn. `created_at` never precedes the newest turn already in
    /// the conversation, so creation order stays monotonic even if the clock
    /// steps backwards.
    pub fn insert(
        conn: &Connection,
        conversation_id: &ConversationId,
        role: Role,
        content: &str,
        state: TurnState,
    ) -> Result<TurnRow, StoreError> {
        Self::insert_with_id(conn, TurnId::new(), conversation_id, role, content, state)
    }

    /// [`TurnRepo::insert`] with a caller-chosen id.
    pub fn insert_with_id(
        conn: &Connection,
        id: TurnId,
        conversation_id: &ConversationId,
        role: Role,
        content: &str,
        state: TurnState,
    ) -> Result<TurnRow, StoreError> {
        let now = row_helpers::timestamp();
        let latest: Option<String> = conn.query_row(
            "SELECT MAX(created_at) FROM turns WHERE conversation_id = ?1",
            [conversation_id.as_str()],
            |row| row.get(0),
        )?;
        let created_at = match latest {
            Some(latest) if latest > now => latest,
            _ => now.clone(),
        };

        let _ = conn.execute(
            "INSERT INTO turns (id, conversation_id, role, content, state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.as_str(),
                conversation_id.as_str(),
                role.as_str(),
                content,
                state.as_str(),
                created_at,
                now,
            ],
        )?;

        Ok(TurnRow {
            id,
            conversation_id: conversation_id.clone(),
            role,
            content: content.to_string(),
            state,
            model_id: None,
            input_tokens: None,
            output_tokens: None,
            tool_invocation_id: None,
            created_at,
            updated_at: now,
        })
    }

    pub fn get(conn: &Connection, id: &TurnId) -> Result<TurnRow, StoreError> {
        let sql = format!("SELECT {TURN_COLUMNS} FROM turns WHERE id = ?1");
        conn.query_row(&sql, [id.as_str()], |row| Ok(row_to_turn(row)))
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("turn {id}")))?
    }

    /// All turns of a conversation in creation order (insertion order breaks ties).
    pub fn list_by_conversation(
        conn: &Connection,
        conversation_id: &ConversationId,
    ) -> Result<Vec<TurnRow>, StoreError> {
        let sql = format!(
            "SELECT {TURN_COLUMNS} FROM turns WHERE conversation_id = ?1 ORDER BY created_at ASC, rowid ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([conversation_id.as_str()])?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            results.push(row_to_turn(row)?);
        }
        Ok(results)
    }

    pub fn ids_by_role(
        conn: &Connection,
        conversation_id: &ConversationId,
        role: Role,
    ) -> Result<Vec<TurnId>, StoreError> {
        let mut stmt = conn.prepare("SELECT id FROM turns WHERE conversation_id = ?1 AND role = ?2")?;
        let rows = stmt.query_map(params![conversation_id.as_str(), role.as_str()], |row| {
            row.get::<_, String>(0)
        })?;
        let mut ids = Vec::new();
        for id in rows {
            ids.push(TurnId::from_raw(id?));
        }
        Ok(ids)
    }

    /// Write final fields and mark the turn complete. Only an `empty` turn can
    /// be finalized.
    pub fn finalize(conn: &Connection, id: &TurnId, fields: &TurnFields) -> Result<(), StoreError> {
        let changed = conn.execute(
            "UPDATE turns SET role = ?1, content = ?2, state = ?3, model_id = ?4,
                    input_tokens = ?5, output_tokens = ?6, updated_at = ?7
             WHERE id = ?8 AND state = 'empty'",
            params![
                fields.role.as_str(),
                fields.content,
                TurnState::Complete.as_str(),
                fields.model_id,
                fields.input_tokens,
                fields.output_tokens,
                row_helpers::timestamp(),
                id.as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(if Self::exists(conn, id)? {
                StoreError::AlreadyComplete(format!("turn {id}"))
            } else {
                StoreError::NotFound(format!("turn {id}"))
            });
        }
        Ok(())
    }

    pub fn exists(conn: &Connection, id: &TurnId) -> Result<bool, StoreError> {
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM turns WHERE id = ?1", [id.as_str()], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn link_tool_result(
        conn: &Connection,
        id: &TurnId,
        invocation_id: &ToolInvocationId,
    ) -> Result<(), StoreError> {
        let changed = conn.execute(
            "UPDATE turns SET tool_invocation_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![invocation_id.as_str(), row_helpers::timestamp(), id.as_str()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("turn {id}")));
        }
        Ok(())
    }

    pub fn conversation_of(conn: &Connection, id: &TurnId) -> Result<Option<ConversationId>, StoreError> {
        let conversation: Option<String> = conn
            .query_row("SELECT conversation_id FROM turns WHERE id = ?1", [id.as_str()], |row| row.get(0))
            .optional()?;
        Ok(conversation.map(ConversationId::from_raw))
    }

    /// Delete one turn, its attachments and the invocations it owns.
    /// Back-references to those invocations are cleared, never cascaded.
    pub fn delete(conn: &Connection, id: &TurnId) -> Result<bool, StoreError> {
        let _ = conn.execute(
            "UPDATE turns SET tool_invocation_id = NULL
             WHERE tool_invocation_id IN (SELECT id FROM tool_invocations WHERE turn_id = ?1)",
            [id.as_str()],
        )?;
        let _ = conn.execute("DELETE FROM tool_invocations WHERE turn_id = ?1", [id.as_str()])?;
        let _ = conn.execute("DELETE FROM attachments WHERE turn_id = ?1", [id.as_str()])?;
        let deleted = conn.execute("DELETE FROM turns WHERE id = ?1", [id.as_str()])?;
        Ok(deleted > 0)
    }

    /// Delete every turn of a conversation with their invocations and attachments.
    pub fn delete_by_conversation(conn: &Connection, conversation_id: &ConversationId) -> Result<usize, StoreError> {
        let owned = "SELECT id FROM turns WHERE conversation_id = ?1";
        let _ = conn.execute(
            &format!(
                "UPDATE turns SET tool_invocation_id = NULL
                 WHERE tool_invocation_id IN (SELECT id FROM tool_invocations WHERE turn_id IN ({owned}))"
            ),
            [conversation_id.as_str()],
        )?;
        let _ = conn.execute(
            &format!("DELETE FROM tool_invocations WHERE turn_id IN ({owned})"),
            [conversation_id.as_str()],
        )?;
        let _ = conn.execute(
            &format!("DELETE FROM attachments WHERE turn_id IN ({owned})"),
            [conversation_id.as_str()],
        )?;
        let deleted = conn.execute("DELETE FROM turns WHERE conversation_id = ?1", [conversation_id.as_str()])?;
        Ok(deleted)
    }
}

fn row_to_turn(row: &rusqlite::Row<'_>) -> Result<TurnRow, StoreError> {
    let role: String = row_helpers::get(row, 2, "turns", "role")?;
    let state: String = row_helpers::get(row, 4, "turns", "state")?;

    Ok(TurnRow {
        id: TurnId::from_raw(row_helpers::get::<String>(row, 0, "turns", "id")?),
        conversation_id: ConversationId::from_raw(row_helpers::get::<String>(row, 1, "turns", "conversation_id")?),
        role: row_helpers::parse_enum(&role, "turns", "role")?,
        content: row_helpers::get(row, 3, "turns", "content")?,
        state: row_helpers::parse_enum(&state, "turns", "state")?,
        model_id: row_helpers::get_opt(row, 5, "turns", "model_id")?,
        input_tokens: row_helpers::get_tokens(row, 6, "turns", "input_tokens")?,
        output_tokens: row_helpers::get_tokens(row, 7, "turns", "output_tokens")?,
        tool_invocation_id: row_helpers::get_opt::<String>(row, 8, "turns", "tool_invocation_id")?
            .map(ToolInvocationId::from_raw),
        created_at: row_helpers::get(row, 9, "turns", "created_at")?,
        updated_at: row_helpers::get(row, 10, "turns", "updated_at")?,
    })
}
