use rusqlite::{params, Connection, OptionalExtension};

use parley_core::ids::ConversationId;

use crate::error::StoreError;
use crate::records::ConversationRow;
use crate::row_helpers;
use crate::turns::TurnRepo;

/// Conversation repository. Stateless: every method takes `&Connection`
/// so it composes inside a caller's transaction.
pub struct ConversationRepo;

impl ConversationRepo {
    pub fn insert(conn: &Connection, model_id: &str) -> Result<ConversationRow, StoreError> {
        let id = ConversationId::new();
        let now = row_helpers::timestamp();
        let _ = conn.execute(
            "INSERT INTO conversations (id, model_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![id.as_str(), model_id, now],
        )?;
        Ok(ConversationRow {
            id,
            model_id: model_id.to_string(),
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn get(conn: &Connection, id: &ConversationId) -> Result<ConversationRow, StoreError> {
        conn.query_row(
            "SELECT id, model_id, created_at, updated_at FROM conversations WHERE id = ?1",
            [id.as_str()],
            |row| Ok(row_to_conversation(row)),
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("conversation {id}")))?
    }

    pub fn exists(conn: &Connection, id: &ConversationId) -> Result<bool, StoreError> {
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM conversations WHERE id = ?1", [id.as_str()], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn set_model(conn: &Connection, id: &ConversationId, model_id: &str) -> Result<(), StoreError> {
        let changed = conn.execute(
            "UPDATE conversations SET model_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![model_id, row_helpers::timestamp(), id.as_str()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("conversation {id}")));
        }
        Ok(())
    }

    /// Bump `updated_at`.
    pub fn touch(conn: &Connection, id: &ConversationId) -> Result<(), StoreError> {
        let _ = conn.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![row_helpers::timestamp(), id.as_str()],
        )?;
        Ok(())
    }

    /// Delete the conversation and everything it owns. Returns false if it did not exist.
    pub fn delete(conn: &Connection, id: &ConversationId) -> Result<bool, StoreError> {
        let _ = TurnRepo::delete_by_conversation(conn, id)?;
        let deleted = conn.execute("DELETE FROM conversations WHERE id = ?1", [id.as_str()])?;
        Ok(deleted > 0)
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> Result<ConversationRow, StoreError> {
    Ok(ConversationRow {
        id: ConversationId::from_raw(row_helpers::get::<String>(row, 0, "conversations", "id")?),
        model_id: row_helpers::get(row, 1, "conversations", "model_id")?,
        created_at: row_helpers::get(row, 2, "conversations", "created_at")?,
        updated_at: row_helpers::get(row, 3, "conversations", "updated_at")?,
    })
}
