use rusqlite::{params, Connection, OptionalExtension};

use parley_core::ids::{ConversationId, ToolInvocationId, TurnId};

use crate::error::StoreError;
use crate::records::{NewToolInvocation, ToolInvocationRow};
use crate::row_helpers;

pub struct ToolInvocationRepo;

impl ToolInvocationRepo {
    pub fn insert(
        conn: &Connection,
        turn_id: &TurnId,
        invocation: &NewToolInvocation,
    ) -> Result<ToolInvocationRow, StoreError> {
        let id = ToolInvocationId::new();
        let now = row_helpers::timestamp();
        let arguments = serde_json::to_string(&invocation.arguments)?;
        let _ = conn.execute(
            "INSERT INTO tool_invocations (id, turn_id, correlation_id, name, arguments, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.as_str(),
                turn_id.as_str(),
                invocation.correlation_id,
                invocation.name,
                arguments,
                now,
            ],
        )?;
        Ok(ToolInvocationRow {
            id,
            turn_id: turn_id.clone(),
            correlation_id: invocation.correlation_id.clone(),
            name: invocation.name.clone(),
            arguments: invocation.arguments.clone(),
            created_at: now,
        })
    }

    pub fn get(conn: &Connection, id: &ToolInvocationId) -> Result<ToolInvocationRow, StoreError> {
        conn.query_row(
            "SELECT id, turn_id, correlation_id, name, arguments, created_at
             FROM tool_invocations WHERE id = ?1",
            [id.as_str()],
            |row| Ok(row_to_invocation(row)),
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("tool invocation {id}")))?
    }

    pub fn list_by_turn(conn: &Connection, turn_id: &TurnId) -> Result<Vec<ToolInvocationRow>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT id, turn_id, correlation_id, name, arguments, created_at
             FROM tool_invocations WHERE turn_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let mut rows = stmt.query([turn_id.as_str()])?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            results.push(row_to_invocation(row)?);
        }
        Ok(results)
    }

    /// Exact match on the correlation token, restricted to invocations owned by
    /// turns of the given conversation. The earliest match wins.
    pub fn find_in_conversation(
        conn: &Connection,
        conversation_id: &ConversationId,
        correlation_id: &str,
    ) -> Result<Option<ToolInvocationRow>, StoreError> {
        conn.query_row(
            "SELECT ti.id, ti.turn_id, ti.correlation_id, ti.name, ti.arguments, ti.created_at
             FROM tool_invocations ti
             JOIN turns t ON t.id = ti.turn_id
             WHERE t.conversation_id = ?1 AND ti.correlation_id = ?2
             ORDER BY ti.created_at ASC, ti.rowid ASC
             LIMIT 1",
            params![conversation_id.as_str(), correlation_id],
            |row| Ok(row_to_invocation(row)),
        )
        .optional()?
        .transpose()
    }
}

fn row_to_invocation(row: &rusqlite::Row<'_>) -> Result<ToolInvocationRow, StoreError> {
    let raw_arguments: String = row_helpers::get(row, 4, "tool_invocations", "arguments")?;
    Ok(ToolInvocationRow {
        id: ToolInvocationId::from_raw(row_helpers::get::<String>(row, 0, "tool_invocations", "id")?),
        turn_id: TurnId::from_raw(row_helpers::get::<String>(row, 1, "tool_invocations", "turn_id")?),
        correlation_id: row_helpers::get(row, 2, "tool_invocations", "correlation_id")?,
        name: row_helpers::get(row, 3, "tool_invocations", "name")?,
        arguments: row_helpers::parse_json_object(&raw_arguments, "tool_invocations", "arguments")?,
        created_at: row_helpers::get(row, 5, "tool_invocations", "created_at")?,
    })
}
