// Conversation persistence: CRUD + soft delete.
//
// Deleting a conversation stamps `deleted_at`; listings filter stamped
// rows at query time. Restore clears the stamp. Purge removes the row and
// everything hanging off it (messages, document, tasks). Cache rows are
// left to expire; they are immaterial to correctness.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use quizforge_common::types::Conversation;

/// Stateless CRUD operations on the `conversations` table.
pub struct ConversationStore;

impl ConversationStore {
    pub fn create(conn: &Connection, conversation: &Conversation) -> Result<()> {
        conn.execute(
            "INSERT INTO conversations \
             (conversation_id, owner_id, title, deleted_at, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                conversation.id.to_string(),
                conversation.owner_id,
                conversation.title,
                conversation.deleted_at.map(|t| t.to_rfc3339()),
                conversation.created_at.to_rfc3339(),
            ],
        )
        .context("failed to insert conversation")?;
        Ok(())
    }

    /// Get a conversation by id, soft-deleted rows included.
    pub fn get(conn: &Connection, id: Uuid) -> Result<Option<Conversation>> {
        let mut stmt = conn
            .prepare(
                "SELECT conversation_id, owner_id, title, deleted_at, created_at \
                 FROM conversations WHERE conversation_id = ?1",
            )
            .context("failed to prepare conversation query")?;

        let mut rows = stmt
            .query_map(params![id.to_string()], row_to_conversation)
            .context("failed to query conversation")?;

        match rows.next() {
            Some(row) => Ok(Some(row.context("failed to decode conversation row")?)),
            None => Ok(None),
        }
    }

    /// List an owner's conversations, newest first, excluding soft-deleted.
    pub fn list_by_owner(conn: &Connection, owner_id: &str) -> Result<Vec<Conversation>> {
        let mut stmt = conn
            .prepare(
                "SELECT conversation_id, owner_id, title, deleted_at, created_at \
                 FROM conversations \
                 WHERE owner_id = ?1 AND deleted_at IS NULL \
                 ORDER BY created_at DESC",
            )
            .context("failed to prepare owner conversations query")?;

        let rows = stmt
            .query_map(params![owner_id], row_to_conversation)
            .context("failed to query owner conversations")?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to collect owner conversations")
    }

    /// Stamp `deleted_at`. Returns false when already deleted or missing.
    pub fn soft_delete(conn: &Connection, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE conversations SET deleted_at = ?1 \
                 WHERE conversation_id = ?2 AND deleted_at IS NULL",
                params![now.to_rfc3339(), id.to_string()],
            )
            .context("failed to soft-delete conversation")?;
        Ok(changed > 0)
    }

    /// Clear `deleted_at`. Returns false when not deleted or missing.
    pub fn restore(conn: &Connection, id: Uuid) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE conversations SET deleted_at = NULL \
                 WHERE conversation_id = ?1 AND deleted_at IS NOT NULL",
                params![id.to_string()],
            )
            .context("failed to restore conversation")?;
        Ok(changed > 0)
    }

    /// Hard-delete the conversation and its dependents.
    pub fn purge(conn: &mut Connection, id: Uuid) -> Result<bool> {
        let id = id.to_string();
        let tx = conn.transaction().context("failed to start purge transaction")?;

        tx.execute("DELETE FROM chat_messages WHERE conversation_id = ?1", params![id])
            .context("failed to purge chat messages")?;
        tx.execute("DELETE FROM test_documents WHERE conversation_id = ?1", params![id])
            .context("failed to purge test document")?;
        tx.execute("DELETE FROM ai_tasks WHERE conversation_id = ?1", params![id])
            .context("failed to purge ai tasks")?;
        let removed = tx
            .execute("DELETE FROM conversations WHERE conversation_id = ?1", params![id])
            .context("failed to purge conversation")?;

        tx.commit().context("failed to commit purge transaction")?;
        Ok(removed > 0)
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let id_raw: String = row.get(0)?;
    let deleted_raw: Option<String> = row.get(3)?;
    let created_raw: String = row.get(4)?;

    Ok(Conversation {
        id: id_raw.parse::<Uuid>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        owner_id: row.get(1)?,
        title: row.get(2)?,
        deleted_at: deleted_raw.and_then(|s| s.parse::<DateTime<Utc>>().ok()),
        created_at: created_raw.parse::<DateTime<Utc>>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?,
    })
}
