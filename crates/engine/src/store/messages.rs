// Chat message persistence.
//
// Messages are append-only and immutable once written. Per-conversation
// ordering is insertion (rowid) order. The ledger inserts messages inside
// its settle transaction; `insert` therefore works against any
// `&Connection`, including a `Transaction` deref.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use quizforge_common::types::ChatMessage;

/// A new message to append (id is auto-generated).
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub user_text: Option<String>,
    pub reply_text: Option<String>,
    pub task_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl NewMessage {
    pub fn exchange(
        conversation_id: Uuid,
        user_text: impl Into<String>,
        reply_text: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            conversation_id,
            user_text: Some(user_text.into()),
            reply_text: Some(reply_text.into()),
            task_ids: Vec::new(),
            created_at: now,
        }
    }
}

/// Stateless operations on the `chat_messages` table.
pub struct MessageStore;

impl MessageStore {
    /// Append a message. Returns the auto-generated row id.
    pub fn insert(conn: &Connection, message: &NewMessage) -> Result<i64> {
        let task_ids = serde_json::to_string(
            &message.task_ids.iter().map(Uuid::to_string).collect::<Vec<_>>(),
        )
        .context("failed to encode message task ids")?;

        conn.execute(
            "INSERT INTO chat_messages \
             (conversation_id, user_text, reply_text, task_ids, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.conversation_id.to_string(),
                message.user_text,
                message.reply_text,
                task_ids,
                message.created_at.to_rfc3339(),
            ],
        )
        .context("failed to insert chat message")?;
        Ok(conn.last_insert_rowid())
    }

    /// List a conversation's messages in insertion order.
    pub fn list_by_conversation(conn: &Connection, conversation_id: Uuid) -> Result<Vec<ChatMessage>> {
        let mut stmt = conn
            .prepare(
                "SELECT id, conversation_id, user_text, reply_text, task_ids, created_at \
                 FROM chat_messages WHERE conversation_id = ?1 \
                 ORDER BY id ASC",
            )
            .context("failed to prepare conversation messages query")?;

        let rows = stmt
            .query_map(params![conversation_id.to_string()], row_to_message)
            .context("failed to query conversation messages")?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to collect conversation messages")
    }

    pub fn count_by_conversation(conn: &Connection, conversation_id: Uuid) -> Result<usize> {
        conn.query_row(
            "SELECT COUNT(*) FROM chat_messages WHERE conversation_id = ?1",
            params![conversation_id.to_string()],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as usize)
        .context("failed to count conversation messages")
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let conversation_raw: String = row.get(1)?;
    let task_ids_raw: String = row.get(4)?;
    let created_raw: String = row.get(5)?;

    let task_ids: Vec<String> = serde_json::from_str(&task_ids_raw).unwrap_or_default();

    Ok(ChatMessage {
        id: row.get(0)?,
        conversation_id: conversation_raw.parse::<Uuid>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?,
        user_text: row.get(2)?,
        reply_text: row.get(3)?,
        task_ids: task_ids.iter().filter_map(|s| s.parse::<Uuid>().ok()).collect(),
        created_at: created_raw.parse::<DateTime<Utc>>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?,
    })
}
