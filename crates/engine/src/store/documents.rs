// Canonical test document persistence.
//
// One JSON body per conversation, created empty on first touch. The
// aggregator (`quizforge_common::document::apply_patch`) produces the new
// value; this store only loads and saves it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use quizforge_common::document::TestDocument;

/// Stateless operations on the `test_documents` table.
pub struct DocumentStore;

impl DocumentStore {
    /// Load the conversation's document, creating an empty one on first
    /// touch so a document always exists once a conversation does.
    pub fn get_or_create(
        conn: &Connection,
        conversation_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<TestDocument> {
        if let Some(document) = Self::get(conn, conversation_id)? {
            return Ok(document);
        }

        let document = TestDocument::default();
        Self::save(conn, conversation_id, &document, now)?;
        Ok(document)
    }

    pub fn get(conn: &Connection, conversation_id: Uuid) -> Result<Option<TestDocument>> {
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM test_documents WHERE conversation_id = ?1",
                params![conversation_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query test document")?;

        match body {
            Some(body) => {
                let document = serde_json::from_str(&body)
                    .context("failed to decode stored test document")?;
                Ok(Some(document))
            }
            None => Ok(None),
        }
    }

    /// Upsert the full document body.
    pub fn save(
        conn: &Connection,
        conversation_id: Uuid,
        document: &TestDocument,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let body = serde_json::to_string(document).context("failed to encode test document")?;
        conn.execute(
            "INSERT INTO test_documents (conversation_id, body, updated_at) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(conversation_id) DO UPDATE SET body = ?2, updated_at = ?3",
            params![conversation_id.to_string(), body, now.to_rfc3339()],
        )
        .context("failed to save test document")?;
        Ok(())
    }
}
