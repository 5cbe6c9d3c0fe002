// Idempotent response cache.
//
// Content-addressed: the key hashes the user, the conversation, the
// current document, and the normalized message. Because the document hash
// is part of the key, entries become unreachable (not invalidated) as the
// conversation evolves; the same message means something different once
// the document has changed.
//
// Entries are ephemeral and never authoritative: dropping the whole table
// must never be observable except as a slower next request.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use quizforge_common::document::{TestDocument, TestPatch};

/// A cached outcome of one AI-backed request. `truncated` is stored so a
/// hit reproduces the first response's outcome exactly, flag included.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult {
    pub reply_text: String,
    pub patch: Option<TestPatch>,
    pub token_cost: i64,
    pub truncated: bool,
}

/// Build the cache key for a request. The message is lowercased and
/// trimmed so trivial rephrasings of whitespace/case hit the same entry.
pub fn cache_key(
    user_id: &str,
    conversation_id: Uuid,
    document: &TestDocument,
    message: &str,
) -> Result<String> {
    let document_json =
        serde_json::to_string(document).context("failed to encode document for cache key")?;
    let document_hash = sha256_hex(document_json.as_bytes());
    let message_hash = sha256_hex(message.trim().to_lowercase().as_bytes());

    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(conversation_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(document_hash.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(message_hash.as_bytes());
    Ok(hex_encode(&hasher.finalize()))
}

/// Stateless operations on the `response_cache` table.
pub struct ResponseCache;

impl ResponseCache {
    /// Look up a non-expired entry.
    pub fn get(conn: &Connection, key: &str, now: DateTime<Utc>) -> Result<Option<CachedResult>> {
        let row: Option<(String, Option<String>, i64, bool)> = conn
            .query_row(
                "SELECT reply_text, patch, token_cost, truncated FROM response_cache \
                 WHERE cache_key = ?1 AND expires_at > ?2",
                params![key, now.to_rfc3339()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .context("failed to query response cache")?;

        let Some((reply_text, patch_json, token_cost, truncated)) = row else {
            return Ok(None);
        };

        // A patch that no longer decodes is treated as a miss; the cache
        // must never be a source of corruption.
        let patch = match patch_json {
            Some(json) => match serde_json::from_str(&json) {
                Ok(patch) => Some(patch),
                Err(error) => {
                    debug!(%error, "dropping undecodable cached patch");
                    return Ok(None);
                }
            },
            None => None,
        };

        Ok(Some(CachedResult { reply_text, patch, token_cost, truncated }))
    }

    /// Upsert an entry with the given TTL.
    pub fn put(
        conn: &Connection,
        key: &str,
        result: &CachedResult,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let patch_json = result
            .patch
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to encode patch for cache")?;
        let expires_at = now + ttl;

        conn.execute(
            "INSERT INTO response_cache \
             (cache_key, reply_text, patch, token_cost, truncated, expires_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(cache_key) DO UPDATE SET \
             reply_text = ?2, patch = ?3, token_cost = ?4, truncated = ?5, expires_at = ?6",
            params![
                key,
                result.reply_text,
                patch_json,
                result.token_cost,
                result.truncated,
                expires_at.to_rfc3339(),
            ],
        )
        .context("failed to upsert response cache entry")?;
        Ok(())
    }

    /// Delete expired rows. Returns the number removed.
    pub fn purge_expired(conn: &Connection, now: DateTime<Utc>) -> Result<usize> {
        conn.execute(
            "DELETE FROM response_cache WHERE expires_at <= ?1",
            params![now.to_rfc3339()],
        )
        .context("failed to purge expired cache entries")
    }
}

fn sha256_hex(content: &[u8]) -> String {
    hex_encode(&Sha256::digest(content))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        use std::fmt::Write as _;
        let _ = write!(s, "{byte:02x}");
    }
    s
}
