// Token ledger: pre-authorization, atomic debit, audit trail.
//
// Every AI-backed request goes through two gates:
//   1. `precheck` against a small fixed minimum before any provider call,
//      so a user can never start work they cannot finish;
//   2. `settle` once the actual cost is known.
//
// `settle` performs the balance debit, the append-only transaction row,
// and the resulting chat message as one SQLite transaction. The debit is
// a guarded compare-and-swap (`... AND balance >= cost`), so a concurrent
// debit that would overdraw fails cleanly and reports the real balance.
//
// The invariant tested in `reconcile`: a wallet's balance always equals
// the sum of its transaction rows.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;
use uuid::Uuid;

use quizforge_common::types::TokenTransaction;

use crate::store::messages::{MessageStore, NewMessage};

/// Result of a balance pre-authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecheckOutcome {
    Ok { balance: i64 },
    InsufficientFunds { balance: i64, required: i64 },
}

impl PrecheckOutcome {
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// Result of an atomic settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    Applied { new_balance: i64, message_id: i64 },
    InsufficientFunds { balance: i64, required: i64 },
}

/// Stateless ledger operations over `wallet_balances` + `token_transactions`.
pub struct TokenLedger;

impl TokenLedger {
    /// Current balance; a user without a wallet row has zero tokens.
    pub fn balance(conn: &Connection, user_id: &str) -> Result<i64> {
        let balance: Option<i64> = conn
            .query_row(
                "SELECT balance FROM wallet_balances WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read wallet balance")?;
        Ok(balance.unwrap_or(0))
    }

    /// Credit tokens (top-up, refund, test seeding). Returns the new
    /// balance. Writes a positive transaction row so the ledger still
    /// reconciles.
    pub fn grant(
        conn: &mut Connection,
        user_id: &str,
        amount: i64,
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let tx = conn.transaction().context("failed to start grant transaction")?;

        tx.execute(
            "INSERT INTO wallet_balances (user_id, balance) VALUES (?1, ?2) \
             ON CONFLICT(user_id) DO UPDATE SET balance = balance + ?2",
            params![user_id, amount],
        )
        .context("failed to credit wallet balance")?;

        tx.execute(
            "INSERT INTO token_transactions (user_id, amount, source, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, amount, source, now.to_rfc3339()],
        )
        .context("failed to record grant transaction")?;

        let new_balance: i64 = tx
            .query_row(
                "SELECT balance FROM wallet_balances WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .context("failed to read balance after grant")?;

        tx.commit().context("failed to commit grant transaction")?;
        Ok(new_balance)
    }

    /// Check that the user can afford at least `minimum_cost`. Runs before
    /// any provider call; mutates nothing.
    pub fn precheck(conn: &Connection, user_id: &str, minimum_cost: i64) -> Result<PrecheckOutcome> {
        let balance = Self::balance(conn, user_id)?;
        if balance < minimum_cost {
            return Ok(PrecheckOutcome::InsufficientFunds { balance, required: minimum_cost });
        }
        Ok(PrecheckOutcome::Ok { balance })
    }

    /// Atomically debit `cost`, append the audit transaction row, and
    /// insert the resulting chat message. All three happen or none do.
    pub fn settle(
        conn: &mut Connection,
        user_id: &str,
        conversation_id: Uuid,
        cost: i64,
        source: &str,
        metadata: Option<serde_json::Value>,
        message: &NewMessage,
        now: DateTime<Utc>,
    ) -> Result<SettleOutcome> {
        let tx = conn.transaction().context("failed to start settle transaction")?;

        // A user who has never been granted tokens still gets a wallet
        // row, so zero-cost settles are representable.
        tx.execute(
            "INSERT OR IGNORE INTO wallet_balances (user_id, balance) VALUES (?1, 0)",
            params![user_id],
        )
        .context("failed to ensure wallet row")?;

        // CAS debit: fails (0 rows) when the real balance is too low,
        // including when a concurrent settle drained it first.
        let debited = tx
            .execute(
                "UPDATE wallet_balances SET balance = balance - ?1 \
                 WHERE user_id = ?2 AND balance >= ?1",
                params![cost, user_id],
            )
            .context("failed to debit wallet balance")?;

        if debited == 0 {
            let balance: i64 = tx
                .query_row(
                    "SELECT balance FROM wallet_balances WHERE user_id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .context("failed to read balance after denied debit")?;
            // Dropping the transaction rolls back the wallet-row insert.
            return Ok(SettleOutcome::InsufficientFunds { balance, required: cost });
        }

        let metadata_json = metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to encode transaction metadata")?;
        tx.execute(
            "INSERT INTO token_transactions \
             (user_id, amount, source, conversation_id, metadata, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user_id,
                -cost,
                source,
                conversation_id.to_string(),
                metadata_json,
                now.to_rfc3339(),
            ],
        )
        .context("failed to record spend transaction")?;

        let message_id = MessageStore::insert(&tx, message)
            .context("failed to insert settled chat message")?;

        let new_balance: i64 = tx
            .query_row(
                "SELECT balance FROM wallet_balances WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .context("failed to read balance after settle")?;

        tx.commit().context("failed to commit settle transaction")?;

        info!(user = user_id, cost, new_balance, source, "tokens settled");
        Ok(SettleOutcome::Applied { new_balance, message_id })
    }

    /// Full transaction log for a user, oldest first.
    pub fn transactions(conn: &Connection, user_id: &str) -> Result<Vec<TokenTransaction>> {
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, amount, source, conversation_id, metadata, created_at \
                 FROM token_transactions WHERE user_id = ?1 ORDER BY id ASC",
            )
            .context("failed to prepare transactions query")?;

        let rows = stmt
            .query_map(params![user_id], row_to_transaction)
            .context("failed to query transactions")?;

        rows.collect::<std::result::Result<Vec<_>, _>>().context("failed to collect transactions")
    }

    /// Returns `(balance, transaction_sum)`. The two must always be equal
    /// when every mutation went through this ledger.
    pub fn reconcile(conn: &Connection, user_id: &str) -> Result<(i64, i64)> {
        let balance = Self::balance(conn, user_id)?;
        let sum: i64 = conn
            .query_row(
                "SELECT COALESCE(SUM(amount), 0) FROM token_transactions WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .context("failed to sum transactions")?;
        Ok((balance, sum))
    }
}

fn row_to_transaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<TokenTransaction> {
    let conversation_raw: Option<String> = row.get(4)?;
    let metadata_raw: Option<String> = row.get(5)?;
    let created_raw: String = row.get(6)?;

    Ok(TokenTransaction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        amount: row.get(2)?,
        source: row.get(3)?,
        conversation_id: conversation_raw.and_then(|s| s.parse::<Uuid>().ok()),
        metadata: metadata_raw.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: created_raw.parse::<DateTime<Utc>>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?,
    })
}
