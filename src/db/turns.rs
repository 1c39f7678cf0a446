//! Inbound-turn persistence: the short rolling window the context builder
//! reads from, plus the reply send log.

use super::Store;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// How many turns are kept per `(session, peer)` pair. The window exists for
/// context assembly only; the permanent record lives in `chat_messages`.
pub const TURN_WINDOW: i64 = 20;

/// One persisted chat turn. Inbound rows come from the webhook; outgoing
/// rows are the assistant's replies (`from_me = true`).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InboundTurn {
    pub id: i64,
    pub message_id: String,
    pub session_tok: String,
    pub from_jid: String,
    pub to_jid: String,
    pub from_me: bool,
    pub msg_type: String,
    pub body: String,
    pub push_name: String,
    pub is_read: bool,
    pub timestamp: DateTime<Utc>,
}

/// Fields supplied by intake for a new inbound turn.
#[derive(Debug, Clone)]
pub struct NewTurn {
    pub message_id: String,
    pub session_tok: String,
    pub from_jid: String,
    pub to_jid: String,
    pub body: String,
    pub push_name: String,
    pub timestamp: DateTime<Utc>,
}

/// Result of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted,
    /// A row with this `message_id` already exists; nothing was written.
    Duplicate,
}

const TURN_COLUMNS: &str = "id, message_id, session_tok, from_jid, to_jid, from_me, \
                            msg_type, body, push_name, is_read, timestamp";

impl Store {
    /// Insert an inbound turn, deduplicating on `message_id`.
    pub async fn save_inbound_turn(&self, turn: &NewTurn) -> Result<SaveOutcome> {
        let result = sqlx::query(
            r"INSERT INTO ai_chat_messages
                  (message_id, session_tok, from_jid, to_jid, from_me, msg_type,
                   body, push_name, is_read, timestamp)
              VALUES ($1, $2, $3, $4, FALSE, 'text', $5, $6, FALSE, $7)
              ON CONFLICT (message_id) DO NOTHING",
        )
        .bind(&turn.message_id)
        .bind(&turn.session_tok)
        .bind(&turn.from_jid)
        .bind(&turn.to_jid)
        .bind(&turn.body)
        .bind(&turn.push_name)
        .bind(turn.timestamp)
        .execute(self.pool())
        .await
        .context("failed to save inbound turn")?;

        if result.rows_affected() == 0 {
            Ok(SaveOutcome::Duplicate)
        } else {
            Ok(SaveOutcome::Inserted)
        }
    }

    /// Persist an assistant reply as an outgoing turn. The chat server does
    /// not hand back a message id, so the row gets a synthetic one.
    pub async fn save_outgoing_turn(
        &self,
        session_tok: &str,
        peer: &str,
        body: &str,
    ) -> Result<()> {
        let message_id = format!("out_{}", Uuid::new_v4());
        sqlx::query(
            r"INSERT INTO ai_chat_messages
                  (message_id, session_tok, from_jid, to_jid, from_me, msg_type,
                   body, push_name, is_read, timestamp)
              VALUES ($1, $2, $2, $3, TRUE, 'text', $4, 'AI Bot', TRUE, NOW())",
        )
        .bind(&message_id)
        .bind(session_tok)
        .bind(peer)
        .bind(body)
        .execute(self.pool())
        .await
        .context("failed to save outgoing turn")?;
        Ok(())
    }

    /// Drop everything but the newest `TURN_WINDOW` turns exchanged with a
    /// peer. Called after every intake insert.
    pub async fn prune_turns(&self, session_tok: &str, peer: &str) -> Result<u64> {
        let result = sqlx::query(
            r"DELETE FROM ai_chat_messages
              WHERE id IN (
                  SELECT id FROM ai_chat_messages
                  WHERE session_tok = $1 AND (from_jid = $2 OR to_jid = $2)
                  ORDER BY timestamp DESC, id DESC
                  OFFSET $3
              )",
        )
        .bind(session_tok)
        .bind(peer)
        .bind(TURN_WINDOW)
        .execute(self.pool())
        .await
        .context("failed to prune turns")?;
        Ok(result.rows_affected())
    }

    /// Newest-first window of turns for a session. Callers iterate it in
    /// reverse to get chronological order.
    pub async fn recent_turns(&self, session_tok: &str, limit: i64) -> Result<Vec<InboundTurn>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        sqlx::query_as::<_, InboundTurn>(&format!(
            "SELECT {TURN_COLUMNS} FROM ai_chat_messages
             WHERE session_tok = $1
             ORDER BY timestamp DESC
             LIMIT $2"
        ))
        .bind(session_tok)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .context("failed to fetch recent turns")
    }

    pub async fn turn_by_message_id(&self, message_id: &str) -> Result<Option<InboundTurn>> {
        sqlx::query_as::<_, InboundTurn>(&format!(
            "SELECT {TURN_COLUMNS} FROM ai_chat_messages WHERE message_id = $1"
        ))
        .bind(message_id)
        .fetch_optional(self.pool())
        .await
        .context("failed to fetch turn by message id")
    }

    /// Unread inbound turns from a peer, oldest first.
    pub async fn unread_turns(&self, session_tok: &str, peer: &str) -> Result<Vec<InboundTurn>> {
        sqlx::query_as::<_, InboundTurn>(&format!(
            "SELECT {TURN_COLUMNS} FROM ai_chat_messages
             WHERE session_tok = $1 AND from_jid = $2 AND NOT from_me AND NOT is_read
             ORDER BY timestamp ASC"
        ))
        .bind(session_tok)
        .bind(peer)
        .fetch_all(self.pool())
        .await
        .context("failed to fetch unread turns")
    }

    /// Flip `is_read` for the given WhatsApp message ids.
    pub async fn mark_turns_read(&self, message_ids: &[String]) -> Result<u64> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE ai_chat_messages SET is_read = TRUE, updated_at = NOW()
             WHERE message_id = ANY($1)",
        )
        .bind(message_ids)
        .execute(self.pool())
        .await
        .context("failed to mark turns read")?;
        Ok(result.rows_affected())
    }

    /// Append a delivery outcome to the send log.
    pub async fn record_send(
        &self,
        session_tok: &str,
        to_jid: &str,
        body: &str,
        status: &str,
        error_msg: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO message_send_logs (session_tok, to_jid, body, status, error_msg)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(session_tok)
        .bind(to_jid)
        .bind(body)
        .bind(status)
        .bind(error_msg)
        .execute(self.pool())
        .await
        .context("failed to record send log")?;
        Ok(())
    }
}
