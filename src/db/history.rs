//! Permanent chat history, separate from the rolling context window.
//!
//! Writes here are fire-and-forget from the caller's perspective: intake and
//! the worker spawn them off the critical path and only log failures.

use super::Store;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

fn sender_type(from_me: bool) -> &'static str {
    if from_me {
        "user"
    } else {
        "contact"
    }
}

fn unread_increment(from_me: bool) -> i32 {
    i32::from(!from_me)
}

/// Room key: one conversation per `(session, contact)`.
pub fn chat_id(session_tok: &str, contact_jid: &str) -> String {
    format!("{session_tok}_{contact_jid}")
}

impl Store {
    /// Record one message in the permanent history, creating or refreshing
    /// its chat room.
    #[allow(clippy::too_many_arguments)]
    pub async fn append_history(
        &self,
        session_tok: &str,
        sender_jid: &str,
        recipient_jid: &str,
        body: &str,
        push_name: &str,
        timestamp: DateTime<Utc>,
        from_me: bool,
    ) -> Result<()> {
        let contact = if from_me { recipient_jid } else { sender_jid };
        let chat_id = chat_id(session_tok, contact);
        let sender = sender_type(from_me);

        let (room_id,): (i64,) = sqlx::query_as(
            r"INSERT INTO chat_rooms
                  (chat_id, user_token, contact_jid, contact_name, last_message,
                   last_sender, last_activity, unread_count)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
              ON CONFLICT (chat_id) DO UPDATE SET
                  last_message = EXCLUDED.last_message,
                  last_sender = EXCLUDED.last_sender,
                  last_activity = EXCLUDED.last_activity,
                  unread_count = chat_rooms.unread_count + $8,
                  updated_at = NOW()
              RETURNING id",
        )
        .bind(&chat_id)
        .bind(session_tok)
        .bind(contact)
        .bind(push_name)
        .bind(body)
        .bind(sender)
        .bind(timestamp)
        .bind(unread_increment(from_me))
        .fetch_one(self.pool())
        .await
        .context("failed to upsert chat room")?;

        // The chat server's reply id is not available here; history rows get
        // a synthetic id.
        let message_id = format!("{chat_id}_{}", Uuid::new_v4());
        sqlx::query(
            r"INSERT INTO chat_messages
                  (message_id, chat_room_id, chat_id, user_token, sender_jid,
                   sender_type, content, message_timestamp)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&message_id)
        .bind(room_id)
        .bind(&chat_id)
        .bind(session_tok)
        .bind(sender_jid)
        .bind(sender)
        .bind(body)
        .bind(timestamp)
        .execute(self.pool())
        .await
        .context("failed to append chat message")?;

        Ok(())
    }

    /// Record an assistant reply in the permanent history.
    pub async fn append_reply_history(
        &self,
        session_tok: &str,
        recipient_jid: &str,
        response: &str,
    ) -> Result<()> {
        self.append_history(
            session_tok,
            session_tok,
            recipient_jid,
            response,
            "AI Bot",
            Utc::now(),
            true,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_id_joins_session_and_contact() {
        assert_eq!(
            chat_id("sess-1", "628123@s.whatsapp.net"),
            "sess-1_628123@s.whatsapp.net"
        );
    }

    #[test]
    fn incoming_messages_increment_unread() {
        assert_eq!(unread_increment(false), 1);
        assert_eq!(unread_increment(true), 0);
    }

    #[test]
    fn sender_type_maps_direction() {
        assert_eq!(sender_type(true), "user");
        assert_eq!(sender_type(false), "contact");
    }
}
