//! Direct-database directory backend.
//!
//! Reads the transactional platform's own tables. The schema is owned by the
//! platform's migration tooling: this backend verifies the tables exist at
//! construction and never creates or alters anything. Column names are
//! camelCase and must stay quoted.

use super::{BotSettings, Directory, Document, SessionInfo, UsageLog};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Tables the platform must have migrated before direct mode can start.
const REQUIRED_TABLES: &[&str] = &[
    "User",
    "WhatsAppSession",
    "ServicesWhatsappCustomers",
    "WhatsAppAIBot",
    "AIDocument",
    "AIUsageLog",
    "AIBotSessionBinding",
];

pub struct DbDirectory {
    pool: PgPool,
}

impl DbDirectory {
    pub async fn new(pool: PgPool) -> Result<Self> {
        let directory = Self { pool };
        directory.verify_tables_exist().await?;
        Ok(directory)
    }

    async fn verify_tables_exist(&self) -> Result<()> {
        for table in REQUIRED_TABLES {
            let (exists,): (bool,) = sqlx::query_as(
                "SELECT EXISTS (
                     SELECT 1 FROM information_schema.tables
                     WHERE table_schema = 'public' AND table_name = $1
                 )",
            )
            .bind(table)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("failed to check for table '{table}'"))?;

            if !exists {
                bail!(
                    "table '{table}' not found; run the platform migration first \
                     before enabling direct data access"
                );
            }
        }
        Ok(())
    }

    async fn bot_active_for_session(&self, session_id: &str) -> Result<bool> {
        let binding = sqlx::query(
            r#"SELECT "botId" FROM "AIBotSessionBinding"
               WHERE "sessionId" = $1 AND "isActive" = TRUE
               LIMIT 1"#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to query bot binding")?;

        let Some(row) = binding else {
            return Ok(false);
        };
        let bot_id: String = row.try_get("botId")?;

        let bot = sqlx::query(
            r#"SELECT 1 AS one FROM "WhatsAppAIBot"
               WHERE "id" = $1 AND "isActive" = TRUE"#,
        )
        .bind(&bot_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to query bot")?;

        Ok(bot.is_some())
    }

    async fn subscription_active_for_user(&self, user_id: &str) -> Result<bool> {
        let row = sqlx::query(
            r#"SELECT 1 AS one FROM "ServicesWhatsappCustomers"
               WHERE "customerId" = $1 AND "status" = 'active' AND "expiredAt" > NOW()
               LIMIT 1"#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to query subscription")?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl Directory for DbDirectory {
    async fn resolve_session(&self, token: &str) -> Result<Option<SessionInfo>> {
        let session = sqlx::query(
            r#"SELECT "id", "token", "userId" FROM "WhatsAppSession" WHERE "token" = $1"#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .context("failed to query session")?;

        let Some(row) = session else {
            return Ok(None);
        };

        let session_id: String = row.try_get("id")?;
        let session_token: String = row.try_get("token")?;
        let Some(user_id) = row.try_get::<Option<String>, _>("userId")? else {
            tracing::debug!(token, "session has no owning user");
            return Ok(None);
        };

        let bot_active = self.bot_active_for_session(&session_id).await?;
        let subscription_active = self.subscription_active_for_user(&user_id).await?;

        Ok(Some(SessionInfo {
            user_id,
            bot_active,
            subscription_active,
            session_token,
        }))
    }

    async fn get_bot_settings(&self, user_id: &str, _session_token: &str) -> Result<BotSettings> {
        let bot = sqlx::query(
            r#"SELECT "id", "systemPrompt", "fallbackText" FROM "WhatsAppAIBot"
               WHERE "userId" = $1 AND "isActive" = TRUE
               LIMIT 1"#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to query bot settings")?
        .ok_or_else(|| anyhow::anyhow!("bot not found or inactive for user {user_id}"))?;

        let system_prompt: Option<String> = bot.try_get("systemPrompt")?;
        let fallback_text: Option<String> = bot.try_get("fallbackText")?;

        let rows = sqlx::query(
            r#"SELECT "title", "content", "kind" FROM "AIDocument"
               WHERE "userId" = $1 AND "isActive" = TRUE"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch documents")?;

        let documents = rows
            .into_iter()
            .map(|row| {
                Ok(Document {
                    title: row.try_get("title")?,
                    content: row.try_get("content")?,
                    kind: row.try_get("kind")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(BotSettings {
            system_prompt: system_prompt.unwrap_or_default(),
            fallback_text: fallback_text.unwrap_or_default(),
            documents,
        })
    }

    async fn log_usage(&self, entry: &UsageLog) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO "AIUsageLog"
                   ("id", "userId", "sessionId", "inputTokens", "outputTokens",
                    "totalTokens", "latencyMs", "status", "errorReason", "createdAt")
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())"#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&entry.user_id)
        .bind((!entry.session_id.is_empty()).then_some(&entry.session_id))
        .bind(entry.input_tokens)
        .bind(entry.output_tokens)
        .bind(entry.total_tokens)
        .bind(entry.latency_ms)
        .bind(&entry.status)
        .bind((!entry.error_reason.is_empty()).then_some(&entry.error_reason))
        .execute(&self.pool)
        .await
        .context("failed to save usage log")?;
        Ok(())
    }

    async fn check_health(&self) -> Result<()> {
        sqlx::query_scalar::<_, i64>(r#"SELECT COUNT(*) FROM "User""#)
            .fetch_one(&self.pool)
            .await
            .context("transactional DB health check failed")?;
        Ok(())
    }
}
