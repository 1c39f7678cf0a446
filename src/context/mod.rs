//! Prompt assembly: bot settings, ranked knowledge base, and a bounded
//! window of conversation history.
//!
//! The assembly order is a contract (downstream prompt caches and tests
//! depend on byte-identical output for identical inputs), so fetching and
//! assembling are separate steps and `assemble` is a pure function.

use crate::db::{InboundTurn, Store};
use crate::directory::{BotSettings, Directory, Document};
use anyhow::{Context as _, Result};
use std::sync::Arc;

/// Used when the bot has no configured system prompt.
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "Anda adalah customer service yang ramah dan profesional.";

/// Chat-formatting and anti-repetition rules appended to every prompt.
/// Pinned by tests; do not reword casually.
pub const FORMATTING_RULES: &str = "\
=== Aturan Balasan ===
- Balas dalam bahasa yang digunakan pelanggan.
- Gunakan format WhatsApp: *tebal* untuk penekanan, _miring_ untuk istilah.
- Jangan gunakan heading markdown (#), tabel, atau blok kode.
- Jawab singkat dan langsung ke inti pertanyaan.
- Jangan mengulang salam atau memperkenalkan diri di setiap balasan.
- Jangan mengulang jawaban yang sudah diberikan sebelumnya.";

/// Closing block, appended after the history window.
pub const CLOSING_REMINDER: &str = "\
=== Pengingat ===
Jawab pertanyaan pelanggan berdasarkan informasi di atas. Jika informasinya
tidak tersedia, katakan dengan jujur dan tawarkan bantuan lanjutan.";

const KNOWLEDGE_HEADER: &str = "\
=== Knowledge Base ===
Gunakan dokumen berikut sebagai sumber jawaban. Jangan mengarang informasi di
luar dokumen ini.";

const HISTORY_HEADER: &str = "=== Conversation History ===";

/// At most this many documents make it into the prompt; beyond it the
/// keyword ranking decides which.
const KNOWLEDGE_DOC_LIMIT: usize = 10;
const DOC_CONTENT_LIMIT: usize = 5_000;
/// Pricing documents get a bigger budget: price tables truncate badly.
const PRICING_DOC_CONTENT_LIMIT: usize = 8_000;
const HISTORY_BODY_LIMIT: usize = 200;

/// What the model call needs: the full system prompt and the user's turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextData {
    pub system_prompt: String,
    pub user_message: String,
}

pub struct ContextBuilder {
    store: Store,
    directory: Arc<dyn Directory>,
}

impl ContextBuilder {
    pub fn new(store: Store, directory: Arc<dyn Directory>) -> Self {
        Self { store, directory }
    }

    /// Fetch settings and history, then assemble the prompt. Fails only if a
    /// fetch fails or the inbound turn is gone; empty settings and empty
    /// history are fine.
    pub async fn build(
        &self,
        user_id: &str,
        session_tok: &str,
        message_id: &str,
        max_messages: usize,
    ) -> Result<ContextData> {
        let settings = self
            .directory
            .get_bot_settings(user_id, session_tok)
            .await
            .context("failed to fetch bot settings")?;

        let current = self
            .store
            .turn_by_message_id(message_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("inbound turn {message_id} not found"))?;

        let turns = self
            .store
            .recent_turns(session_tok, max_messages as i64)
            .await
            .context("failed to fetch chat history")?;

        let context = assemble(&settings, &turns, &current, max_messages);

        let estimated_tokens =
            (context.system_prompt.len() + context.user_message.len()) / 4;
        tracing::info!(
            estimated_tokens,
            system_chars = context.system_prompt.len(),
            user_chars = context.user_message.len(),
            max_messages,
            "context assembled"
        );

        Ok(context)
    }
}

/// Pure assembly step. `turns` is newest-first, as the store returns it.
pub fn assemble(
    settings: &BotSettings,
    turns: &[InboundTurn],
    current: &InboundTurn,
    max_messages: usize,
) -> ContextData {
    let mut prompt = if settings.system_prompt.trim().is_empty() {
        DEFAULT_SYSTEM_PROMPT.to_string()
    } else {
        settings.system_prompt.clone()
    };

    prompt.push_str("\n\n");
    prompt.push_str(FORMATTING_RULES);

    let selected = select_documents(&settings.documents, &current.body);
    if !selected.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(KNOWLEDGE_HEADER);
        prompt.push('\n');
        for doc in &selected {
            let limit = if is_pricing_kind(&doc.kind) {
                PRICING_DOC_CONTENT_LIMIT
            } else {
                DOC_CONTENT_LIMIT
            };
            prompt.push_str(&format!(
                "\n[{} - {}]\n{}\n",
                doc.kind,
                doc.title,
                truncate_chars(&doc.content, limit)
            ));
        }
    }

    if max_messages > 0 && !turns.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(HISTORY_HEADER);
        prompt.push('\n');
        // Newest-first from the store; emit oldest-first.
        for turn in turns.iter().rev() {
            let role = if turn.from_me { "Assistant" } else { "Customer" };
            prompt.push_str(&format!(
                "{role}: {}\n",
                truncate_chars(&turn.body, HISTORY_BODY_LIMIT)
            ));
        }
    }

    prompt.push_str("\n\n");
    prompt.push_str(CLOSING_REMINDER);

    ContextData {
        system_prompt: prompt,
        user_message: current.body.clone(),
    }
}

// ── Knowledge-base ranking ───────────────────────────────────────

struct KeywordCategory {
    pricing: bool,
    tokens: &'static [&'static str],
}

const CATEGORIES: &[KeywordCategory] = &[
    KeywordCategory {
        pricing: true,
        tokens: &[
            "harga", "price", "pricing", "biaya", "tarif", "cost", "bayar", "paket", "promo",
        ],
    },
    KeywordCategory {
        pricing: false,
        tokens: &["whatsapp", "wa", "chat", "broadcast", "blast"],
    },
    KeywordCategory {
        pricing: false,
        tokens: &["website", "web", "landing", "domain", "hosting"],
    },
    KeywordCategory {
        pricing: false,
        tokens: &["seo", "google", "ranking", "keyword", "traffic"],
    },
    KeywordCategory {
        pricing: false,
        tokens: &["aplikasi", "app", "mobile", "android", "ios"],
    },
    KeywordCategory {
        pricing: false,
        tokens: &["layanan", "service", "bantuan", "help", "info"],
    },
];

fn is_pricing_kind(kind: &str) -> bool {
    matches!(kind.to_lowercase().as_str(), "pricing" | "price")
}

fn query_mentions_pricing(query_lower: &str) -> bool {
    CATEGORIES
        .iter()
        .filter(|c| c.pricing)
        .flat_map(|c| c.tokens)
        .any(|token| query_lower.contains(token))
}

/// Keyword-weighted relevance of one document to the user's query.
fn score_document(doc: &Document, query_lower: &str) -> i32 {
    let haystack = format!("{} {} {}", doc.title, doc.content, doc.kind).to_lowercase();
    let mut score = 0;

    for category in CATEGORIES {
        for token in category.tokens {
            if query_lower.contains(token) && haystack.contains(token) {
                score += if category.pricing { 10 } else { 5 };
            }
        }
    }

    // Pricing questions should always surface pricing documents, even when
    // the document text itself shares no tokens with the query.
    if is_pricing_kind(&doc.kind) && query_mentions_pricing(query_lower) {
        score = (score + 15).max(5);
    }

    score
}

/// Keep every document when the set is small; rank and keep the best ten
/// otherwise. Ties preserve the configured order (the sort is stable).
fn select_documents<'a>(documents: &'a [Document], query: &str) -> Vec<&'a Document> {
    if documents.len() <= KNOWLEDGE_DOC_LIMIT {
        return documents.iter().collect();
    }

    let query_lower = query.to_lowercase();
    let mut scored: Vec<(&Document, i32)> = documents
        .iter()
        .map(|doc| (doc, score_document(doc, &query_lower)))
        .collect();
    scored.sort_by(|a, b| b.1.cmp(&a.1));

    scored
        .into_iter()
        .take(KNOWLEDGE_DOC_LIMIT)
        .map(|(doc, _)| doc)
        .collect()
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(limit).collect();
        cut.push_str("...");
        cut
    }
}
