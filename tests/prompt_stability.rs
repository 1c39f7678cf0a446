//! Prompt-assembly contract: block order and byte-for-byte stability.

use chrono::{TimeZone, Utc};
use replyq::context::{assemble, CLOSING_REMINDER, DEFAULT_SYSTEM_PROMPT, FORMATTING_RULES};
use replyq::db::InboundTurn;
use replyq::directory::{BotSettings, Document};

fn turn(id: i64, body: &str, from_me: bool) -> InboundTurn {
    InboundTurn {
        id,
        message_id: format!("m{id}"),
        session_tok: "sess-1".into(),
        from_jid: "628123@s.whatsapp.net".into(),
        to_jid: "self@s.whatsapp.net".into(),
        from_me,
        msg_type: "text".into(),
        body: body.into(),
        push_name: "Budi".into(),
        is_read: false,
        timestamp: Utc.timestamp_opt(1_736_899_800 + id, 0).unwrap(),
    }
}

fn fixture_settings() -> BotSettings {
    BotSettings {
        system_prompt: "Kamu adalah asisten toko Genta Digital.".into(),
        fallback_text: String::new(),
        documents: vec![
            Document {
                title: "Layanan".into(),
                content: "Kami menyediakan layanan pembuatan website dan aplikasi.".into(),
                kind: "general".into(),
            },
            Document {
                title: "Daftar Harga".into(),
                content: "Paket website mulai Rp500.000.".into(),
                kind: "pricing".into(),
            },
        ],
    }
}

#[test]
fn blocks_appear_in_contract_order() {
    let turns = vec![turn(2, "mau tanya harga", false), turn(1, "halo", false)];
    let current = turn(2, "mau tanya harga", false);
    let ctx = assemble(&fixture_settings(), &turns, &current, 10);

    let prompt = &ctx.system_prompt;
    let base = prompt.find("Kamu adalah asisten toko Genta Digital.").unwrap();
    let rules = prompt.find("=== Aturan Balasan ===").unwrap();
    let knowledge = prompt.find("=== Knowledge Base ===").unwrap();
    let history = prompt.find("=== Conversation History ===").unwrap();
    let reminder = prompt.find("=== Pengingat ===").unwrap();

    assert!(base < rules);
    assert!(rules < knowledge);
    assert!(knowledge < history);
    assert!(history < reminder);
    assert_eq!(ctx.user_message, "mau tanya harga");
}

#[test]
fn identical_inputs_produce_identical_bytes() {
    let turns = vec![turn(2, "kedua", true), turn(1, "pertama", false)];
    let current = turn(3, "berapa harga paket website?", false);

    let first = assemble(&fixture_settings(), &turns, &current, 10);
    let second = assemble(&fixture_settings(), &turns, &current, 10);

    assert_eq!(first.system_prompt, second.system_prompt);
    assert_eq!(first.user_message, second.user_message);
}

#[test]
fn narrower_window_only_changes_the_history_block() {
    // Five stored turns, newest first.
    let turns_wide: Vec<InboundTurn> = (1..=5).rev().map(|i| turn(i, &format!("pesan {i}"), false)).collect();
    let turns_narrow: Vec<InboundTurn> = (4..=5).rev().map(|i| turn(i, &format!("pesan {i}"), false)).collect();
    let current = turn(5, "pesan 5", false);

    let wide = assemble(&fixture_settings(), &turns_wide, &current, 10);
    let narrow = assemble(&fixture_settings(), &turns_narrow, &current, 2);

    assert!(wide.system_prompt.contains("Customer: pesan 1"));
    assert!(!narrow.system_prompt.contains("Customer: pesan 1"));
    assert!(narrow.system_prompt.contains("Customer: pesan 4"));
    // Everything outside the history block is identical.
    assert_eq!(wide.user_message, narrow.user_message);
    let prefix_wide = wide.system_prompt.split("=== Conversation History ===").next().unwrap();
    let prefix_narrow = narrow.system_prompt.split("=== Conversation History ===").next().unwrap();
    assert_eq!(prefix_wide, prefix_narrow);
}

#[test]
fn pinned_blocks_are_present_verbatim() {
    let current = turn(1, "halo", false);
    let ctx = assemble(&BotSettings::default(), &[], &current, 10);

    assert!(ctx.system_prompt.starts_with(DEFAULT_SYSTEM_PROMPT));
    assert!(ctx.system_prompt.contains(FORMATTING_RULES));
    assert!(ctx.system_prompt.ends_with(CLOSING_REMINDER));
}
