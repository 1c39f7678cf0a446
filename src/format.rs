//! Converts model output (markdown-flavored) into WhatsApp formatting.
//!
//! WhatsApp renders `*bold*`, `_italic_`, `~strike~`, and triple-backtick
//! code, but not markdown headings, `**bold**`, or `* ` bullets.

use regex::Regex;
use std::sync::LazyLock;

static BOLD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*([^*]+?)\*\*").unwrap());
static LIST_BOLD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\*\s+\*([^*]+?)\*\s*(.*)$").unwrap());
static LIST: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\*\s+").unwrap());
static MULTI_NEWLINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Rewrite a model reply for WhatsApp delivery.
pub fn format_for_whatsapp(text: &str) -> String {
    // **bold** -> *bold* (before list handling so markers don't collide)
    let text = BOLD.replace_all(text, "*$1*");
    // "*   *Item:* description" -> "- *Item:* description"
    let text = LIST_BOLD.replace_all(&text, "- *$1* $2");
    // remaining "* item" bullets -> "- item"
    let text = LIST.replace_all(&text, "- ");
    // collapse 3+ newlines to a paragraph break
    let text = MULTI_NEWLINE.replace_all(&text, "\n\n");

    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_asterisk_bold_becomes_single() {
        assert_eq!(format_for_whatsapp("**penting**"), "*penting*");
        assert_eq!(
            format_for_whatsapp("ini **sangat** bagus"),
            "ini *sangat* bagus"
        );
    }

    #[test]
    fn single_asterisk_bold_is_untouched() {
        assert_eq!(format_for_whatsapp("*sudah benar*"), "*sudah benar*");
    }

    #[test]
    fn markdown_bullets_become_dashes() {
        assert_eq!(
            format_for_whatsapp("* satu\n* dua"),
            "- satu\n- dua"
        );
    }

    #[test]
    fn bold_list_items_convert() {
        assert_eq!(
            format_for_whatsapp("*   **Harga:** mulai 100rb"),
            "- *Harga:* mulai 100rb"
        );
    }

    #[test]
    fn excess_newlines_collapse() {
        assert_eq!(
            format_for_whatsapp("baris satu\n\n\n\nbaris dua"),
            "baris satu\n\nbaris dua"
        );
    }

    #[test]
    fn surrounding_whitespace_is_trimmed() {
        assert_eq!(format_for_whatsapp("  halo  \n"), "halo");
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(format_for_whatsapp("halo, ada yang bisa dibantu?"),
                   "halo, ada yang bisa dibantu?");
    }
}
