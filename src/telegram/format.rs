//! Markdown to Telegram-HTML conversion and message splitting.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::MAX_MESSAGE_LENGTH;

static CODE_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```(?:\w*\n)?(.*?)```").unwrap());
static INLINE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`]+)`").unwrap());
static HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#{1,6}\s+(.+)$").unwrap());
static HRULE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[-*_]{3,}\s*$").unwrap());
static UL_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^([ \t]*)[-*+]\s+").unwrap());
static OL_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^([ \t]*)(\d+)\.\s+").unwrap());
static BOLD_STARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*(.+?)\*\*").unwrap());
static BOLD_UNDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"__(.+?)__").unwrap());
static ITALIC_STAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^|[^\w*])\*([^*\n]+?)\*($|[^\w*])").unwrap());
static ITALIC_UNDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^|[^\w_])_([^_\n]+?)_($|[^\w_])").unwrap());
static STRIKE: Lazy<Regex> = Lazy::new(|| Regex::new(r"~~(.+?)~~").unwrap());
static LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").unwrap());

pub fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Convert common Markdown to the HTML subset Telegram renders. Code spans
/// are lifted out first so nothing inside them is rewritten.
pub fn markdown_to_telegram_html(text: &str) -> String {
    if text.is_empty() {
        return text.to_string();
    }

    let mut code_blocks = Vec::new();
    let text = CODE_BLOCK
        .replace_all(text, |caps: &regex::Captures| {
            code_blocks.push(caps[1].to_string());
            format!("\u{0}CODEBLOCK{}\u{0}", code_blocks.len() - 1)
        })
        .into_owned();

    let mut inline_codes = Vec::new();
    let text = INLINE_CODE
        .replace_all(&text, |caps: &regex::Captures| {
            inline_codes.push(caps[1].to_string());
            format!("\u{0}INLINECODE{}\u{0}", inline_codes.len() - 1)
        })
        .into_owned();

    let text = HEADER.replace_all(&text, "**$1**").into_owned();
    let text = HRULE.replace_all(&text, "──────────").into_owned();
    let text = UL_ITEM.replace_all(&text, "$1• ").into_owned();
    let text = OL_ITEM.replace_all(&text, "$1$2. ").into_owned();

    let text = html_escape(&text);

    let text = BOLD_STARS.replace_all(&text, "<b>$1</b>").into_owned();
    let text = BOLD_UNDER.replace_all(&text, "<b>$1</b>").into_owned();
    let text = ITALIC_STAR.replace_all(&text, "$1<i>$2</i>$3").into_owned();
    let text = ITALIC_UNDER.replace_all(&text, "$1<i>$2</i>$3").into_owned();
    let text = STRIKE.replace_all(&text, "<s>$1</s>").into_owned();
    let mut text = LINK.replace_all(&text, r#"<a href="$2">$1</a>"#).into_owned();

    for (i, code) in code_blocks.iter().enumerate() {
        text = text.replace(
            &format!("\u{0}CODEBLOCK{i}\u{0}"),
            &format!("<pre>{}</pre>", html_escape(code)),
        );
    }
    for (i, code) in inline_codes.iter().enumerate() {
        text = text.replace(
            &format!("\u{0}INLINECODE{i}\u{0}"),
            &format!("<code>{}</code>", html_escape(code)),
        );
    }

    text
}

/// Split a long message into Telegram-sized chunks, preferring paragraph
/// boundaries, then line boundaries, then hard character splits.
pub fn split_message(text: &str, max_length: usize) -> Vec<String> {
    if text.chars().count() <= max_length {
        return vec![text.to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    let fits = |current: &str, extra: &str, sep: usize| {
        current.chars().count() + extra.chars().count() + sep <= max_length
    };

    for para in text.split("\n\n") {
        if fits(&current, para, 2) {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(para);
            continue;
        }
        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if para.chars().count() <= max_length {
            current = para.to_string();
            continue;
        }
        for line in para.split('\n') {
            if fits(&current, line, 1) {
                if !current.is_empty() {
                    current.push('\n');
                }
                current.push_str(line);
                continue;
            }
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            if line.chars().count() > max_length {
                let mut buf = String::new();
                for ch in line.chars() {
                    buf.push(ch);
                    if buf.chars().count() == max_length {
                        chunks.push(std::mem::take(&mut buf));
                    }
                }
                current = buf;
            } else {
                current = line.to_string();
            }
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Truncate to the single-message limit, marking the cut.
pub fn truncate_for_edit(text: &str) -> String {
    if text.chars().count() <= MAX_MESSAGE_LENGTH {
        return text.to_string();
    }
    let mut out: String = text.chars().take(MAX_MESSAGE_LENGTH - 3).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"</?[a-z]+[^>]*>").unwrap());

    fn strip_html(text: &str) -> String {
        let text = HTML_TAG.replace_all(text, "").into_owned();
        text.replace("&amp;", "&").replace("&lt;", "<").replace("&gt;", ">")
    }

    #[test]
    fn plain_text_round_trips_through_html() {
        let plain = "Just a sentence with numbers 123 and punctuation.";
        let html = markdown_to_telegram_html(plain);
        assert_eq!(strip_html(&html), plain);
    }

    #[test]
    fn bold_and_italic_convert() {
        let html = markdown_to_telegram_html("**bold** and *em* here");
        assert!(html.contains("<b>bold</b>"));
        assert!(html.contains("<i>em</i>"));
    }

    #[test]
    fn headers_become_bold() {
        let html = markdown_to_telegram_html("## Section title\nbody");
        assert!(html.contains("<b>Section title</b>"));
    }

    #[test]
    fn code_spans_are_protected_from_markdown() {
        let html = markdown_to_telegram_html("Use `let *x* = 1;` here");
        assert!(html.contains("<code>let *x* = 1;</code>"));
    }

    #[test]
    fn code_blocks_escape_html() {
        let html = markdown_to_telegram_html("```rust\nif a < b {}\n```");
        assert!(html.contains("<pre>if a &lt; b {}\n</pre>"));
    }

    #[test]
    fn links_convert() {
        let html = markdown_to_telegram_html("[docs](https://example.com)");
        assert_eq!(html, r#"<a href="https://example.com">docs</a>"#);
    }

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_message("hello", 100), vec!["hello"]);
    }

    #[test]
    fn splits_on_paragraph_boundaries_first() {
        let text = format!("{}\n\n{}", "a".repeat(60), "b".repeat(60));
        let chunks = split_message(&text, 100);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].chars().all(|c| c == 'a'));
    }

    #[test]
    fn hard_splits_overlong_lines() {
        let text = "x".repeat(250);
        let chunks = split_message(&text, 100);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 100));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn multibyte_text_splits_without_panicking(){
        let text = "日本語のテキスト".repeat(100);
        let chunks = split_message(&text, 64);
        assert!(chunks.iter().all(|c| c.chars().count() <= 64));
        assert_eq!(chunks.concat(), text);
    }
}
