//! Hidden-thought filtering for model output.

use once_cell::sync::Lazy;
use regex::Regex;

static COMPLETE_BLOCKS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?s)<think>.*?</think>").unwrap(),
        Regex::new(r"(?s)<thinking>.*?</thinking>").unwrap(),
        Regex::new(r"(?s)<reasoning>.*?</reasoning>").unwrap(),
        Regex::new(r"(?s)\[thinking\].*?\[/thinking\]").unwrap(),
    ]
});

static OPEN_BLOCKS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?s)<think>.*$").unwrap(),
        Regex::new(r"(?s)<thinking>.*$").unwrap(),
        Regex::new(r"(?s)<reasoning>.*$").unwrap(),
        Regex::new(r"(?s)\[thinking\].*$").unwrap(),
    ]
});

static TAGS_ONLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"</?(?:think|thinking|reasoning)>|\[/?thinking\]").unwrap());

/// Strip thinking/reasoning wrappers from model output.
///
/// Complete blocks are removed; an unterminated opening tag suppresses
/// everything after it. With `streaming` set, an all-thinking text filters to
/// empty so the caller can show a thinking indicator. For final text, if
/// stripping removed everything, only the tags are dropped and the inner
/// content is kept so an assistant reply is never persisted empty.
pub fn filter_thinking_content(text: &str, streaming: bool) -> String {
    let mut filtered = text.to_string();
    for re in COMPLETE_BLOCKS.iter() {
        filtered = re.replace_all(&filtered, "").into_owned();
    }
    for re in OPEN_BLOCKS.iter() {
        filtered = re.replace_all(&filtered, "").into_owned();
    }
    let filtered = filtered.trim();

    if !streaming && filtered.is_empty() && !text.trim().is_empty() {
        return TAGS_ONLY.replace_all(text, "").trim().to_string();
    }
    filtered.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_complete_think_block() {
        let text = "<think>reasoning here</think>The answer is 4.";
        assert_eq!(filter_thinking_content(text, false), "The answer is 4.");
        assert_eq!(filter_thinking_content(text, true), "The answer is 4.");
    }

    #[test]
    fn removes_bracket_style_block() {
        let text = "[thinking]let me see[/thinking]Done.";
        assert_eq!(filter_thinking_content(text, false), "Done.");
    }

    #[test]
    fn unterminated_tag_suppresses_tail_during_streaming() {
        let text = "Partial answer <thinking>still going";
        assert_eq!(filter_thinking_content(text, true), "Partial answer");
    }

    #[test]
    fn streaming_all_thinking_filters_to_empty() {
        assert_eq!(filter_thinking_content("<think>only thoughts", true), "");
    }

    #[test]
    fn final_text_keeps_inner_content_when_everything_was_wrapped() {
        let text = "<think>the actual reply</think>";
        assert_eq!(filter_thinking_content(text, false), "the actual reply");
    }

    #[test]
    fn multiple_blocks_are_all_removed() {
        let text = "<think>a</think>Hello <reasoning>b</reasoning>world";
        assert_eq!(filter_thinking_content(text, false), "Hello world");
    }
}
