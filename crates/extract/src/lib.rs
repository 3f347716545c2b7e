//! Extracts an executable code block and/or a final-answer marker from
//! raw model output.
//!
//! Code-block discovery walks a real block-level markdown AST via
//! `pulldown-cmark` rather than regexing fenced blocks out of the text —
//! spec requires this and treats a regex fallback as a build-time error,
//! not a runtime one, so there is no fallback path here at all.

use once_cell::sync::Lazy;
use pulldown_cmark::{CodeBlockKind, Event, Parser, Tag, TagEnd};
use regex::Regex;

const ACCEPTED_INFO_STRINGS: [&str; 3] = ["", "python", "py"];

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Extraction {
    pub code: Option<String>,
    pub final_answer: Option<String>,
}

pub fn extract(model_text: &str) -> Extraction {
    Extraction { code: find_first_code_block(model_text), final_answer: find_final_answer(model_text) }
}

fn find_first_code_block(text: &str) -> Option<String> {
    let parser = Parser::new(text);
    let mut in_accepted_block = false;
    let mut buffer = String::new();
    let mut result = None;

    for event in parser {
        match event {
            Event::Start(Tag::CodeBlock(kind)) => {
                let info = match &kind {
                    CodeBlockKind::Fenced(info) => info.as_ref().trim(),
                    CodeBlockKind::Indented => "",
                };
                in_accepted_block = result.is_none() && ACCEPTED_INFO_STRINGS.contains(&info);
                buffer.clear();
            }
            Event::Text(t) if in_accepted_block => buffer.push_str(&t),
            Event::End(TagEnd::CodeBlock) => {
                if in_accepted_block {
                    result = Some(std::mem::take(&mut buffer));
                }
                in_accepted_block = false;
            }
            _ => {}
        }
    }
    result
}

static FINAL_COLON: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?mi)^\s*final:\s*(.*)$").unwrap());
static FINAL_ANSWER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?mi)^\s*final answer:\s*(.*)$").unwrap());

/// Scans the whole text (code blocks included) for the first of the
/// three final-answer forms, in text order.
fn find_final_answer(text: &str) -> Option<String> {
    let mut candidates: Vec<(usize, String)> = Vec::new();

    if let Some((pos, payload)) = find_final_paren(text) {
        candidates.push((pos, payload));
    }
    if let Some(caps) = FINAL_COLON.captures(text) {
        let whole = caps.get(0).unwrap();
        candidates.push((whole.start(), caps.get(1).unwrap().as_str().trim().to_string()));
    }
    if let Some(caps) = FINAL_ANSWER.captures(text) {
        let whole = caps.get(0).unwrap();
        candidates.push((whole.start(), caps.get(1).unwrap().as_str().trim().to_string()));
    }

    candidates.into_iter().min_by_key(|(pos, _)| *pos).map(|(_, payload)| payload)
}

/// Finds the first `FINAL(` occurrence and its outermost-balanced
/// matching `)`, returning the byte offset of the match and the trimmed
/// payload between the parens.
fn find_final_paren(text: &str) -> Option<(usize, String)> {
    const NEEDLE: &str = "FINAL(";
    let mut search_from = 0;
    while let Some(rel) = text[search_from..].find(NEEDLE) {
        let start = search_from + rel;
        let open_paren = start + NEEDLE.len() - 1;
        if let Some(close) = matching_paren(text, open_paren) {
            return Some((start, text[open_paren + 1..close].trim().to_string()));
        }
        search_from = start + NEEDLE.len();
    }
    None
}

fn matching_paren(text: &str, open_idx: usize) -> Option<usize> {
    let mut depth = 0i32;
    for (i, c) in text.char_indices().skip_while(|(i, _)| *i < open_idx) {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_untagged_fenced_block() {
        let text = "Here goes:\n```\nprint(1)\n```\n";
        let extraction = extract(text);
        assert_eq!(extraction.code.as_deref(), Some("print(1)\n"));
    }

    #[test]
    fn extracts_python_tagged_block_and_skips_other_languages() {
        let text = "```bash\necho hi\n```\n```python\nprint(2)\n```\n";
        let extraction = extract(text);
        assert_eq!(extraction.code.as_deref(), Some("print(2)\n"));
    }

    #[test]
    fn extracts_py_shorthand() {
        let text = "```py\nx = 1\n```\n";
        let extraction = extract(text);
        assert_eq!(extraction.code.as_deref(), Some("x = 1\n"));
    }

    #[test]
    fn picks_first_accepted_block_only() {
        let text = "```python\nfirst()\n```\n```python\nsecond()\n```\n";
        let extraction = extract(text);
        assert_eq!(extraction.code.as_deref(), Some("first()\n"));
    }

    #[test]
    fn no_code_block_and_no_marker_returns_neither() {
        let extraction = extract("just some prose, nothing actionable");
        assert!(extraction.code.is_none());
        assert!(extraction.final_answer.is_none());
    }

    #[test]
    fn recognizes_final_paren_form() {
        let extraction = extract("the answer is FINAL(42) as computed");
        assert_eq!(extraction.final_answer.as_deref(), Some("42"));
    }

    #[test]
    fn final_paren_handles_nested_parens_in_payload() {
        let extraction = extract("FINAL((1 + 2) * 3)");
        assert_eq!(extraction.final_answer.as_deref(), Some("(1 + 2) * 3"));
    }

    #[test]
    fn recognizes_final_colon_form_case_insensitively() {
        let extraction = extract("reasoning...\nfinal: 4\n");
        assert_eq!(extraction.final_answer.as_deref(), Some("4"));
    }

    #[test]
    fn recognizes_final_answer_form() {
        let extraction = extract("Final Answer: the sky is blue\n");
        assert_eq!(extraction.final_answer.as_deref(), Some("the sky is blue"));
    }

    #[test]
    fn earliest_marker_in_text_order_wins() {
        let text = "FINAL: first\nFinal Answer: second\n";
        let extraction = extract(text);
        assert_eq!(extraction.final_answer.as_deref(), Some("first"));
    }
}
