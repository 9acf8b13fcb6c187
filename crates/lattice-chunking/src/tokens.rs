use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

/// Leading whitespace at the start, then word runs or single punctuation
/// characters, each carrying its trailing whitespace.
static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s+|\w+\s*|[^\w\s]\s*").expect("valid regex"));

/// Byte ranges of the tokens of `text`. The ranges are contiguous and cover
/// the whole input.
pub fn tokenize(text: &str) -> Vec<Range<usize>> {
    TOKEN_RE.find_iter(text).map(|m| m.range()).collect()
}

/// True when the token's trailing whitespace contains a blank line.
pub(crate) fn ends_paragraph(token: &str) -> bool {
    token.chars().filter(|c| *c == '\n').count() >= 2
}

/// True when the token closes a sentence: terminal punctuation followed by
/// whitespace.
pub(crate) fn ends_sentence(token: &str) -> bool {
    let trimmed = token.trim_end();
    trimmed.len() < token.len() && matches!(trimmed, "." | "!" | "?")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts<'a>(text: &'a str) -> Vec<&'a str> {
        tokenize(text).into_iter().map(|r| &text[r]).collect()
    }

    #[test]
    fn tokens_reproduce_text() {
        let text = "  Alice founded Acme, in 1999!\n\nThen: more.";
        let joined: String = texts(text).concat();
        assert_eq!(joined, text);
    }

    #[test]
    fn punctuation_is_its_own_token() {
        assert_eq!(texts("Acme, Inc."), vec!["Acme", ", ", "Inc", "."]);
    }

    #[test]
    fn leading_whitespace_is_one_token() {
        assert_eq!(texts("\n  hi there"), vec!["\n  ", "hi ", "there"]);
    }

    #[test]
    fn empty_text_has_no_tokens() {
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn detects_paragraph_and_sentence_ends() {
        assert!(ends_paragraph("end.\n\n"));
        assert!(ends_paragraph("word \n \n"));
        assert!(!ends_paragraph("word\n"));
        assert!(ends_sentence(". "));
        assert!(ends_sentence("?\n"));
        assert!(!ends_sentence("."));
        assert!(!ends_sentence("word "));
    }
}
