use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

static WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w+").expect("valid regex"));

/// Similarity between adjacent sentences, in `[0, 1]`. Semantic splitting
/// declares a topic shift where this drops below the configured threshold.
pub trait SimilaritySignal: Send + Sync {
    fn similarity(&self, a: &str, b: &str) -> f32;
}

/// Jaccard overlap of lowercased word sets.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalJaccard;

impl LexicalJaccard {
    fn words(text: &str) -> HashSet<String> {
        WORD_RE
            .find_iter(text)
            .map(|m| m.as_str().to_lowercase())
            .collect()
    }
}

impl SimilaritySignal for LexicalJaccard {
    fn similarity(&self, a: &str, b: &str) -> f32 {
        let a = Self::words(a);
        let b = Self::words(b);
        if a.is_empty() && b.is_empty() {
            return 1.0;
        }
        let shared = a.intersection(&b).count();
        let union = a.union(&b).count();
        shared as f32 / union as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_sentences_are_fully_similar() {
        let s = LexicalJaccard;
        assert_eq!(s.similarity("Alice founded Acme.", "alice FOUNDED acme"), 1.0);
    }

    #[test]
    fn disjoint_sentences_have_zero_similarity() {
        let s = LexicalJaccard;
        assert_eq!(s.similarity("Alice founded Acme.", "Rain fell today."), 0.0);
    }

    #[test]
    fn partial_overlap() {
        let s = LexicalJaccard;
        let sim = s.similarity("a b c", "b c d");
        assert!((sim - 0.5).abs() < f32::EPSILON);
    }
}
