use std::ops::Range;

use lattice_core::config::{ChunkerConfig, SplitStrategy};
use lattice_core::document::{Chunk, Document};
use lattice_core::error::{LatticeError, Result};
use tracing::{debug, warn};

use crate::similarity::{LexicalJaccard, SimilaritySignal};
use crate::tokens::{ends_paragraph, ends_sentence, tokenize};

/// Token-index span of one chunk within its segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    start: usize,
    end: usize,
    overlap: usize,
}

/// A block or sentence to be packed greedily.
#[derive(Debug, Clone)]
struct Unit {
    tokens: Range<usize>,
    break_before: bool,
}

/// Split a document with the lexical similarity signal.
pub fn split(document: &Document, config: &ChunkerConfig) -> Result<Vec<Chunk>> {
    split_with_signal(document, config, &LexicalJaccard)
}

/// Split a document into ordered, bounded chunks. Pure and deterministic for
/// a given document, configuration and signal.
pub fn split_with_signal(
    document: &Document,
    config: &ChunkerConfig,
    signal: &dyn SimilaritySignal,
) -> Result<Vec<Chunk>> {
    config.validate()?;

    let mut chunks = Vec::new();
    for (segment, page_number) in page_segments(document)? {
        let text = &document.raw_text[segment.clone()];
        let tokens = tokenize(text);
        let windows = match config.strategy {
            SplitStrategy::FixedToken => {
                fixed_windows(0..tokens.len(), config.chunk_size, config.chunk_overlap)
            }
            SplitStrategy::Structural => pack(
                &structural_units(text, &tokens),
                config.chunk_size,
                config.chunk_overlap,
            ),
            SplitStrategy::Semantic => pack(
                &semantic_units(text, &tokens, config.semantic_threshold, signal),
                config.chunk_size,
                config.chunk_overlap,
            ),
        };

        for window in windows {
            let start = segment.start + tokens[window.start].start;
            let end = segment.start + tokens[window.end - 1].end;
            let ordinal = chunks.len();
            chunks.push(Chunk {
                id: Chunk::derive_id(document.id, ordinal, start, end),
                document_id: document.id,
                ordinal,
                text: document.raw_text[start..end].to_string(),
                token_count: window.end - window.start,
                overlap_with_prev: window.overlap,
                start_offset: start,
                end_offset: end,
                page_number,
            });
        }
    }

    if let Some(max) = config.max_chunks {
        if chunks.len() > max {
            warn!(
                document_id = %document.id,
                produced = chunks.len(),
                max_chunks = max,
                "Chunk cap reached, discarding trailing chunks"
            );
            chunks.truncate(max);
        }
    }

    debug!(
        document_id = %document.id,
        strategy = ?config.strategy,
        chunks = chunks.len(),
        "Document split"
    );
    Ok(chunks)
}

/// Byte ranges to split independently, with their 1-based page numbers.
fn page_segments(document: &Document) -> Result<Vec<(Range<usize>, Option<u32>)>> {
    let text = &document.raw_text;
    let offsets = &document.page_offsets;
    if offsets.is_empty() {
        return Ok(vec![(0..text.len(), None)]);
    }
    if offsets[0] != 0 {
        return Err(LatticeError::Config(
            "page_offsets must start at 0".into(),
        ));
    }

    let mut segments = Vec::with_capacity(offsets.len());
    for (i, &start) in offsets.iter().enumerate() {
        let end = offsets.get(i + 1).copied().unwrap_or(text.len());
        if start > end || end > text.len() || !text.is_char_boundary(start) || !text.is_char_boundary(end) {
            return Err(LatticeError::Config(format!(
                "invalid page offset {start} for page {}",
                i + 1
            )));
        }
        segments.push((start..end, Some((i + 1) as u32)));
    }
    Ok(segments)
}

/// Fixed-size windows with `overlap` tokens shared between neighbours.
fn fixed_windows(tokens: Range<usize>, size: usize, overlap: usize) -> Vec<Window> {
    let mut windows = Vec::new();
    let mut start = tokens.start;
    while start < tokens.end {
        let end = (start + size).min(tokens.end);
        windows.push(Window {
            start,
            end,
            overlap: if windows.is_empty() { 0 } else { overlap },
        });
        if end == tokens.end {
            break;
        }
        start = end - overlap;
    }
    windows
}

/// Greedy packing of contiguous units up to `size` tokens. Oversize units
/// fall back to fixed windows.
fn pack(units: &[Unit], size: usize, overlap: usize) -> Vec<Window> {
    let mut windows = Vec::new();
    let mut current: Option<Range<usize>> = None;

    for unit in units.iter().filter(|u| !u.tokens.is_empty()) {
        let len = unit.tokens.len();
        if len > size {
            flush(&mut windows, &mut current);
            windows.extend(fixed_windows(unit.tokens.clone(), size, overlap));
            continue;
        }
        match current.as_mut() {
            Some(open) if !unit.break_before && open.len() + len <= size => {
                open.end = unit.tokens.end;
            }
            _ => {
                flush(&mut windows, &mut current);
                current = Some(unit.tokens.clone());
            }
        }
    }
    flush(&mut windows, &mut current);
    windows
}

fn flush(windows: &mut Vec<Window>, current: &mut Option<Range<usize>>) {
    if let Some(open) = current.take() {
        windows.push(Window {
            start: open.start,
            end: open.end,
            overlap: 0,
        });
    }
}

fn is_heading_start(text: &str, tokens: &[Range<usize>], i: usize) -> bool {
    let token = &tokens[i];
    text[token.clone()].starts_with('#')
        && (token.start == 0 || text[..token.start].ends_with('\n'))
}

/// Paragraph blocks. Markdown headings open a block and force a new chunk.
fn structural_units(text: &str, tokens: &[Range<usize>]) -> Vec<Unit> {
    let mut units = Vec::new();
    let mut start = 0;
    for i in 0..tokens.len() {
        if i > start && is_heading_start(text, tokens, i) {
            units.push(Unit {
                tokens: start..i,
                break_before: is_heading_start(text, tokens, start),
            });
            start = i;
        }
        if ends_paragraph(&text[tokens[i].clone()]) {
            units.push(Unit {
                tokens: start..i + 1,
                break_before: is_heading_start(text, tokens, start),
            });
            start = i + 1;
        }
    }
    if start < tokens.len() {
        units.push(Unit {
            tokens: start..tokens.len(),
            break_before: is_heading_start(text, tokens, start),
        });
    }
    units
}

/// Sentences, breaking where adjacent similarity drops below `threshold`.
fn semantic_units(
    text: &str,
    tokens: &[Range<usize>],
    threshold: f32,
    signal: &dyn SimilaritySignal,
) -> Vec<Unit> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for (i, token) in tokens.iter().enumerate() {
        if ends_sentence(&text[token.clone()]) {
            sentences.push(start..i + 1);
            start = i + 1;
        }
    }
    if start < tokens.len() {
        sentences.push(start..tokens.len());
    }

    let span = |r: &Range<usize>| &text[tokens[r.start].start..tokens[r.end - 1].end];
    let mut units: Vec<Unit> = Vec::with_capacity(sentences.len());
    for (i, sentence) in sentences.iter().enumerate() {
        let break_before = i > 0 && signal.similarity(span(&sentences[i - 1]), span(sentence)) < threshold;
        units.push(Unit {
            tokens: sentence.clone(),
            break_before,
        });
    }
    units
}

#[cfg(test)]
mod tests {
    use lattice_core::document::SourceType;
    use proptest::prelude::*;

    use super::*;

    fn config(strategy: SplitStrategy, chunk_size: usize, chunk_overlap: usize) -> ChunkerConfig {
        ChunkerConfig {
            chunk_size,
            chunk_overlap,
            strategy,
            ..Default::default()
        }
    }

    fn doc(text: &str) -> Document {
        Document::new(SourceType::File, text)
    }

    /// Chunk texts with each chunk's overlap prefix removed, concatenated.
    fn reassemble(chunks: &[Chunk]) -> String {
        chunks
            .iter()
            .map(|c| {
                let tokens = tokenize(&c.text);
                let skip = tokens
                    .get(c.overlap_with_prev)
                    .map(|r| r.start)
                    .unwrap_or(c.text.len());
                &c.text[skip..]
            })
            .collect()
    }

    struct Topics;

    impl SimilaritySignal for Topics {
        fn similarity(&self, a: &str, b: &str) -> f32 {
            if a.contains("cat") == b.contains("cat") {
                1.0
            } else {
                0.0
            }
        }
    }

    #[test]
    fn fixed_windows_overlap() {
        let text = "one two three four five six seven eight nine ten";
        let chunks = split(&doc(text), &config(SplitStrategy::FixedToken, 4, 1)).unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text, "one two three four ");
        assert_eq!(chunks[1].text, "four five six seven ");
        assert_eq!(chunks[2].text, "seven eight nine ten");
        assert_eq!(chunks[0].overlap_with_prev, 0);
        assert_eq!(chunks[1].overlap_with_prev, 1);
        assert_eq!(reassemble(&chunks), text);
    }

    #[test]
    fn empty_document_has_no_chunks() {
        let chunks = split(&doc(""), &ChunkerConfig::default()).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn invalid_config_is_rejected_before_splitting() {
        let err = split(&doc("text"), &config(SplitStrategy::FixedToken, 3, 3)).unwrap_err();
        assert!(matches!(err, LatticeError::Config(_)));
    }

    #[test]
    fn structural_packs_paragraphs_and_breaks_on_headings() {
        let text = "# Intro\n\nAlice founded Acme.\n\nShe lives in Paris.\n\n# History\n\nAcme grew.";
        let chunks = split(&doc(text), &config(SplitStrategy::Structural, 50, 5)).unwrap();

        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].text.starts_with("# Intro"));
        assert!(chunks[0].text.contains("Paris"));
        assert!(chunks[1].text.starts_with("# History"));
        assert!(chunks.iter().all(|c| c.overlap_with_prev == 0));
        assert_eq!(reassemble(&chunks), text);
    }

    #[test]
    fn structural_sub_splits_oversize_blocks() {
        let text = "a b c d e f g h\n\nshort";
        let chunks = split(&doc(text), &config(SplitStrategy::Structural, 4, 1)).unwrap();

        assert!(chunks.iter().all(|c| c.token_count <= 4));
        assert_eq!(chunks.last().unwrap().text, "short");
        assert_eq!(reassemble(&chunks), text);
    }

    #[test]
    fn semantic_breaks_on_topic_shift() {
        let text = "The cat sat. The cat slept. Stocks fell today. Markets closed lower.";
        let document = doc(text);
        let chunks =
            split_with_signal(&document, &config(SplitStrategy::Semantic, 100, 0), &Topics).unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "The cat sat. The cat slept. ");
        assert_eq!(chunks[1].text, "Stocks fell today. Markets closed lower.");
    }

    #[test]
    fn semantic_respects_size_ceiling() {
        let text = "The cat sat on the mat. The cat slept on the mat all day long.";
        let chunks =
            split_with_signal(&doc(text), &config(SplitStrategy::Semantic, 5, 1), &Topics).unwrap();

        assert!(chunks.iter().all(|c| c.token_count <= 5));
        assert_eq!(reassemble(&chunks), text);
    }

    #[test]
    fn paged_documents_never_cross_pages() {
        let document = Document::from_pages(
            SourceType::File,
            ["page one has words ", "page two has more words"],
        );
        let chunks = split(&document, &config(SplitStrategy::FixedToken, 3, 1)).unwrap();

        assert!(chunks.iter().all(|c| c.page_number.is_some()));
        let boundary = document.page_offsets[1];
        for chunk in &chunks {
            assert!(chunk.end_offset <= boundary || chunk.start_offset >= boundary);
        }
        let ordinals: Vec<usize> = chunks.iter().map(|c| c.ordinal).collect();
        assert_eq!(ordinals, (0..chunks.len()).collect::<Vec<_>>());
        assert_eq!(chunks.last().unwrap().page_number, Some(2));
        let first_on_page_two = chunks.iter().find(|c| c.page_number == Some(2)).unwrap();
        assert_eq!(first_on_page_two.overlap_with_prev, 0);
    }

    #[test]
    fn page_offsets_must_start_at_zero() {
        let mut document = doc("abc def");
        document.page_offsets = vec![3];
        assert!(split(&document, &ChunkerConfig::default()).is_err());
    }

    #[test]
    fn max_chunks_caps_output() {
        let text = "a b c d e f g h i j";
        let cfg = ChunkerConfig {
            max_chunks: Some(2),
            ..config(SplitStrategy::FixedToken, 2, 0)
        };
        let chunks = split(&doc(text), &cfg).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].ordinal, 1);
    }

    #[test]
    fn splitting_is_deterministic() {
        let document = doc("Alice founded Acme. Bob joined Acme in 2001. They moved to Paris.");
        let cfg = config(SplitStrategy::Semantic, 6, 2);
        assert_eq!(split(&document, &cfg).unwrap(), split(&document, &cfg).unwrap());
    }

    fn size_and_overlap() -> impl Strategy<Value = (usize, usize)> {
        (1usize..24).prop_flat_map(|size| (Just(size), 0..size))
    }

    fn strategy() -> impl Strategy<Value = SplitStrategy> {
        prop_oneof![
            Just(SplitStrategy::FixedToken),
            Just(SplitStrategy::Structural),
            Just(SplitStrategy::Semantic),
        ]
    }

    proptest! {
        #[test]
        fn chunks_cover_source_and_respect_ceiling(
            text in "[a-zA-Zé0-9 ,.!?#\n]{0,300}",
            (size, overlap) in size_and_overlap(),
            strategy in strategy(),
        ) {
            let cfg = config(strategy, size, overlap);
            let chunks = split(&doc(&text), &cfg).unwrap();

            prop_assert_eq!(reassemble(&chunks), text);
            for chunk in &chunks {
                prop_assert!(chunk.token_count <= size);
                prop_assert!(chunk.token_count > 0);
                prop_assert_eq!(tokenize(&chunk.text).len(), chunk.token_count);
            }
        }
    }
}
