use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// Namespace for deterministic chunk ids.
const CHUNK_NAMESPACE: Uuid = Uuid::from_u128(0x6c61_7474_6963_655f_6368_756e_6b5f_6e73);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    File,
    Transcript,
    Wiki,
    Web,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub source_type: SourceType,
    pub title: Option<String>,
    pub source_uri: Option<Url>,
    pub raw_text: String,
    /// Byte offsets at which pages start. Empty for unpaged documents.
    #[serde(default)]
    pub page_offsets: Vec<usize>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub collected_at: DateTime<Utc>,
}

impl Document {
    pub fn new(source_type: SourceType, raw_text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_type,
            title: None,
            source_uri: None,
            raw_text: raw_text.into(),
            page_offsets: Vec::new(),
            metadata: serde_json::Value::Object(serde_json::Map::new()),
            collected_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Build a paged document by concatenating page texts.
    pub fn from_pages<I, S>(source_type: SourceType, pages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut raw_text = String::new();
        let mut page_offsets = Vec::new();
        for page in pages {
            page_offsets.push(raw_text.len());
            raw_text.push_str(page.as_ref());
        }
        let mut doc = Self::new(source_type, raw_text);
        doc.page_offsets = page_offsets;
        doc
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub ordinal: usize,
    pub text: String,
    pub token_count: usize,
    /// Number of leading tokens shared with the previous chunk.
    pub overlap_with_prev: usize,
    pub start_offset: usize,
    pub end_offset: usize,
    pub page_number: Option<u32>,
}

impl Chunk {
    /// Deterministic chunk id. The high half depends only on the document and
    /// the ordinal occupies the top of the low half, so ids of one document
    /// sort in reading order.
    pub fn derive_id(document_id: Uuid, ordinal: usize, start: usize, end: usize) -> Uuid {
        let (doc_high, _) = Uuid::new_v5(&CHUNK_NAMESPACE, document_id.as_bytes()).as_u64_pair();
        let span = format!("{start}-{end}");
        let (span_high, _) = Uuid::new_v5(&CHUNK_NAMESPACE, span.as_bytes()).as_u64_pair();
        let low = ((ordinal as u64) << 32) | (span_high & 0xffff_ffff);
        Uuid::from_u64_pair(doc_high, low)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_pages_records_offsets() {
        let doc = Document::from_pages(SourceType::File, ["abc ", "de", "fgh"]);
        assert_eq!(doc.raw_text, "abc defgh");
        assert_eq!(doc.page_offsets, vec![0, 4, 6]);
    }

    #[test]
    fn chunk_ids_are_deterministic() {
        let doc_id = Uuid::new_v4();
        assert_eq!(
            Chunk::derive_id(doc_id, 0, 0, 10),
            Chunk::derive_id(doc_id, 0, 0, 10)
        );
        assert_ne!(
            Chunk::derive_id(doc_id, 0, 0, 10),
            Chunk::derive_id(doc_id, 1, 0, 10)
        );
    }

    #[test]
    fn chunk_ids_sort_in_reading_order() {
        let doc_id = Uuid::new_v4();
        let ids: Vec<Uuid> = (0..20)
            .map(|i| Chunk::derive_id(doc_id, i, i * 7, i * 7 + 30))
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn source_type_serializes_snake_case() {
        let json = serde_json::to_string(&SourceType::Transcript).unwrap();
        assert_eq!(json, "\"transcript\"");
    }
}
