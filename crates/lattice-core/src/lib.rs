pub mod api_types;
pub mod config;
pub mod cypher;
pub mod document;
pub mod entity;
pub mod error;
pub mod extraction;
pub mod graph;
pub mod llm;
pub mod reasoning;

pub use config::{AppConfig, ChunkerConfig, GraphBackend, PipelineConfig, QaConfig, SplitStrategy};
pub use document::{Chunk, Document, SourceType};
pub use entity::{
    ChunkExtraction, DropReason, DroppedRecord, ExtractedEdge, ExtractedNode, GraphEdge,
    GraphNode, MergeConflict, NodeRef, Properties, PropertyValue, SourcedValue,
};
pub use error::{LatticeError, Result};
pub use extraction::{ExtractionPipeline, SchemaConfig};
pub use graph::{
    ChunkPage, ChunkPageItem, DocumentGraph, DocumentSummary, GraphSchema, GraphStore, ResultRow,
    UpsertResult,
};
pub use llm::{LanguageModel, Prompt, ResponseFormat, RetryPolicy};
pub use reasoning::{Answer, AnswerOutcome, Query};
