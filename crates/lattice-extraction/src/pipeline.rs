use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use lattice_core::document::Chunk;
use lattice_core::entity::{
    ChunkExtraction, DropReason, DroppedRecord, ExtractedEdge, ExtractedNode, NodeRef, PropertyValue,
};
use lattice_core::error::{LatticeError, Result};
use lattice_core::extraction::{ExtractionPipeline, SchemaConfig};
use lattice_core::llm::{complete_with_retry, LanguageModel, Prompt, ResponseFormat, RetryPolicy};

/// Model-backed extraction of nodes and relationships from one chunk.
pub struct LlmExtractionPipeline {
    model: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
}

// ── Intermediate JSON schema for model output parsing ──────────────────────

#[derive(Debug, Deserialize)]
struct LlmExtractionOutput {
    #[serde(default, alias = "entities")]
    nodes: Vec<LlmNode>,
    #[serde(default, alias = "edges")]
    relationships: Vec<LlmRelationship>,
}

#[derive(Debug, Deserialize)]
struct LlmNode {
    #[serde(default, alias = "name")]
    label: String,
    #[serde(default, rename = "type")]
    node_type: String,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    properties: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct LlmRelationship {
    #[serde(default)]
    source: String,
    #[serde(default)]
    target: String,
    #[serde(default, rename = "type")]
    relation_type: String,
    #[serde(default)]
    properties: serde_json::Value,
}

// ── Implementation ─────────────────────────────────────────────────────────

impl LlmExtractionPipeline {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn build_system_prompt() -> String {
        r#"You are an entity and relationship extraction system that builds a knowledge graph.

Given a passage of text, extract the notable entities (nodes) and the relationships between them.

Return ONLY valid JSON (no markdown fences, no commentary) matching this exact schema:

{
  "nodes": [
    {
      "label": "Entity Name",
      "type": "Entity type, e.g. Person or Organization",
      "aliases": ["optional alternate names used in the text"],
      "properties": { "arbitrary": "scalar key-value pairs stated in the text" }
    }
  ],
  "relationships": [
    {
      "source": "Source Entity Name",
      "target": "Target Entity Name",
      "type": "RELATIONSHIP_TYPE in upper snake case",
      "properties": { "arbitrary": "scalar key-value pairs" }
    }
  ]
}

Rules:
- Relationship source and target MUST exactly match the label or an alias of a node in the nodes list.
- Use the most complete name for an entity as its label.
- Only extract entities and relationships that are clearly supported by the text.
- If nothing can be extracted, return {"nodes": [], "relationships": []}."#
            .to_string()
    }

    fn build_user_prompt(chunk: &Chunk, schema: &SchemaConfig) -> String {
        let mut prompt = String::new();
        if !schema.allowed_node_types.is_empty() {
            let types: Vec<&str> = schema.allowed_node_types.iter().map(String::as_str).collect();
            let _ = writeln!(prompt, "Allowed node types: {}", types.join(", "));
        }
        if !schema.allowed_relation_types.is_empty() {
            let types: Vec<&str> = schema.allowed_relation_types.iter().map(String::as_str).collect();
            let _ = writeln!(prompt, "Allowed relationship types: {}", types.join(", "));
        }
        if !prompt.is_empty() {
            prompt.push_str("Do not use any other types.\n\n");
        }
        if let Some(page) = chunk.page_number {
            let _ = writeln!(prompt, "Page: {page}");
        }
        let _ = write!(prompt, "Text:\n{}", chunk.text);
        prompt
    }

    fn parse_llm_response(raw_json: &str, chunk: &Chunk, schema: &SchemaConfig) -> Result<ChunkExtraction> {
        // Strip markdown code fences the model might include despite instructions
        let cleaned = raw_json.trim();
        let cleaned = if cleaned.starts_with("```") {
            match (cleaned.find('{'), cleaned.rfind('}')) {
                (Some(start), Some(end)) if start < end => &cleaned[start..=end],
                _ => {
                    warn!(chunk_id = %chunk.id, "Fenced model reply holds no JSON object");
                    return Err(LatticeError::Extraction(
                        "Fenced model reply holds no JSON object".into(),
                    ));
                }
            }
        } else {
            cleaned
        };

        let output: LlmExtractionOutput = serde_json::from_str(cleaned).map_err(|e| {
            warn!(chunk_id = %chunk.id, error = %e, "Failed to parse model extraction JSON");
            LatticeError::Extraction(format!("Failed to parse model JSON output: {e}"))
        })?;

        let mut extraction = ChunkExtraction {
            chunk_id: chunk.id,
            ..Default::default()
        };
        // Lowercased label or alias -> reference to a kept node
        let mut by_name: HashMap<String, NodeRef> = HashMap::new();

        for llm_node in output.nodes {
            let label = tidy(&llm_node.label);
            if label.is_empty() || llm_node.node_type.trim().is_empty() {
                extraction.dropped.push(DroppedRecord {
                    reason: DropReason::Malformed,
                    is_edge: false,
                    detail: format!("node '{}' of type '{}'", label, llm_node.node_type.trim()),
                });
                continue;
            }
            let Some(node_type) = schema.resolve_node_type(&llm_node.node_type) else {
                warn!(
                    chunk_id = %chunk.id,
                    label = %label,
                    node_type = %llm_node.node_type,
                    "Dropping node outside the allowed schema"
                );
                extraction.dropped.push(DroppedRecord {
                    reason: DropReason::SchemaViolation,
                    is_edge: false,
                    detail: format!("node '{}' has type '{}'", label, llm_node.node_type.trim()),
                });
                continue;
            };

            let mut node = ExtractedNode::new(label.clone(), node_type, chunk.id);
            if let Some(properties) = llm_node.properties.as_object() {
                for (key, value) in properties {
                    if let Some(value) = PropertyValue::from_json(value) {
                        node.properties.insert(key.clone(), value);
                    }
                }
            }

            let node_ref = node.node_ref();
            by_name.insert(label.to_lowercase(), node_ref.clone());
            for alias in &llm_node.aliases {
                let alias = tidy(alias);
                if !alias.is_empty() {
                    by_name.entry(alias.to_lowercase()).or_insert_with(|| node_ref.clone());
                }
            }
            extraction.nodes.push(node);
        }

        for llm_rel in output.relationships {
            let source = tidy(&llm_rel.source);
            let target = tidy(&llm_rel.target);
            if source.is_empty() || target.is_empty() || llm_rel.relation_type.trim().is_empty() {
                extraction.dropped.push(DroppedRecord {
                    reason: DropReason::Malformed,
                    is_edge: true,
                    detail: format!("relationship '{}' -[{}]-> '{}'", source, llm_rel.relation_type, target),
                });
                continue;
            }
            let Some(relation_type) = schema.resolve_relation_type(&llm_rel.relation_type) else {
                warn!(
                    chunk_id = %chunk.id,
                    relation_type = %llm_rel.relation_type,
                    "Dropping relationship outside the allowed schema"
                );
                extraction.dropped.push(DroppedRecord {
                    reason: DropReason::SchemaViolation,
                    is_edge: true,
                    detail: format!("relationship type '{}'", llm_rel.relation_type.trim()),
                });
                continue;
            };

            let source_ref = by_name.get(&source.to_lowercase());
            let target_ref = by_name.get(&target.to_lowercase());
            let (Some(source_ref), Some(target_ref)) = (source_ref, target_ref) else {
                warn!(
                    chunk_id = %chunk.id,
                    source_name = %source,
                    target_name = %target,
                    source_found = source_ref.is_some(),
                    target_found = target_ref.is_some(),
                    "Dropping relationship: referenced node not found"
                );
                extraction.dropped.push(DroppedRecord {
                    reason: DropReason::DanglingReference,
                    is_edge: true,
                    detail: format!("'{}' -[{}]-> '{}'", source, relation_type, target),
                });
                continue;
            };

            let mut edge = ExtractedEdge::new(source_ref.clone(), target_ref.clone(), relation_type, chunk.id);
            if let Some(properties) = llm_rel.properties.as_object() {
                for (key, value) in properties {
                    if let Some(value) = PropertyValue::from_json(value) {
                        edge.properties.insert(key.clone(), value);
                    }
                }
            }
            extraction.edges.push(edge);
        }

        info!(
            chunk_id = %chunk.id,
            nodes = extraction.nodes.len(),
            relationships = extraction.edges.len(),
            dropped = extraction.dropped.len(),
            "Parsed extraction results"
        );

        Ok(extraction)
    }
}

fn tidy(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl ExtractionPipeline for LlmExtractionPipeline {
    #[instrument(skip(self, chunk, schema), fields(chunk_id = %chunk.id, ordinal = chunk.ordinal))]
    async fn extract(&self, chunk: &Chunk, schema: &SchemaConfig) -> Result<ChunkExtraction> {
        let prompt = Prompt::new(Self::build_user_prompt(chunk, schema)).with_system(Self::build_system_prompt());

        debug!(
            model = self.model.name(),
            text_len = chunk.text.len(),
            "Sending extraction request"
        );

        let raw_json = complete_with_retry(self.model.as_ref(), &prompt, ResponseFormat::Json, &self.retry).await?;
        Self::parse_llm_response(&raw_json, chunk, schema)
    }
}
