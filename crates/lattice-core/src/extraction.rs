use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::document::Chunk;
use crate::entity::{normalize_relation_type, ChunkExtraction};
use crate::error::Result;

/// Optional vocabulary constraint. Empty sets mean unconstrained.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaConfig {
    #[serde(default)]
    pub allowed_node_types: BTreeSet<String>,
    #[serde(default)]
    pub allowed_relation_types: BTreeSet<String>,
}

impl SchemaConfig {
    pub fn new<N, R>(node_types: N, relation_types: R) -> Self
    where
        N: IntoIterator,
        N::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        Self {
            allowed_node_types: node_types.into_iter().map(Into::into).collect(),
            allowed_relation_types: relation_types.into_iter().map(Into::into).collect(),
        }
    }

    /// Schema spelling of `raw` when allowed, `None` when it must be dropped.
    /// Unconstrained schemas keep the trimmed input.
    pub fn resolve_node_type(&self, raw: &str) -> Option<String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if self.allowed_node_types.is_empty() {
            return Some(raw.to_string());
        }
        self.allowed_node_types
            .iter()
            .find(|t| t.eq_ignore_ascii_case(raw))
            .cloned()
    }

    /// Relation types are compared after `UPPER_SNAKE` normalization.
    pub fn resolve_relation_type(&self, raw: &str) -> Option<String> {
        let normalized = normalize_relation_type(raw);
        if normalized.is_empty() {
            return None;
        }
        if self.allowed_relation_types.is_empty() {
            return Some(normalized);
        }
        self.allowed_relation_types
            .iter()
            .find(|t| normalize_relation_type(t) == normalized)
            .map(|t| normalize_relation_type(t))
    }

    pub fn validate(&self) -> Result<()> {
        if self.allowed_node_types.iter().any(|t| t.trim().is_empty()) {
            return Err(crate::error::LatticeError::Config(
                "allowed_node_types contains an empty type".into(),
            ));
        }
        if self
            .allowed_relation_types
            .iter()
            .any(|t| normalize_relation_type(t).is_empty())
        {
            return Err(crate::error::LatticeError::Config(
                "allowed_relation_types contains an empty type".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
pub trait ExtractionPipeline: Send + Sync {
    async fn extract(&self, chunk: &Chunk, schema: &SchemaConfig) -> Result<ChunkExtraction>;
}
