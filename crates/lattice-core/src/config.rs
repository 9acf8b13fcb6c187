use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LatticeError, Result};
use crate::extraction::SchemaConfig;
use crate::llm::RetryPolicy;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SplitStrategy {
    #[default]
    FixedToken,
    Structural,
    Semantic,
}

impl FromStr for SplitStrategy {
    type Err = LatticeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "fixed-token" | "fixed" | "token" => Ok(Self::FixedToken),
            "structural" => Ok(Self::Structural),
            "semantic" => Ok(Self::Semantic),
            other => Err(LatticeError::Config(format!("unknown split strategy '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkerConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    #[serde(default)]
    pub strategy: SplitStrategy,
    /// Similarity below which adjacent sentences start a new semantic group.
    #[serde(default = "default_semantic_threshold")]
    pub semantic_threshold: f32,
    /// Hard cap on chunks per document. Chunks past the cap are discarded.
    #[serde(default)]
    pub max_chunks: Option<usize>,
}

fn default_semantic_threshold() -> f32 {
    0.15
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 200,
            chunk_overlap: 20,
            strategy: SplitStrategy::FixedToken,
            semantic_threshold: default_semantic_threshold(),
            max_chunks: None,
        }
    }
}

impl ChunkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(LatticeError::Config("chunk_size must be greater than 0".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(LatticeError::Config(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if !(0.0..=1.0).contains(&self.semantic_threshold) {
            return Err(LatticeError::Config(format!(
                "semantic_threshold ({}) must be within [0, 1]",
                self.semantic_threshold
            )));
        }
        if self.max_chunks == Some(0) {
            return Err(LatticeError::Config("max_chunks must be greater than 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QaConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_true")]
    pub validate_query: bool,
    #[serde(default)]
    pub multi_step: bool,
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_max_retries")]
    pub max_translation_retries: u32,
}

fn default_top_k() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_max_steps() -> u32 {
    3
}

fn default_max_retries() -> u32 {
    3
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            validate_query: true,
            multi_step: false,
            max_steps: default_max_steps(),
            max_translation_retries: default_max_retries(),
        }
    }
}

impl QaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(LatticeError::Config("top_k must be greater than 0".into()));
        }
        if self.max_steps == 0 {
            return Err(LatticeError::Config("max_steps must be greater than 0".into()));
        }
        if self.max_translation_retries == 0 {
            return Err(LatticeError::Config(
                "max_translation_retries must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    pub chunker: ChunkerConfig,
    pub schema: SchemaConfig,
    pub qa: QaConfig,
    /// Upper bound on concurrent extraction model calls.
    pub fan_out: usize,
    /// Persist Document/Chunk nodes for provenance.
    pub persist_chunks: bool,
    pub model_retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunker: ChunkerConfig::default(),
            schema: SchemaConfig::default(),
            qa: QaConfig::default(),
            fan_out: 4,
            persist_chunks: false,
            model_retry: RetryPolicy::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        self.chunker.validate()?;
        self.schema.validate()?;
        self.qa.validate()?;
        if self.fan_out == 0 {
            return Err(LatticeError::Config("fan_out must be greater than 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GraphBackend {
    Neo4j,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub extraction_model: String,
    pub translation_model: String,
    pub synthesis_model: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            extraction_model: "claude-haiku-4-5-20251001".into(),
            translation_model: "claude-sonnet-4-5-20250929".into(),
            synthesis_model: "claude-sonnet-4-5-20250929".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub graph_backend: GraphBackend,
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub anthropic_api_key: String,
    pub server_host: String,
    pub server_port: u16,
    pub models: ModelConfig,
    pub pipeline: PipelineConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let list = |key: &str| -> BTreeSet<String> {
            lookup(key)
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default()
        };

        let defaults = PipelineConfig::default();
        let chunker = ChunkerConfig {
            chunk_size: parse_var(&lookup, "LATTICE_CHUNK_SIZE")
                .unwrap_or(defaults.chunker.chunk_size),
            chunk_overlap: parse_var(&lookup, "LATTICE_CHUNK_OVERLAP")
                .unwrap_or(defaults.chunker.chunk_overlap),
            strategy: lookup("LATTICE_SPLIT_STRATEGY")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            semantic_threshold: parse_var(&lookup, "LATTICE_SEMANTIC_THRESHOLD")
                .unwrap_or(defaults.chunker.semantic_threshold),
            max_chunks: parse_var(&lookup, "LATTICE_MAX_CHUNKS"),
        };
        let qa = QaConfig {
            top_k: parse_var(&lookup, "LATTICE_TOP_K").unwrap_or(defaults.qa.top_k),
            validate_query: parse_var(&lookup, "LATTICE_VALIDATE_QUERY")
                .unwrap_or(defaults.qa.validate_query),
            multi_step: parse_var(&lookup, "LATTICE_MULTI_STEP").unwrap_or(defaults.qa.multi_step),
            max_steps: parse_var(&lookup, "LATTICE_MAX_STEPS").unwrap_or(defaults.qa.max_steps),
            max_translation_retries: parse_var(&lookup, "LATTICE_MAX_TRANSLATION_RETRIES")
                .unwrap_or(defaults.qa.max_translation_retries),
        };
        let model_retry = RetryPolicy {
            max_attempts: parse_var(&lookup, "LATTICE_MODEL_MAX_ATTEMPTS")
                .unwrap_or(defaults.model_retry.max_attempts),
            call_timeout: parse_var(&lookup, "LATTICE_MODEL_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.model_retry.call_timeout),
            ..defaults.model_retry
        };
        let model_defaults = ModelConfig::default();

        Self {
            graph_backend: match lookup("GRAPH_BACKEND").as_deref().map(str::trim) {
                Some("memory") => GraphBackend::Memory,
                _ => GraphBackend::Neo4j,
            },
            neo4j_uri: lookup("NEO4J_URI").unwrap_or_else(|| "bolt://localhost:7687".into()),
            neo4j_user: lookup("NEO4J_USER").unwrap_or_else(|| "neo4j".into()),
            neo4j_password: lookup("NEO4J_PASSWORD").unwrap_or_else(|| "lattice".into()),
            anthropic_api_key: lookup("ANTHROPIC_API_KEY").unwrap_or_default(),
            server_host: lookup("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            server_port: parse_var(&lookup, "SERVER_PORT").unwrap_or(8080),
            models: ModelConfig {
                extraction_model: lookup("LATTICE_EXTRACTION_MODEL")
                    .unwrap_or(model_defaults.extraction_model),
                translation_model: lookup("LATTICE_TRANSLATION_MODEL")
                    .unwrap_or(model_defaults.translation_model),
                synthesis_model: lookup("LATTICE_SYNTHESIS_MODEL")
                    .unwrap_or(model_defaults.synthesis_model),
            },
            pipeline: PipelineConfig {
                chunker,
                schema: SchemaConfig {
                    allowed_node_types: list("LATTICE_ALLOWED_NODE_TYPES"),
                    allowed_relation_types: list("LATTICE_ALLOWED_RELATION_TYPES"),
                },
                qa,
                fan_out: parse_var(&lookup, "LATTICE_FAN_OUT").unwrap_or(defaults.fan_out),
                persist_chunks: parse_var(&lookup, "LATTICE_PERSIST_CHUNKS")
                    .unwrap_or(defaults.persist_chunks),
                model_retry,
            },
        }
    }
}

/// Parse one key, treating unparseable values as unset.
fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}
