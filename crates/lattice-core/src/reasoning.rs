use serde::{Deserialize, Serialize};

use crate::graph::ResultRow;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Query {
    pub natural_language_text: String,
    pub generated_query_text: String,
    pub validated: bool,
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnswerOutcome {
    /// Synthesized from retrieved rows.
    Grounded,
    /// Retrieval succeeded but returned nothing.
    NoContext,
    /// Multi-step loop hit its step limit; answer built from what was gathered.
    StepsExhausted,
    /// Translation or retrieval ultimately failed.
    Unanswerable { reason_code: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Answer {
    pub text: String,
    pub used_context: Vec<ResultRow>,
    /// Generated queries tried on the way to the answer.
    pub intermediate_queries: Vec<Query>,
    pub outcome: AnswerOutcome,
}

impl Answer {
    pub fn unanswerable(reason_code: impl Into<String>) -> Self {
        Self {
            text: INSUFFICIENT_INFORMATION.to_string(),
            used_context: Vec::new(),
            intermediate_queries: Vec::new(),
            outcome: AnswerOutcome::Unanswerable {
                reason_code: reason_code.into(),
            },
        }
    }
}

pub const INSUFFICIENT_INFORMATION: &str =
    "I could not answer this question: there is insufficient information in the knowledge graph.";
