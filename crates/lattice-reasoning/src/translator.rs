use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use lattice_core::cypher;
use lattice_core::error::{LatticeError, Result};
use lattice_core::graph::{GraphSchema, GraphStore, ResultRow};
use lattice_core::llm::{complete_with_timeout, LanguageModel, Prompt, ResponseFormat};
use lattice_core::reasoning::Query;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// A validated query together with the rows it produced and every attempt
/// made on the way, rejected ones included.
#[derive(Debug, Clone)]
pub struct Translation {
    pub query: Query,
    pub rows: Vec<ResultRow>,
    pub attempts: Vec<Query>,
}

/// Outcome of one model call, before validation.
enum Draft {
    Candidate(String),
    Rejected(String),
}

/// Turns a natural-language question into a read-only Cypher query for the
/// current graph schema, retrying with feedback on failure.
pub struct QueryTranslator {
    model: Arc<dyn LanguageModel>,
    max_retries: u32,
    validate_query: bool,
    call_timeout: Duration,
}

impl QueryTranslator {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            max_retries: DEFAULT_MAX_RETRIES,
            validate_query: true,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_validation(mut self, validate_query: bool) -> Self {
        self.validate_query = validate_query;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Translate without executing.
    #[instrument(skip(self, schema), fields(question = %question))]
    pub async fn translate(&self, question: &str, schema: &GraphSchema) -> Result<Query> {
        self.run(question, schema, None).await.map(|t| t.query)
    }

    /// Translate and execute; execution errors count as failed attempts. Rows
    /// are capped at `top_k`.
    #[instrument(skip(self, schema, store), fields(question = %question))]
    pub async fn translate_and_execute(
        &self,
        question: &str,
        schema: &GraphSchema,
        store: &dyn GraphStore,
        top_k: usize,
    ) -> Result<Translation> {
        let mut translation = self.run(question, schema, Some(store)).await?;
        translation.rows.truncate(top_k);
        Ok(translation)
    }

    async fn run(
        &self,
        question: &str,
        schema: &GraphSchema,
        store: Option<&dyn GraphStore>,
    ) -> Result<Translation> {
        let system = Self::build_system_prompt(schema);
        let mut attempts: Vec<Query> = Vec::new();
        let mut feedback: Vec<String> = Vec::new();

        for attempt in 1..=self.max_retries {
            let prompt = Prompt::new(Self::build_user_prompt(question, &feedback)).with_system(system.clone());

            let candidate = match self.draft(&prompt).await {
                Draft::Candidate(candidate) => candidate,
                Draft::Rejected(reason) => {
                    warn!(attempt, reason = %reason, "Translation attempt rejected");
                    feedback.push(reason);
                    attempts.push(Query {
                        natural_language_text: question.to_string(),
                        generated_query_text: String::new(),
                        validated: false,
                        attempt,
                    });
                    continue;
                }
            };

            let mut query = Query {
                natural_language_text: question.to_string(),
                generated_query_text: candidate.clone(),
                validated: false,
                attempt,
            };

            if self.validate_query {
                if let Err(e) = cypher::validate(&candidate) {
                    warn!(attempt, error = %e, "Generated query failed validation");
                    feedback.push(format!("Query `{candidate}` is invalid: {e}"));
                    attempts.push(query);
                    continue;
                }
                query.validated = true;
            }

            let rows = match store {
                Some(store) => match store.query(&candidate).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        warn!(attempt, error = %e, "Generated query failed to execute");
                        feedback.push(format!("Query `{candidate}` failed to execute: {e}"));
                        attempts.push(query);
                        continue;
                    }
                },
                None => Vec::new(),
            };

            info!(attempt, rows = rows.len(), cypher = %candidate, "Question translated");
            attempts.push(query.clone());
            return Ok(Translation {
                query,
                rows,
                attempts,
            });
        }

        let reason = feedback
            .pop()
            .unwrap_or_else(|| "no attempt was made".to_string());
        Err(LatticeError::Translation {
            attempts: self.max_retries,
            reason,
        })
    }

    /// One model call. Timeouts and model failures reject the attempt.
    async fn draft(&self, prompt: &Prompt) -> Draft {
        let response = match complete_with_timeout(self.model.as_ref(), prompt, ResponseFormat::Text, self.call_timeout).await {
            Ok(response) => response,
            Err(e) => return Draft::Rejected(format!("The previous attempt produced no query ({e}).")),
        };
        debug!(response_len = response.len(), "Received translation response");

        match extract_cypher_queries(&response).into_iter().next() {
            Some(candidate) => Draft::Candidate(candidate),
            None => Draft::Rejected(
                "The previous response did not contain a Cypher query in a ```cypher code block.".to_string(),
            ),
        }
    }

    fn build_system_prompt(schema: &GraphSchema) -> String {
        format!(
            "You are an expert Neo4j Cypher query writer for a knowledge graph built from documents.\n\
             \n\
             {}\n\
             Write exactly one read-only Cypher query. Never use CREATE, MERGE, SET, DELETE or REMOVE. \
             Match names case-insensitively with toLower() where useful. \
             Return the query enclosed in a ```cypher ... ``` code block.",
            schema.describe()
        )
    }

    fn build_user_prompt(question: &str, feedback: &[String]) -> String {
        let mut prompt = format!("Question: {question}");
        if !feedback.is_empty() {
            prompt.push_str("\n\nEarlier attempts failed. Fix these problems:\n");
            for (i, note) in feedback.iter().enumerate() {
                let _ = writeln!(prompt, "{}. {}", i + 1, note);
            }
        }
        prompt
    }
}

/// Cypher queries in a model response: fenced blocks first, otherwise the
/// clause lines of a bare query.
pub(crate) fn extract_cypher_queries(response: &str) -> Vec<String> {
    let mut queries = Vec::new();
    let mut in_block = false;
    let mut in_other_block = false;
    let mut current = String::new();

    for line in response.lines() {
        let trimmed = line.trim();
        if !in_block && trimmed.starts_with("```") {
            let tag = trimmed.trim_start_matches('`').trim().to_lowercase();
            if in_other_block {
                in_other_block = false;
            } else if tag.is_empty() || tag == "cypher" {
                in_block = true;
                current.clear();
            } else {
                in_other_block = true;
            }
            continue;
        }
        if in_other_block {
            continue;
        }
        if trimmed == "```" && in_block {
            in_block = false;
            let q = current.trim().to_string();
            if !q.is_empty() {
                queries.push(q);
            }
            current.clear();
            continue;
        }
        if in_block {
            current.push_str(line);
            current.push('\n');
        }
    }

    // Fallback: if no fenced blocks found, collect raw clause lines
    if queries.is_empty() {
        let mut raw = String::new();
        for line in response.lines() {
            let trimmed = line.trim();
            let upper = trimmed.to_uppercase();
            if ["MATCH", "OPTIONAL", "WITH", "RETURN", "WHERE", "ORDER", "LIMIT", "CALL", "UNWIND"]
                .iter()
                .any(|clause| upper.starts_with(clause))
            {
                raw.push_str(trimmed);
                raw.push('\n');
            }
        }
        let q = raw.trim().to_string();
        if !q.is_empty() {
            queries.push(q);
        }
    }

    queries
}

#[cfg(test)]
mod tests {
    use lattice_core::entity::{ChunkExtraction, ExtractedEdge, ExtractedNode};
    use lattice_graph::MemoryGraphStore;
    use lattice_llm::{ScriptedModel, ScriptedReply};
    use uuid::Uuid;

    use super::*;

    fn fenced(query: &str) -> String {
        format!("Here you go:\n```cypher\n{query}\n```")
    }

    async fn alice_acme() -> MemoryGraphStore {
        let store = MemoryGraphStore::new();
        let chunk = Uuid::from_u128(1);
        let alice = ExtractedNode::new("Alice", "Person", chunk);
        let acme = ExtractedNode::new("Acme", "Organization", chunk);
        let edge = ExtractedEdge::new(alice.node_ref(), acme.node_ref(), "FOUNDED", chunk);
        store
            .upsert(&ChunkExtraction {
                chunk_id: chunk,
                nodes: vec![alice, acme],
                edges: vec![edge],
                dropped: Vec::new(),
            })
            .await
            .unwrap();
        store
    }

    #[test]
    fn extracts_fenced_queries() {
        let response = "Queries:\n```cypher\nMATCH (p:Person) RETURN p.name\n```\n```\nMATCH (o) RETURN o\n```";
        let queries = extract_cypher_queries(response);
        assert_eq!(queries, vec!["MATCH (p:Person) RETURN p.name", "MATCH (o) RETURN o"]);
    }

    #[test]
    fn extracts_bare_queries() {
        let response = "Sure.\nMATCH (n:Person)\nWHERE n.name = 'Alice'\nRETURN n.name";
        let queries = extract_cypher_queries(response);
        assert_eq!(queries.len(), 1);
        assert!(queries[0].starts_with("MATCH (n:Person)\nWHERE"));
    }

    #[test]
    fn ignores_other_languages_and_prose() {
        assert!(extract_cypher_queries("```python\nprint(1)\n```").is_empty());
        assert!(extract_cypher_queries("I cannot answer that.").is_empty());
    }

    #[tokio::test]
    async fn stops_after_max_retries() {
        let model = Arc::new(ScriptedModel::new().with_fallback(ScriptedReply::text("I am not sure.")));
        let translator = QueryTranslator::new(model.clone()).with_max_retries(3);

        let err = translator
            .translate("Who founded Acme?", &GraphSchema::default())
            .await
            .unwrap_err();
        match err {
            LatticeError::Translation { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(model.call_count(), 3);
    }

    #[tokio::test]
    async fn invalid_query_feeds_back_into_next_attempt() {
        let model = Arc::new(
            ScriptedModel::new()
                .with_text(fenced("MATCH (p:Person RETURN p.name"))
                .with_text(fenced("MATCH (p:Person) RETURN p.name AS name")),
        );
        let translator = QueryTranslator::new(model.clone());

        let query = translator
            .translate("List people", &GraphSchema::default())
            .await
            .unwrap();
        assert_eq!(query.attempt, 2);
        assert!(query.validated);
        assert_eq!(query.generated_query_text, "MATCH (p:Person) RETURN p.name AS name");

        let prompts = model.prompts();
        assert!(!prompts[0].user.contains("Earlier attempts failed"));
        assert!(prompts[1].user.contains("is invalid"));
    }

    #[tokio::test]
    async fn execution_errors_consume_attempts() {
        let store = alice_acme().await;
        let model = Arc::new(
            ScriptedModel::new()
                .with_text(fenced("MATCH (p:Person) RETURN q.name"))
                .with_text(fenced(
                    "MATCH (p:Person)-[:FOUNDED]->(o:Organization) WHERE o.name = 'Acme' RETURN p.name AS founder",
                )),
        );
        let translator = QueryTranslator::new(model.clone());
        let schema = store.schema().await.unwrap();

        let translation = translator
            .translate_and_execute("Who founded Acme?", &schema, &store, 10)
            .await
            .unwrap();
        assert_eq!(translation.attempts.len(), 2);
        assert_eq!(translation.query.attempt, 2);
        assert_eq!(translation.rows.len(), 1);
        assert_eq!(translation.rows[0].get("founder").unwrap(), "Alice");
        assert!(model.prompts()[1].user.contains("failed to execute"));
        assert!(model.prompts()[0].system.as_deref().unwrap().contains("FOUNDED"));
    }

    #[tokio::test]
    async fn timeouts_consume_attempts() {
        let model = Arc::new(
            ScriptedModel::new()
                .with_reply(ScriptedReply::Delayed(Duration::from_secs(5), fenced("MATCH (n) RETURN n")))
                .with_text(fenced("MATCH (n) RETURN n.name AS name")),
        );
        let translator = QueryTranslator::new(model.clone())
            .with_call_timeout(Duration::from_millis(20))
            .with_max_retries(2);

        let query = translator.translate("names?", &GraphSchema::default()).await.unwrap();
        assert_eq!(query.attempt, 2);
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn always_invalid_fenced_query_uses_every_attempt_once() {
        let model = Arc::new(ScriptedModel::new().with_fallback(ScriptedReply::text(fenced("MATCH (n)"))));
        let translator = QueryTranslator::new(model.clone()).with_max_retries(4);

        let err = translator
            .translate("Anything?", &GraphSchema::default())
            .await
            .unwrap_err();
        match err {
            LatticeError::Translation { attempts, reason } => {
                assert_eq!(attempts, 4);
                assert!(reason.contains("is invalid"), "{reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(model.call_count(), 4);
    }

    #[tokio::test]
    async fn rejected_drafts_are_recorded_as_attempts() {
        let store = alice_acme().await;
        let model = Arc::new(
            ScriptedModel::new()
                .with_reply(ScriptedReply::Delayed(Duration::from_secs(5), fenced("MATCH (n) RETURN n")))
                .with_text("I am not sure.")
                .with_text(fenced("MATCH (p:Person) RETURN p.name AS name")),
        );
        let translator = QueryTranslator::new(model.clone())
            .with_call_timeout(Duration::from_millis(20))
            .with_max_retries(3);
        let schema = store.schema().await.unwrap();

        let translation = translator
            .translate_and_execute("Who is there?", &schema, &store, 10)
            .await
            .unwrap();
        let numbers: Vec<u32> = translation.attempts.iter().map(|q| q.attempt).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(translation.attempts[0].generated_query_text.is_empty());
        assert!(translation.attempts[1].generated_query_text.is_empty());
        assert!(!translation.attempts[1].validated);
        assert_eq!(translation.query.attempt, 3);
        assert_eq!(translation.rows.len(), 1);
    }

    #[tokio::test]
    async fn validation_can_be_disabled() {
        let model = Arc::new(ScriptedModel::new().with_text(fenced("MATCH (n RETURN n")));
        let translator = QueryTranslator::new(model).with_validation(false);

        let query = translator.translate("anything", &GraphSchema::default()).await.unwrap();
        assert!(!query.validated);
        assert_eq!(query.attempt, 1);
    }
}
