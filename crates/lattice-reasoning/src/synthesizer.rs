use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use lattice_core::cypher;
use lattice_core::graph::{GraphSchema, GraphStore, ResultRow};
use lattice_core::llm::{complete_with_retry, LanguageModel, Prompt, ResponseFormat, RetryPolicy};
use lattice_core::reasoning::{Answer, AnswerOutcome, Query, INSUFFICIENT_INFORMATION};

use crate::translator::extract_cypher_queries;

/// Longest serialized row placed in a prompt.
const MAX_ROW_CHARS: usize = 1000;
/// Rows quoted verbatim in the fallback answer.
const FALLBACK_ROWS: usize = 5;

const DEFAULT_TOP_K: usize = 10;

/// Accumulated state of an iterative answering run.
#[derive(Debug, Default)]
struct StepState {
    step: u32,
    context: Vec<ResultRow>,
    queries: Vec<Query>,
    notes: Vec<String>,
}

/// What the model asked for in one iterative step.
#[derive(Debug, PartialEq, Eq)]
enum StepReply {
    Query(String),
    Answer(String),
    Unparsed,
}

/// Produces natural-language answers from retrieved graph rows.
pub struct AnswerSynthesizer {
    model: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
    validate_query: bool,
    top_k: usize,
}

impl AnswerSynthesizer {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            retry: RetryPolicy::default(),
            validate_query: true,
            top_k: DEFAULT_TOP_K,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_validation(mut self, validate_query: bool) -> Self {
        self.validate_query = validate_query;
        self
    }

    /// Rows kept per query in iterative mode.
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    /// Single-shot answer over already retrieved rows. Never fails: a model
    /// failure yields a fallback built only from `rows`.
    #[instrument(skip(self, rows), fields(question = %question, rows = rows.len()))]
    pub async fn answer(&self, question: &str, rows: &[ResultRow]) -> Answer {
        let prompt = Prompt::new(Self::build_answer_prompt(question, rows)).with_system(
            "You answer questions using only the knowledge graph results you are given. \
             Do not use outside knowledge.",
        );

        let outcome = if rows.is_empty() {
            AnswerOutcome::NoContext
        } else {
            AnswerOutcome::Grounded
        };

        let text = match complete_with_retry(self.model.as_ref(), &prompt, ResponseFormat::Text, &self.retry).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => fallback_text(rows),
            Err(e) => {
                warn!(error = %e, "Answer synthesis failed, using fallback answer");
                fallback_text(rows)
            }
        };

        info!(answer_len = text.len(), outcome = ?outcome, "Answer synthesized");
        Answer {
            text,
            used_context: rows.to_vec(),
            intermediate_queries: Vec::new(),
            outcome,
        }
    }

    /// Bounded query/observe loop: each step the model either asks for one
    /// more query or gives its final answer.
    #[instrument(skip(self, schema, store), fields(question = %question))]
    pub async fn answer_iterative(
        &self,
        question: &str,
        schema: &GraphSchema,
        store: &dyn GraphStore,
        max_steps: u32,
    ) -> Answer {
        let system = Self::build_step_system_prompt(schema);
        let mut state = StepState::default();

        while state.step < max_steps {
            state.step += 1;
            let prompt = Prompt::new(Self::build_step_prompt(question, &state)).with_system(system.clone());

            let reply = match complete_with_retry(self.model.as_ref(), &prompt, ResponseFormat::Text, &self.retry).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(step = state.step, error = %e, "Reasoning step failed");
                    state.notes.push(format!("Step {} failed: {e}", state.step));
                    continue;
                }
            };

            match parse_step_reply(&reply) {
                StepReply::Answer(text) => {
                    info!(steps = state.step, context_rows = state.context.len(), "Iterative answer complete");
                    let outcome = if state.context.is_empty() {
                        AnswerOutcome::NoContext
                    } else {
                        AnswerOutcome::Grounded
                    };
                    return Answer {
                        text,
                        used_context: state.context,
                        intermediate_queries: state.queries,
                        outcome,
                    };
                }
                StepReply::Query(candidate) => self.run_step_query(question, &candidate, store, &mut state).await,
                StepReply::Unparsed => {
                    debug!(step = state.step, "Reply had neither QUERY nor ANSWER");
                    state
                        .notes
                        .push(format!("Step {}: reply must start with QUERY: or ANSWER:", state.step));
                }
            }
        }

        info!(max_steps, context_rows = state.context.len(), "Step limit reached, answering from gathered context");
        let mut answer = self.answer(question, &state.context).await;
        answer.intermediate_queries = state.queries;
        answer.outcome = AnswerOutcome::StepsExhausted;
        answer
    }

    async fn run_step_query(&self, question: &str, candidate: &str, store: &dyn GraphStore, state: &mut StepState) {
        let mut query = Query {
            natural_language_text: question.to_string(),
            generated_query_text: candidate.to_string(),
            validated: false,
            attempt: state.step,
        };

        if self.validate_query {
            if let Err(e) = cypher::validate(candidate) {
                state.notes.push(format!("Step {}: query `{candidate}` is invalid: {e}", state.step));
                state.queries.push(query);
                return;
            }
            query.validated = true;
        }

        match store.query(candidate).await {
            Ok(mut rows) => {
                rows.truncate(self.top_k);
                let mut note = format!("Step {}: query `{candidate}` returned {} rows", state.step, rows.len());
                for row in &rows {
                    let _ = write!(note, "\n  {}", row_text(row));
                }
                state.notes.push(note);
                state.context.extend(rows);
            }
            Err(e) => {
                warn!(step = state.step, error = %e, "Reasoning query failed");
                state
                    .notes
                    .push(format!("Step {}: query `{candidate}` failed: {e}", state.step));
            }
        }
        state.queries.push(query);
    }

    fn build_answer_prompt(question: &str, rows: &[ResultRow]) -> String {
        let mut prompt = format!("Question: {question}\n\n");
        if rows.is_empty() {
            prompt.push_str(
                "The knowledge graph returned no results for this question. \
                 Say explicitly that there is no supporting context in the knowledge graph \
                 and do not guess an answer.",
            );
            return prompt;
        }
        prompt.push_str("Knowledge graph results:\n");
        for (i, row) in rows.iter().enumerate() {
            let _ = writeln!(prompt, "{}. {}", i + 1, row_text(row));
        }
        prompt.push_str("\nAnswer the question from these results only.");
        prompt
    }

    fn build_step_system_prompt(schema: &GraphSchema) -> String {
        format!(
            "You answer questions by querying a knowledge graph one read-only Cypher query at a time.\n\
             \n\
             {}\n\
             Reply in exactly one of these forms:\n\
             QUERY: <one read-only Cypher query>\n\
             ANSWER: <your final answer, based only on the query results so far>",
            schema.describe()
        )
    }

    fn build_step_prompt(question: &str, state: &StepState) -> String {
        let mut prompt = format!("Question: {question}");
        if !state.notes.is_empty() {
            prompt.push_str("\n\nProgress so far:\n");
            for note in &state.notes {
                let _ = writeln!(prompt, "{note}");
            }
        }
        prompt
    }
}

fn parse_step_reply(reply: &str) -> StepReply {
    for (idx, line) in reply.lines().enumerate() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("ANSWER:") {
            let tail: Vec<&str> = reply.lines().skip(idx + 1).collect();
            let text = format!("{}\n{}", rest.trim(), tail.join("\n"));
            let text = text.trim();
            if !text.is_empty() {
                return StepReply::Answer(text.to_string());
            }
            return StepReply::Unparsed;
        }
        if let Some(rest) = trimmed.strip_prefix("QUERY:") {
            let tail: Vec<&str> = reply.lines().skip(idx + 1).collect();
            let body = format!("{}\n{}", rest.trim(), tail.join("\n"));
            return match extract_cypher_queries(&body).into_iter().next() {
                Some(q) => StepReply::Query(q),
                None => StepReply::Unparsed,
            };
        }
    }
    StepReply::Unparsed
}

/// Compact JSON for one row, cut at `MAX_ROW_CHARS`.
fn row_text(row: &ResultRow) -> String {
    let json = serde_json::to_string(row).unwrap_or_default();
    if json.chars().count() <= MAX_ROW_CHARS {
        return json;
    }
    let cut: String = json.chars().take(MAX_ROW_CHARS).collect();
    format!("{cut}... [truncated]")
}

fn fallback_text(rows: &[ResultRow]) -> String {
    if rows.is_empty() {
        return INSUFFICIENT_INFORMATION.to_string();
    }
    let mut text = format!(
        "An answer could not be generated. The knowledge graph returned {} result(s):",
        rows.len()
    );
    for row in rows.iter().take(FALLBACK_ROWS) {
        let _ = write!(text, "\n- {}", row_text(row));
    }
    if rows.len() > FALLBACK_ROWS {
        let _ = write!(text, "\n- ... and {} more", rows.len() - FALLBACK_ROWS);
    }
    text
}
