use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use lattice_core::config::{ChunkerConfig, PipelineConfig, QaConfig};
use lattice_core::document::Document;
use lattice_core::entity::ChunkExtraction;
use lattice_core::error::{LatticeError, Result};
use lattice_core::extraction::{ExtractionPipeline, SchemaConfig};
use lattice_core::graph::{GraphStore, UpsertResult};
use lattice_core::llm::LanguageModel;
use lattice_core::reasoning::Answer;
use lattice_reasoning::{AnswerSynthesizer, QueryTranslator};

/// Wires the chunker, extractor, graph store, translator and synthesizer
/// into the ingest and ask flows.
pub struct Pipeline {
    store: Arc<dyn GraphStore>,
    extractor: Arc<dyn ExtractionPipeline>,
    translation_model: Arc<dyn LanguageModel>,
    synthesis_model: Arc<dyn LanguageModel>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn GraphStore>,
        extractor: Arc<dyn ExtractionPipeline>,
        translation_model: Arc<dyn LanguageModel>,
        synthesis_model: Arc<dyn LanguageModel>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            extractor,
            translation_model,
            synthesis_model,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// Chunk, extract and merge one document. Each chunk commits atomically
    /// as its extraction arrives; failed chunks are counted, not fatal.
    #[instrument(skip_all, fields(document_id = %document.id))]
    pub async fn ingest(
        &self,
        document: &Document,
        chunker: &ChunkerConfig,
        schema: &SchemaConfig,
        cancel: CancellationToken,
    ) -> Result<UpsertResult> {
        chunker.validate()?;
        schema.validate()?;
        if self.config.fan_out == 0 {
            return Err(LatticeError::Config("fan_out must be greater than 0".into()));
        }
        ensure_live(&cancel)?;

        let chunks = lattice_chunking::split(document, chunker)?;
        info!(chunks = chunks.len(), strategy = ?chunker.strategy, "Document chunked");

        if self.config.persist_chunks {
            self.store.record_chunks(document, &chunks).await?;
        }
        ensure_live(&cancel)?;

        let semaphore = Arc::new(Semaphore::new(self.config.fan_out));
        let mut join_set: JoinSet<(Uuid, Result<ChunkExtraction>)> = JoinSet::new();

        for chunk in chunks {
            let semaphore = semaphore.clone();
            let extractor = self.extractor.clone();
            let schema = schema.clone();
            let cancel = cancel.clone();

            join_set.spawn(async move {
                let chunk_id = chunk.id;
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return (chunk_id, Err(LatticeError::Cancelled)),
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(e) => return (chunk_id, Err(LatticeError::Internal(e.to_string()))),
                    },
                };
                let result = tokio::select! {
                    _ = cancel.cancelled() => Err(LatticeError::Cancelled),
                    result = extractor.extract(&chunk, &schema) => result,
                };
                (chunk_id, result)
            });
        }

        let mut total = UpsertResult::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = join_set.join_next() => Some(next),
            };
            let joined = match next {
                None => {
                    join_set.abort_all();
                    warn!(
                        nodes_created = total.nodes_created,
                        edges_created = total.edges_created,
                        "Ingestion cancelled, committed chunks are kept"
                    );
                    return Err(LatticeError::Cancelled);
                }
                Some(None) => break,
                Some(Some(joined)) => joined,
            };

            match joined {
                Ok((chunk_id, Ok(extraction))) => {
                    ensure_live(&cancel)?;
                    match self.store.upsert(&extraction).await {
                        Ok(result) => {
                            debug!(chunk_id = %chunk_id, "Chunk merged");
                            total += result;
                        }
                        Err(e) => {
                            error!(chunk_id = %chunk_id, error = %e, "Chunk merge failed");
                            total.chunks_failed += 1;
                        }
                    }
                }
                Ok((chunk_id, Err(LatticeError::Cancelled))) => {
                    debug!(chunk_id = %chunk_id, "Chunk extraction cancelled");
                }
                Ok((chunk_id, Err(e))) => {
                    warn!(chunk_id = %chunk_id, error = %e, "Chunk extraction failed");
                    total.chunks_failed += 1;
                }
                Err(join_err) => {
                    error!(error = %join_err, "Extraction task panicked");
                    total.chunks_failed += 1;
                }
            }
        }
        ensure_live(&cancel)?;

        info!(
            nodes_created = total.nodes_created,
            nodes_merged = total.nodes_merged,
            edges_created = total.edges_created,
            edges_merged = total.edges_merged,
            nodes_dropped = total.nodes_dropped,
            edges_dropped = total.edges_dropped,
            chunks_failed = total.chunks_failed,
            "Ingestion complete"
        );
        Ok(total)
    }

    /// Answer a question from the graph. Always returns an answer; failures
    /// become an unanswerable outcome carrying the reason code.
    #[instrument(skip(self, qa, cancel), fields(question = %question))]
    pub async fn ask(&self, question: &str, qa: &QaConfig, cancel: CancellationToken) -> Answer {
        if let Err(e) = qa.validate() {
            warn!(error = %e, "Invalid QA configuration");
            return Answer::unanswerable(e.reason_code());
        }
        if cancel.is_cancelled() {
            return Answer::unanswerable(LatticeError::Cancelled.reason_code());
        }

        let schema = match self.store.schema().await {
            Ok(schema) => schema,
            Err(e) => {
                warn!(error = %e, "Schema introspection failed");
                return Answer::unanswerable(e.reason_code());
            }
        };
        debug!(
            node_types = schema.node_types.len(),
            relation_types = schema.relation_types.len(),
            "Schema loaded"
        );

        let retry = self.config.model_retry;
        let synthesizer = AnswerSynthesizer::new(self.synthesis_model.clone())
            .with_retry(retry)
            .with_validation(qa.validate_query)
            .with_top_k(qa.top_k);

        if qa.multi_step {
            let iterative = synthesizer.answer_iterative(question, &schema, self.store.as_ref(), qa.max_steps);
            return tokio::select! {
                _ = cancel.cancelled() => Answer::unanswerable(LatticeError::Cancelled.reason_code()),
                answer = iterative => answer,
            };
        }

        let translator = QueryTranslator::new(self.translation_model.clone())
            .with_max_retries(qa.max_translation_retries)
            .with_validation(qa.validate_query)
            .with_call_timeout(retry.call_timeout);

        let translated = tokio::select! {
            _ = cancel.cancelled() => Err(LatticeError::Cancelled),
            result = translator.translate_and_execute(question, &schema, self.store.as_ref(), qa.top_k) => result,
        };
        let translation = match translated {
            Ok(translation) => translation,
            Err(e) => {
                warn!(error = %e, reason_code = e.reason_code(), "Question could not be answered");
                return Answer::unanswerable(e.reason_code());
            }
        };

        let mut answer = tokio::select! {
            _ = cancel.cancelled() => return Answer::unanswerable(LatticeError::Cancelled.reason_code()),
            answer = synthesizer.answer(question, &translation.rows) => answer,
        };
        answer.intermediate_queries = translation.attempts;
        answer
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(LatticeError::Cancelled)
    } else {
        Ok(())
    }
}
