use crate::batcher::{group_by_document, BatchOptions, BatchOutcome, EmbeddedChunk, EmbeddingBatcher};
use crate::config::{Settings, DEFAULT_UPSERT_BATCH_SIZE};
use crate::error::PipelineError;
use crate::models::{DiscoveryRequest, PipelineJob, PipelineStatus};
use crate::normalizer::normalize_response;
use crate::store::UpsertEngine;
use crate::traits::{ChunkStore, DiscoverySource, DocumentExtractor, EmbeddingClient};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

type Observer<'a> = &'a mut (dyn FnMut(&PipelineJob) + Send);

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub batch: BatchOptions,
    pub upsert_batch_size: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            batch: BatchOptions::default(),
            upsert_batch_size: DEFAULT_UPSERT_BATCH_SIZE,
        }
    }
}

impl PipelineOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            batch: settings.batch_options(),
            upsert_batch_size: settings.upsert_batch_size,
        }
    }
}

/// Runs discovery, extraction, embedding and storage strictly one after another. Each run
/// owns a fresh [`PipelineJob`]; the store is the only thing shared between runs.
pub struct PipelineOrchestrator<D, X, E: ?Sized, S: ?Sized> {
    discovery: D,
    extractor: X,
    embedder: Arc<E>,
    store: Arc<S>,
    options: PipelineOptions,
}

impl<D, X, E, S> PipelineOrchestrator<D, X, E, S>
where
    D: DiscoverySource,
    X: DocumentExtractor,
    E: EmbeddingClient + ?Sized,
    S: ChunkStore + ?Sized,
{
    pub fn new(
        discovery: D,
        extractor: X,
        embedder: Arc<E>,
        store: Arc<S>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            discovery,
            extractor,
            embedder,
            store,
            options,
        }
    }

    pub async fn run(&self, request: &DiscoveryRequest) -> PipelineJob {
        self.run_observed(request, |_| {}).await
    }

    /// Like [`run`](Self::run), handing `observer` a snapshot after every counter change and
    /// every transition. Stage failures end up in the returned job, never as an `Err`.
    pub async fn run_observed<F>(&self, request: &DiscoveryRequest, mut observer: F) -> PipelineJob
    where
        F: FnMut(&PipelineJob) + Send,
    {
        let mut job = PipelineJob::new();
        info!(
            job_id = %job.id,
            case_numbers = ?request.case_numbers,
            search_terms = ?request.search_terms,
            max_documents = request.max_documents,
            "pipeline started"
        );

        if let Err(failure) = self.execute(request, &mut job, &mut observer).await {
            error!(job_id = %job.id, stage = %job.status, error = %failure, "pipeline failed");
            job.fail(failure.to_string());
            observer(&job);
        }

        info!(
            job_id = %job.id,
            status = %job.status,
            discovered_pdfs = job.discovered_pdfs,
            parsed_chunks = job.parsed_chunks,
            embedded_chunks = job.embedded_chunks,
            upserted_chunks = job.upserted_chunks,
            "pipeline finished"
        );
        job
    }

    async fn execute(
        &self,
        request: &DiscoveryRequest,
        job: &mut PipelineJob,
        observer: Observer<'_>,
    ) -> Result<(), PipelineError> {
        transition(job, PipelineStatus::Discovering, observer)?;
        let documents = self
            .discovery
            .discover(request)
            .await
            .map_err(PipelineError::Discovery)?;
        job.discovered_pdfs = documents.len() as u64;
        observer(job);
        if documents.is_empty() {
            return transition(job, PipelineStatus::Completed, observer);
        }

        transition(job, PipelineStatus::Parsing, observer)?;
        let mut chunks = Vec::new();
        for document in &documents {
            let response = self.extractor.extract(&document.url).await.map_err(|source| {
                PipelineError::Extraction {
                    url: document.url.clone(),
                    source,
                }
            })?;

            let normalized = normalize_response(&response, &document.case_number, &document.url);
            match normalized.shape {
                Some(shape) => debug!(
                    url = %document.url,
                    ?shape,
                    chunks = normalized.chunks.len(),
                    "document normalized"
                ),
                None => warn!(url = %document.url, "no chunks recognized in extraction response"),
            }

            job.parsed_chunks += normalized.chunks.len() as u64;
            observer(job);
            chunks.extend(normalized.chunks);
        }
        if chunks.is_empty() {
            return transition(job, PipelineStatus::Completed, observer);
        }

        transition(job, PipelineStatus::Embedding, observer)?;
        let batcher = EmbeddingBatcher::new(self.embedder.as_ref(), self.options.batch.clone());
        let groups = batcher
            .embed_groups(group_by_document(chunks), &mut |outcome| {
                if let BatchOutcome::Embedded(count) = outcome {
                    job.embedded_chunks += count as u64;
                    observer(job);
                }
            })
            .await
            .map_err(PipelineError::Embedding)?;

        let dropped: usize = groups.iter().map(|group| group.dropped).sum();
        if dropped > 0 {
            warn!(dropped, "chunks left unembedded after dropped batches");
        }
        let embedded: Vec<EmbeddedChunk> = groups
            .into_iter()
            .flat_map(|group| group.embedded)
            .collect();

        transition(job, PipelineStatus::Upserting, observer)?;
        let engine = UpsertEngine::new(
            self.store.as_ref(),
            self.options.upsert_batch_size,
            self.options.batch.retry,
        );
        let summary = engine
            .upsert_embedded(&embedded, &documents, &mut |counts| {
                job.upserted_chunks += counts.total() as u64;
                observer(job);
            })
            .await
            .map_err(PipelineError::Store)?;
        if summary.dropped > 0 {
            warn!(dropped = summary.dropped, "chunks left unstored after dropped batches");
        }

        transition(job, PipelineStatus::Completed, observer)
    }
}

fn transition(
    job: &mut PipelineJob,
    next: PipelineStatus,
    observer: Observer<'_>,
) -> Result<(), PipelineError> {
    job.advance(next)?;
    info!(job_id = %job.id, status = %next, "pipeline stage");
    observer(job);
    Ok(())
}

/// One-line, human-readable account of a finished job.
pub fn summary_message(job: &PipelineJob) -> String {
    match job.status {
        PipelineStatus::Failed => format!(
            "Pipeline failed: {}",
            job.error.as_deref().unwrap_or("unknown error")
        ),
        PipelineStatus::Completed if job.discovered_pdfs == 0 => {
            "No documents discovered".to_string()
        }
        PipelineStatus::Completed if job.parsed_chunks == 0 => format!(
            "Discovered {} documents but extracted no chunks",
            job.discovered_pdfs
        ),
        PipelineStatus::Completed => format!(
            "Processed {} documents: {} chunks parsed, {} embedded, {} stored",
            job.discovered_pdfs, job.parsed_chunks, job.embedded_chunks, job.upserted_chunks
        ),
        status => format!("Pipeline is {status}"),
    }
}
