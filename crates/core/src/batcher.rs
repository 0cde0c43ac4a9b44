use crate::embeddings::MAX_INPUTS_PER_CALL;
use crate::error::ServiceError;
use crate::models::Chunk;
use crate::retry::{retry_transient, RetryPolicy};
use crate::traits::{EmbeddingClient, InputType};
use std::time::Duration;
use tracing::{debug, warn};

pub const MAX_EMBEDDING_BATCH: usize = MAX_INPUTS_PER_CALL;

#[derive(Debug, Clone, PartialEq)]
pub struct BatchOptions {
    pub batch_size: usize,
    /// Pause between successive embedding calls, for rate-limit pacing.
    pub inter_batch_delay: Duration,
    pub retry: RetryPolicy,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: MAX_EMBEDDING_BATCH,
            inter_batch_delay: Duration::from_millis(250),
            retry: RetryPolicy::default(),
        }
    }
}

/// Chunks of one `(file_number, source_url)` pair, in extraction order.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentGroup {
    pub file_number: String,
    pub source_url: String,
    pub chunks: Vec<Chunk>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GroupEmbeddings {
    pub file_number: String,
    pub source_url: String,
    pub embedded: Vec<EmbeddedChunk>,
    pub dropped: usize,
    pub total_tokens: u64,
}

/// Per-batch progress report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Embedded(usize),
    Dropped(usize),
}

/// Groups chunks by document, preserving first-appearance order of documents and chunk order
/// within each.
pub fn group_by_document(chunks: Vec<Chunk>) -> Vec<DocumentGroup> {
    let mut groups: Vec<DocumentGroup> = Vec::new();
    for chunk in chunks {
        match groups.iter_mut().find(|group| {
            group.file_number == chunk.file_number && group.source_url == chunk.source_url
        }) {
            Some(group) => group.chunks.push(chunk),
            None => groups.push(DocumentGroup {
                file_number: chunk.file_number.clone(),
                source_url: chunk.source_url.clone(),
                chunks: vec![chunk],
            }),
        }
    }
    groups
}

/// Text actually sent for vectorization: a short context header followed by the chunk text.
/// The stored chunk text is left untouched.
pub fn enrich_text(chunk: &Chunk) -> String {
    let mut context = Vec::with_capacity(3);
    if let Some(section) = &chunk.section {
        context.push(format!("Section: {section}"));
    }
    context.push(format!("Page: {}", chunk.page_number));
    if chunk.table_detected {
        context.push("Contains table".to_string());
    }
    format!("[{}]\n{}", context.join(" | "), chunk.text)
}

pub struct EmbeddingBatcher<'a, E: ?Sized> {
    client: &'a E,
    options: BatchOptions,
}

impl<'a, E> EmbeddingBatcher<'a, E>
where
    E: EmbeddingClient + ?Sized,
{
    pub fn new(client: &'a E, options: BatchOptions) -> Self {
        let batch_size = options.batch_size.clamp(1, MAX_EMBEDDING_BATCH);
        Self {
            client,
            options: BatchOptions {
                batch_size,
                ..options
            },
        }
    }

    /// Embeds every group batch by batch, one call at a time. A batch that still fails after
    /// its retries, or comes back malformed or short of vectors, is dropped and reported; any
    /// other failure aborts.
    pub async fn embed_groups(
        &self,
        groups: Vec<DocumentGroup>,
        on_batch: &mut (dyn FnMut(BatchOutcome) + Send),
    ) -> Result<Vec<GroupEmbeddings>, ServiceError> {
        let mut results = Vec::with_capacity(groups.len());
        let mut calls = 0usize;

        for group in groups {
            let mut result = GroupEmbeddings {
                file_number: group.file_number,
                source_url: group.source_url,
                ..GroupEmbeddings::default()
            };

            for batch in group.chunks.chunks(self.options.batch_size) {
                if calls > 0 && !self.options.inter_batch_delay.is_zero() {
                    tokio::time::sleep(self.options.inter_batch_delay).await;
                }
                calls += 1;

                match self.embed_batch(batch).await? {
                    Some((vectors, tokens)) => {
                        result.total_tokens += tokens;
                        result.embedded.extend(batch.iter().cloned().zip(vectors).map(
                            |(chunk, embedding)| EmbeddedChunk { chunk, embedding },
                        ));
                        on_batch(BatchOutcome::Embedded(batch.len()));
                    }
                    None => {
                        result.dropped += batch.len();
                        on_batch(BatchOutcome::Dropped(batch.len()));
                    }
                }
            }

            debug!(
                file_number = %result.file_number,
                source_url = %result.source_url,
                embedded = result.embedded.len(),
                dropped = result.dropped,
                total_tokens = result.total_tokens,
                "document embedded"
            );
            results.push(result);
        }

        Ok(results)
    }

    async fn embed_batch(
        &self,
        batch: &[Chunk],
    ) -> Result<Option<(Vec<Vec<f32>>, u64)>, ServiceError> {
        let inputs: Vec<String> = batch.iter().map(enrich_text).collect();
        let outcome = retry_transient(&self.options.retry, "embed batch", || {
            self.client.embed(&inputs, InputType::Document)
        })
        .await;

        let outcome = outcome.and_then(|embedded| {
            if embedded.vectors.len() == batch.len() {
                Ok(embedded)
            } else {
                Err(ServiceError::Malformed {
                    service: "embedding",
                    details: format!(
                        "{} vectors returned for {} inputs",
                        embedded.vectors.len(),
                        batch.len()
                    ),
                })
            }
        });

        match outcome {
            Ok(embedded) => Ok(Some((embedded.vectors, embedded.total_tokens))),
            Err(error) if error.is_transient() || error.is_malformed() => {
                warn!(
                    chunks = batch.len(),
                    first_chunk_index = batch.first().map(|chunk| chunk.chunk_index),
                    source_url = batch.first().map(|chunk| chunk.source_url.as_str()),
                    %error,
                    "dropping embedding batch"
                );
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }
}
