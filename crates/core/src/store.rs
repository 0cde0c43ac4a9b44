use crate::batcher::EmbeddedChunk;
use crate::error::StoreError;
use crate::models::{
    CandidateFilter, ChunkMetadata, DiscoveredDocument, StoredChunk, UpsertCounts,
};
use crate::quantize::quantize;
use crate::retry::{retry_transient, RetryPolicy};
use crate::traits::ChunkStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub counts: UpsertCounts,
    pub dropped: usize,
}

/// Quantizes embedded chunks and writes them in fixed-size bulk batches.
pub struct UpsertEngine<'a, S: ?Sized> {
    store: &'a S,
    batch_size: usize,
    retry: RetryPolicy,
}

impl<'a, S> UpsertEngine<'a, S>
where
    S: ChunkStore + ?Sized,
{
    pub fn new(store: &'a S, batch_size: usize, retry: RetryPolicy) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            retry,
        }
    }

    /// One bulk call per batch. `embeddedAt` is stamped when the batch is written. A batch that
    /// still fails transiently after its retries is dropped and reported as such; any other
    /// store error aborts.
    pub async fn upsert_embedded(
        &self,
        embedded: &[EmbeddedChunk],
        sources: &[DiscoveredDocument],
        on_batch: &mut (dyn FnMut(UpsertCounts) + Send),
    ) -> Result<UpsertSummary, StoreError> {
        let mut summary = UpsertSummary::default();

        for batch in embedded.chunks(self.batch_size) {
            let embedded_at = Utc::now();
            let documents: Vec<StoredChunk> = batch
                .iter()
                .map(|item| {
                    let source = sources
                        .iter()
                        .find(|document| document.url == item.chunk.source_url);
                    to_stored(item, source, embedded_at)
                })
                .collect();

            let outcome = retry_transient(&self.retry, "upsert batch", || {
                self.store.upsert(&documents)
            })
            .await;

            match outcome {
                Ok(counts) => {
                    debug!(
                        inserted = counts.inserted_count,
                        modified = counts.modified_count,
                        "upsert batch stored"
                    );
                    summary.counts.merge(counts);
                    on_batch(counts);
                }
                Err(error) if error.is_transient() => {
                    warn!(chunks = batch.len(), %error, "dropping upsert batch");
                    summary.dropped += batch.len();
                }
                Err(error) => return Err(error),
            }
        }

        Ok(summary)
    }
}

pub fn to_stored(
    item: &EmbeddedChunk,
    source: Option<&DiscoveredDocument>,
    embedded_at: DateTime<Utc>,
) -> StoredChunk {
    StoredChunk {
        chunk: item.chunk.clone(),
        embedding: Some(quantize(&item.embedding)),
        embedding_dimensions: item.embedding.len(),
        metadata: ChunkMetadata {
            embedded_at,
            title: source
                .map(|document| document.title.clone())
                .filter(|title| !title.is_empty()),
            attachment_type: source.and_then(|document| document.attachment_type.clone()),
        },
    }
}

#[derive(Default)]
struct MemoryState {
    records: Vec<StoredChunk>,
    positions: HashMap<(String, u32), usize>,
}

/// In-process store keeping insertion order. Re-upserting a key replaces the record in place.
#[derive(Default)]
pub struct MemoryChunkStore {
    state: RwLock<MemoryState>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn get(&self, source_url: &str, chunk_index: u32) -> Option<StoredChunk> {
        let state = self.state.read().await;
        state
            .positions
            .get(&(source_url.to_string(), chunk_index))
            .map(|position| state.records[*position].clone())
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn upsert(&self, documents: &[StoredChunk]) -> Result<UpsertCounts, StoreError> {
        let mut state = self.state.write().await;
        let mut counts = UpsertCounts::default();

        for document in documents {
            let key = (document.chunk.source_url.clone(), document.chunk.chunk_index);
            match state.positions.get(&key).copied() {
                Some(position) => {
                    state.records[position] = document.clone();
                    counts.modified_count += 1;
                }
                None => {
                    let position = state.records.len();
                    state.records.push(document.clone());
                    state.positions.insert(key, position);
                    counts.inserted_count += 1;
                }
            }
        }

        Ok(counts)
    }

    async fn candidates(
        &self,
        filter: &CandidateFilter,
        cap: usize,
    ) -> Result<Vec<StoredChunk>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .records
            .iter()
            .filter(|record| filter.admits(&record.chunk.file_number))
            .filter(|record| record.is_searchable())
            .take(cap)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::models::{BoundingBox, Chunk};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn chunk(file_number: &str, source_url: &str, index: u32, text: &str) -> Chunk {
        Chunk {
            text: text.to_string(),
            page_number: 1,
            bounding_box: BoundingBox::FULL_PAGE,
            chunk_index: index,
            file_number: file_number.to_string(),
            source_url: source_url.to_string(),
            section: None,
            table_detected: false,
        }
    }

    fn embedded(file_number: &str, source_url: &str, index: u32, text: &str) -> EmbeddedChunk {
        EmbeddedChunk {
            chunk: chunk(file_number, source_url, index, text),
            embedding: vec![0.1, -0.2, 0.3, 0.0],
        }
    }

    fn stored(file_number: &str, index: u32, embedding: Option<Vec<i8>>) -> StoredChunk {
        StoredChunk {
            chunk: chunk(file_number, "https://x.gov/a.pdf", index, "text"),
            embedding_dimensions: 4,
            embedding,
            metadata: ChunkMetadata {
                embedded_at: Utc::now(),
                title: None,
                attachment_type: None,
            },
        }
    }

    #[tokio::test]
    async fn upserting_the_same_key_twice_keeps_one_record() {
        let store = MemoryChunkStore::new();
        let engine = UpsertEngine::new(&store, 10, RetryPolicy::once());
        let payload = vec![embedded("Z-1", "https://x.gov/a.pdf", 0, "Rear setback 20 feet")];

        let first = engine.upsert_embedded(&payload, &[], &mut |_| {}).await.unwrap();
        let second = engine.upsert_embedded(&payload, &[], &mut |_| {}).await.unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(first.counts.inserted_count, 1);
        assert_eq!(second.counts.inserted_count, 0);
        assert!(second.counts.modified_count >= 1);
    }

    #[tokio::test]
    async fn stored_records_are_quantized_and_stamped() {
        let store = MemoryChunkStore::new();
        let engine = UpsertEngine::new(&store, 10, RetryPolicy::once());
        let source = DiscoveredDocument {
            url: "https://x.gov/a.pdf".to_string(),
            title: "Staff report".to_string(),
            case_number: "Z-1".to_string(),
            attachment_type: Some("Staff Report".to_string()),
            discovered_at: Utc::now(),
        };
        let before = Utc::now();

        engine
            .upsert_embedded(
                &[embedded("Z-1", "https://x.gov/a.pdf", 0, "Lot area")],
                std::slice::from_ref(&source),
                &mut |_| {},
            )
            .await
            .unwrap();

        let record = store.get("https://x.gov/a.pdf", 0).await.unwrap();
        assert_eq!(record.embedding_dimensions, 4);
        assert_eq!(record.embedding.as_ref().map(Vec::len), Some(4));
        assert!(record.metadata.embedded_at >= before);
        assert_eq!(record.metadata.title.as_deref(), Some("Staff report"));
        assert_eq!(record.metadata.attachment_type.as_deref(), Some("Staff Report"));
    }

    #[tokio::test]
    async fn shrinking_reextraction_leaves_higher_indices_in_place() {
        let store = MemoryChunkStore::new();
        let engine = UpsertEngine::new(&store, 10, RetryPolicy::once());
        let url = "https://x.gov/a.pdf";
        let first_run: Vec<_> = (0..3)
            .map(|i| embedded("Z-1", url, i, &format!("old {i}")))
            .collect();
        let second_run: Vec<_> = (0..2)
            .map(|i| embedded("Z-1", url, i, &format!("new {i}")))
            .collect();

        engine.upsert_embedded(&first_run, &[], &mut |_| {}).await.unwrap();
        engine.upsert_embedded(&second_run, &[], &mut |_| {}).await.unwrap();

        assert_eq!(store.len().await, 3);
        assert_eq!(store.get(url, 1).await.unwrap().chunk.text, "new 1");
        // Stale records are not pruned.
        assert_eq!(store.get(url, 2).await.unwrap().chunk.text, "old 2");
    }

    #[tokio::test]
    async fn candidates_honor_filter_embedding_presence_and_cap() {
        let store = MemoryChunkStore::new();
        store
            .upsert(&[
                stored("A", 0, Some(vec![1, 2, 3, 4])),
                stored("B", 1, Some(vec![1, 2, 3, 4])),
                stored("A", 2, None),
                stored("A", 3, Some(vec![4, 3, 2, 1])),
                stored("A", 4, Some(vec![4, 3, 2, 1])),
            ])
            .await
            .unwrap();

        let filter = CandidateFilter {
            file_numbers: vec!["A".to_string()],
        };
        let found = store.candidates(&filter, 2).await.unwrap();
        let indices: Vec<u32> = found.iter().map(|record| record.chunk.chunk_index).collect();
        assert_eq!(indices, vec![0, 3]);

        let everything = store.candidates(&CandidateFilter::default(), 500).await.unwrap();
        assert_eq!(everything.len(), 4);
    }

    struct FlakyStore {
        calls: AtomicUsize,
        status: u16,
    }

    #[async_trait]
    impl ChunkStore for FlakyStore {
        async fn upsert(&self, documents: &[StoredChunk]) -> Result<UpsertCounts, StoreError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(StoreError::Service(ServiceError::Status {
                    service: "qdrant",
                    status: self.status,
                    body: String::new(),
                }));
            }
            Ok(UpsertCounts {
                inserted_count: documents.len(),
                modified_count: 0,
            })
        }

        async fn candidates(
            &self,
            _filter: &CandidateFilter,
            _cap: usize,
        ) -> Result<Vec<StoredChunk>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn transient_batch_failures_are_dropped() {
        let store = FlakyStore {
            calls: AtomicUsize::new(0),
            status: 503,
        };
        let engine = UpsertEngine::new(&store, 2, RetryPolicy::once());
        let payload: Vec<_> = (0..5)
            .map(|i| embedded("Z-1", "https://x.gov/a.pdf", i, "text"))
            .collect();

        let mut batches = 0;
        let summary = engine
            .upsert_embedded(&payload, &[], &mut |_| batches += 1)
            .await
            .unwrap();

        assert_eq!(summary.dropped, 2);
        assert_eq!(summary.counts.inserted_count, 3);
        assert_eq!(batches, 2);
    }

    #[tokio::test]
    async fn transient_upsert_failure_is_retried_and_lands() {
        let store = FlakyStore {
            calls: AtomicUsize::new(0),
            status: 503,
        };
        let engine = UpsertEngine::new(&store, 2, RetryPolicy::new(2, Duration::ZERO));
        let payload = vec![embedded("Z-1", "https://x.gov/a.pdf", 0, "text")];

        let mut batches = 0;
        let summary = engine
            .upsert_embedded(&payload, &[], &mut |_| batches += 1)
            .await
            .unwrap();

        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
        assert_eq!(summary.dropped, 0);
        assert_eq!(summary.counts.inserted_count, 1);
        assert_eq!(batches, 1);
    }

    #[tokio::test]
    async fn permanent_store_failures_abort() {
        let store = FlakyStore {
            calls: AtomicUsize::new(0),
            status: 400,
        };
        let engine = UpsertEngine::new(&store, 2, RetryPolicy::once());
        let payload = vec![embedded("Z-1", "https://x.gov/a.pdf", 0, "text")];

        let result = engine.upsert_embedded(&payload, &[], &mut |_| {}).await;
        assert!(result.is_err());
    }
}
