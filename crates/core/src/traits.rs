use crate::models::{
    CandidateFilter, DiscoveredDocument, DiscoveryRequest, SearchHit, StoredChunk, UpsertCounts,
};
use crate::scorer::rank_candidates;
use crate::{ServiceError, StoreError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[async_trait]
pub trait DiscoverySource: Send + Sync {
    async fn discover(
        &self,
        request: &DiscoveryRequest,
    ) -> Result<Vec<DiscoveredDocument>, ServiceError>;
}

#[async_trait]
impl<T> DiscoverySource for Box<T>
where
    T: DiscoverySource + ?Sized,
{
    async fn discover(
        &self,
        request: &DiscoveryRequest,
    ) -> Result<Vec<DiscoveredDocument>, ServiceError> {
        (**self).discover(request).await
    }
}

/// Layout extraction. Returns the service's raw response; shape detection belongs to the
/// normalizer.
#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    async fn extract(&self, document_url: &str) -> Result<Value, ServiceError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    Document,
    Query,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingBatch {
    /// Parallel to the submitted inputs.
    pub vectors: Vec<Vec<f32>>,
    pub total_tokens: u64,
}

#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    fn dimensions(&self) -> usize;

    async fn embed(
        &self,
        inputs: &[String],
        input_type: InputType,
    ) -> Result<EmbeddingBatch, ServiceError>;
}

#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Idempotent bulk upsert keyed by `(source_url, chunk_index)`.
    async fn upsert(&self, documents: &[StoredChunk]) -> Result<UpsertCounts, StoreError>;

    /// Stored chunks that pass `filter` and carry an embedding, in storage order, at most `cap`.
    async fn candidates(
        &self,
        filter: &CandidateFilter,
        cap: usize,
    ) -> Result<Vec<StoredChunk>, StoreError>;

    /// Brute-force scan over the capped candidate set. Chunks beyond `cap` are never scored,
    /// which bounds latency and bounds recall at large corpus sizes.
    async fn search(
        &self,
        query_vector: &[f32],
        filter: &CandidateFilter,
        cap: usize,
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<SearchHit>, StoreError> {
        let candidates = self.candidates(filter, cap).await?;
        Ok(rank_candidates(query_vector, candidates, limit, min_score))
    }
}
