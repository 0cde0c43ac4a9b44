pub mod api;
pub mod batcher;
pub mod config;
pub mod discovery;
pub mod embeddings;
pub mod error;
pub mod extractor;
mod http;
pub mod models;
pub mod normalizer;
pub mod pipeline;
pub mod quantize;
pub mod retry;
pub mod scorer;
pub mod search;
pub mod store;
pub mod stores;
pub mod traits;

pub use api::{ActionDispatcher, ActionRequest, ApiResponse, ResponseMetadata, RunPipelineParams};
pub use batcher::{
    enrich_text, group_by_document, BatchOptions, BatchOutcome, DocumentGroup, EmbeddedChunk,
    EmbeddingBatcher, GroupEmbeddings, MAX_EMBEDDING_BATCH,
};
pub use config::{Settings, DEFAULT_CANDIDATE_CAP, DEFAULT_EMBEDDING_DIMENSIONS};
pub use discovery::{sanitize_discovered, HttpDiscoveryClient, StaticDiscovery};
pub use embeddings::HttpEmbeddingClient;
pub use error::{ConfigError, PipelineError, SearchError, ServiceError, StoreError};
pub use extractor::{ExtractionEndpointConfig, HttpExtractionClient};
pub use models::{
    BoundingBox, CandidateFilter, Chunk, ChunkMetadata, DiscoveredDocument, DiscoveryRequest,
    PipelineJob, PipelineStatus, SearchHit, SearchRequest, StoredChunk, UpsertCounts,
};
pub use normalizer::{normalize_response, NormalizedResponse, ResponseShape};
pub use pipeline::{summary_message, PipelineOptions, PipelineOrchestrator};
pub use quantize::{quantize, widen};
pub use retry::{retry_transient, RetryPolicy, Transient};
pub use scorer::{cosine_similarity, rank_candidates};
pub use search::{expand_query, SearchOutcome, SearchService};
pub use store::{MemoryChunkStore, UpsertEngine, UpsertSummary};
pub use stores::QdrantChunkStore;
pub use traits::{ChunkStore, DiscoverySource, DocumentExtractor, EmbeddingBatch, EmbeddingClient, InputType};
