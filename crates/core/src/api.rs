use crate::models::{DiscoveryRequest, PipelineJob, PipelineStatus, SearchRequest};
use crate::pipeline::{summary_message, PipelineOrchestrator};
use crate::search::SearchService;
use crate::traits::{ChunkStore, DiscoverySource, DocumentExtractor, EmbeddingClient};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Instant;
use tracing::warn;

const DEFAULT_MAX_DOCUMENTS: usize = 10;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionRequest {
    RunPipeline(RunPipelineParams),
    Search(SearchRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunPipelineParams {
    #[serde(default)]
    pub case_numbers: Vec<String>,
    #[serde(default)]
    pub search_terms: Vec<String>,
    #[serde(default = "default_max_documents")]
    pub max_documents: usize,
}

fn default_max_documents() -> usize {
    DEFAULT_MAX_DOCUMENTS
}

impl From<RunPipelineParams> for DiscoveryRequest {
    fn from(params: RunPipelineParams) -> Self {
        Self {
            case_numbers: params.case_numbers,
            search_terms: params.search_terms,
            max_documents: params.max_documents,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub processing_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Envelope every action answers with, success or not.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metadata: ResponseMetadata,
}

impl ApiResponse {
    fn finish(success: bool, data: Option<Value>, error: Option<String>, started: Instant) -> Self {
        Self {
            success,
            data,
            error,
            metadata: ResponseMetadata {
                processing_time_ms: started.elapsed().as_millis() as u64,
                timestamp: Utc::now(),
            },
        }
    }

    pub fn ok(data: Value, started: Instant) -> Self {
        Self::finish(true, Some(data), None, started)
    }

    pub fn failure(error: impl Into<String>, started: Instant) -> Self {
        Self::finish(false, None, Some(error.into()), started)
    }
}

/// Single entry point that routes an action to the pipeline or the search service.
pub struct ActionDispatcher<D, X, E: ?Sized, S: ?Sized> {
    pipeline: PipelineOrchestrator<D, X, E, S>,
    search: SearchService<E, S>,
}

impl<D, X, E, S> ActionDispatcher<D, X, E, S>
where
    D: DiscoverySource,
    X: DocumentExtractor,
    E: EmbeddingClient + ?Sized,
    S: ChunkStore + ?Sized,
{
    pub fn new(pipeline: PipelineOrchestrator<D, X, E, S>, search: SearchService<E, S>) -> Self {
        Self { pipeline, search }
    }

    /// Parses a raw action body first, so malformed input still gets a well-formed answer.
    pub async fn dispatch_json(&self, body: Value) -> ApiResponse {
        let started = Instant::now();
        match serde_json::from_value::<ActionRequest>(body) {
            Ok(request) => self.dispatch_from(request, started).await,
            Err(error) => {
                warn!(%error, "rejecting malformed action request");
                ApiResponse::failure(format!("invalid request: {error}"), started)
            }
        }
    }

    pub async fn dispatch(&self, request: ActionRequest) -> ApiResponse {
        self.dispatch_from(request, Instant::now()).await
    }

    async fn dispatch_from(&self, request: ActionRequest, started: Instant) -> ApiResponse {
        match request {
            ActionRequest::RunPipeline(params) => {
                let job = self.pipeline.run(&params.into()).await;
                pipeline_response(job, started)
            }
            ActionRequest::Search(request) => match self.search.search(&request).await {
                Ok(outcome) => match serde_json::to_value(&outcome) {
                    Ok(data) => ApiResponse::ok(data, started),
                    Err(error) => ApiResponse::failure(error.to_string(), started),
                },
                Err(error) => ApiResponse::failure(error.to_string(), started),
            },
        }
    }
}

fn pipeline_response(job: PipelineJob, started: Instant) -> ApiResponse {
    let message = summary_message(&job);
    let failed = job.status == PipelineStatus::Failed;
    let error = job.error.clone();
    let data = json!({ "job": job, "message": message });
    if failed {
        ApiResponse::finish(false, Some(data), error, started)
    } else {
        ApiResponse::ok(data, started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StaticDiscovery;
    use crate::error::ServiceError;
    use crate::models::{BoundingBox, Chunk, ChunkMetadata, DiscoveredDocument, StoredChunk};
    use crate::pipeline::PipelineOptions;
    use crate::retry::RetryPolicy;
    use crate::store::MemoryChunkStore;
    use crate::traits::{EmbeddingBatch, InputType};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NoExtraction;

    #[async_trait]
    impl DocumentExtractor for NoExtraction {
        async fn extract(&self, _document_url: &str) -> Result<Value, ServiceError> {
            Err(ServiceError::Status {
                service: "extraction",
                status: 401,
                body: "bad key".to_string(),
            })
        }
    }

    struct UnitEmbedder;

    #[async_trait]
    impl EmbeddingClient for UnitEmbedder {
        fn dimensions(&self) -> usize {
            2
        }

        async fn embed(
            &self,
            inputs: &[String],
            _input_type: InputType,
        ) -> Result<EmbeddingBatch, ServiceError> {
            Ok(EmbeddingBatch {
                vectors: inputs.iter().map(|_| vec![1.0, 0.0]).collect(),
                total_tokens: 0,
            })
        }
    }

    fn document(case_number: &str) -> DiscoveredDocument {
        DiscoveredDocument {
            url: format!("https://x.gov/{case_number}.pdf"),
            title: String::new(),
            case_number: case_number.to_string(),
            attachment_type: None,
            discovered_at: Utc::now(),
        }
    }

    async fn dispatcher(
        documents: Vec<DiscoveredDocument>,
    ) -> ActionDispatcher<StaticDiscovery, NoExtraction, UnitEmbedder, MemoryChunkStore> {
        let store = Arc::new(MemoryChunkStore::new());
        store
            .upsert(&[StoredChunk {
                chunk: Chunk {
                    text: "Minimum lot width is 60 feet".to_string(),
                    page_number: 4,
                    bounding_box: BoundingBox::FULL_PAGE,
                    chunk_index: 0,
                    file_number: "ZBA-7".to_string(),
                    source_url: "https://x.gov/ZBA-7.pdf".to_string(),
                    section: None,
                    table_detected: false,
                },
                embedding: Some(vec![100, 3]),
                embedding_dimensions: 2,
                metadata: ChunkMetadata {
                    embedded_at: Utc::now(),
                    title: None,
                    attachment_type: None,
                },
            }])
            .await
            .unwrap();
        let embedder = Arc::new(UnitEmbedder);

        ActionDispatcher::new(
            PipelineOrchestrator::new(
                StaticDiscovery::new(documents),
                NoExtraction,
                embedder.clone(),
                store.clone(),
                PipelineOptions::default(),
            ),
            SearchService::new(embedder, store, 500, RetryPolicy::once()),
        )
    }

    #[test]
    fn run_pipeline_params_fall_back_to_defaults() {
        let request: ActionRequest =
            serde_json::from_value(json!({ "action": "run_pipeline" })).unwrap();
        assert_eq!(
            request,
            ActionRequest::RunPipeline(RunPipelineParams {
                case_numbers: Vec::new(),
                search_terms: Vec::new(),
                max_documents: 10,
            })
        );
    }

    #[tokio::test]
    async fn empty_discovery_reports_success_with_a_message() {
        let dispatcher = dispatcher(Vec::new()).await;

        let response = dispatcher
            .dispatch_json(json!({ "action": "run_pipeline", "caseNumbers": ["ZBA-9"] }))
            .await;

        assert!(response.success);
        let data = response.data.unwrap();
        assert_eq!(data["job"]["status"], "completed");
        assert_eq!(data["job"]["discoveredPdfs"], 0);
        assert_eq!(data["message"], "No documents discovered");
    }

    #[tokio::test]
    async fn failed_runs_still_return_the_job() {
        let dispatcher = dispatcher(vec![document("ZBA-7")]).await;

        let response = dispatcher
            .dispatch(ActionRequest::RunPipeline(RunPipelineParams {
                case_numbers: vec!["ZBA-7".to_string()],
                search_terms: Vec::new(),
                max_documents: 5,
            }))
            .await;

        assert!(!response.success);
        assert!(response.error.unwrap().contains("401"));
        assert_eq!(response.data.unwrap()["job"]["status"], "failed");
    }

    #[tokio::test]
    async fn search_action_returns_ranked_results() {
        let dispatcher = dispatcher(Vec::new()).await;

        let response = dispatcher
            .dispatch_json(json!({
                "action": "search",
                "query": "lot width",
                "caseNumbers": ["ZBA-7"],
                "minScore": 0.9
            }))
            .await;

        assert!(response.success);
        let results = &response.data.unwrap()["results"];
        assert_eq!(results.as_array().map(Vec::len), Some(1));
        assert_eq!(results[0]["chunk"]["pageNumber"], 4);
        assert!(results[0].get("embedding").is_none());
    }

    #[tokio::test]
    async fn malformed_actions_get_an_error_envelope() {
        let dispatcher = dispatcher(Vec::new()).await;

        let response = dispatcher.dispatch_json(json!({ "action": "reindex" })).await;

        assert!(!response.success);
        assert!(response.error.unwrap().starts_with("invalid request"));
        let encoded = serde_json::to_value(&response.metadata).unwrap();
        assert!(encoded.get("processingTimeMs").is_some());
        assert!(encoded.get("timestamp").is_some());
    }
}
