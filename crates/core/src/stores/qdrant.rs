use crate::error::{ServiceError, StoreError};
use crate::http::{build_client, send_json};
use crate::models::{CandidateFilter, StoredChunk, UpsertCounts};
use crate::traits::ChunkStore;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::info;
use uuid::Uuid;

const SERVICE: &str = "qdrant";
const VECTOR_NAME: &str = "embedding";
const SEARCHABLE_FLAG: &str = "hasEmbedding";

/// Chunk store on a Qdrant collection. The collection is created on first use; the HTTP
/// client (and its connection pool) lives as long as the store.
pub struct QdrantChunkStore {
    endpoint: String,
    collection: String,
    api_key: Option<String>,
    client: Client,
    vector_size: usize,
    ready: OnceCell<()>,
}

#[derive(Deserialize)]
struct QdrantResponse<T> {
    result: T,
}

#[derive(Deserialize)]
struct RetrievedPoint {
    id: Value,
}

#[derive(Deserialize)]
struct ScrollResult {
    points: Vec<ScrolledPoint>,
}

#[derive(Deserialize)]
struct ScrolledPoint {
    #[serde(default)]
    payload: Option<Map<String, Value>>,
    #[serde(default)]
    vector: Option<Value>,
}

impl QdrantChunkStore {
    pub fn new(
        endpoint: impl Into<String>,
        collection: impl Into<String>,
        vector_size: usize,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            collection: collection.into(),
            api_key,
            client: build_client(timeout),
            vector_size,
            ready: OnceCell::new(),
        }
    }

    /// Deterministic point id for the `(source_url, chunk_index)` dedup key.
    pub fn point_id(source_url: &str, chunk_index: u32) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source_url.as_bytes());
        hasher.update([0u8]);
        hasher.update(chunk_index.to_le_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Uuid::from_bytes(bytes).to_string()
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self.client.request(
            method,
            format!("{}/collections/{}{}", self.endpoint, self.collection, path),
        );
        match &self.api_key {
            Some(key) => request.header("api-key", key),
            None => request,
        }
    }

    pub async fn ensure_collection(&self) -> Result<(), StoreError> {
        self.ready
            .get_or_try_init(|| async {
                let response = self
                    .request(Method::GET, "")
                    .send()
                    .await
                    .map_err(|error| ServiceError::from_reqwest(SERVICE, error))?;

                match response.status() {
                    status if status.is_success() => return Ok(()),
                    StatusCode::NOT_FOUND => {}
                    status => {
                        return Err(StoreError::Service(ServiceError::Status {
                            service: SERVICE,
                            status: status.as_u16(),
                            body: response.text().await.unwrap_or_default(),
                        }))
                    }
                }

                let _: Value = send_json(
                    SERVICE,
                    self.request(Method::PUT, "").json(&json!({
                        "vectors": {
                            VECTOR_NAME: { "size": self.vector_size, "distance": "Cosine" }
                        },
                        "quantization_config": {
                            "scalar": { "type": "int8", "always_ram": true }
                        }
                    })),
                )
                .await?;
                let _: Value = send_json(
                    SERVICE,
                    self.request(Method::PUT, "/index").json(&json!({
                        "field_name": "fileNumber",
                        "field_schema": "keyword"
                    })),
                )
                .await?;

                info!(collection = %self.collection, vector_size = self.vector_size, "created collection");
                Ok::<(), StoreError>(())
            })
            .await
            .map(|_| ())
    }

    async fn existing_ids(&self, ids: &[String]) -> Result<HashSet<String>, StoreError> {
        let response: QdrantResponse<Vec<RetrievedPoint>> = send_json(
            SERVICE,
            self.request(Method::POST, "/points").json(&json!({
                "ids": ids,
                "with_payload": false,
                "with_vector": false,
            })),
        )
        .await?;

        Ok(response
            .result
            .into_iter()
            .map(|point| match point.id {
                Value::String(id) => id,
                other => other.to_string(),
            })
            .collect())
    }

    fn to_point(&self, document: &StoredChunk) -> Result<Value, StoreError> {
        let vector = match &document.embedding {
            Some(embedding) if !embedding.is_empty() => {
                if embedding.len() != self.vector_size {
                    return Err(StoreError::InvalidDocument(format!(
                        "embedding dimension {} != {}",
                        embedding.len(),
                        self.vector_size
                    )));
                }
                let values: Vec<f32> = embedding.iter().map(|value| f32::from(*value)).collect();
                json!({ VECTOR_NAME: values })
            }
            _ => json!({}),
        };

        let mut payload = serde_json::to_value(document)?;
        if let Some(fields) = payload.as_object_mut() {
            fields.remove("embedding");
            fields.insert(
                SEARCHABLE_FLAG.to_string(),
                Value::Bool(document.is_searchable()),
            );
        }

        Ok(json!({
            "id": Self::point_id(&document.chunk.source_url, document.chunk.chunk_index),
            "vector": vector,
            "payload": payload,
        }))
    }
}

fn from_point(point: ScrolledPoint) -> Result<StoredChunk, StoreError> {
    let mut payload = point
        .payload
        .ok_or_else(|| StoreError::InvalidDocument("point without payload".to_string()))?;
    payload.remove(SEARCHABLE_FLAG);

    let embedding = point
        .vector
        .as_ref()
        .and_then(|vector| vector.get(VECTOR_NAME).or(Some(vector)))
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_f64)
                .map(|value| value.round().clamp(-128.0, 127.0) as i8)
                .collect::<Vec<i8>>()
        });
    if let Some(embedding) = embedding {
        payload.insert("embedding".to_string(), json!(embedding));
    }

    Ok(serde_json::from_value(Value::Object(payload))?)
}

#[async_trait]
impl ChunkStore for QdrantChunkStore {
    async fn upsert(&self, documents: &[StoredChunk]) -> Result<UpsertCounts, StoreError> {
        if documents.is_empty() {
            return Ok(UpsertCounts::default());
        }
        self.ensure_collection().await?;

        let points = documents
            .iter()
            .map(|document| self.to_point(document))
            .collect::<Result<Vec<_>, StoreError>>()?;
        let ids: Vec<String> = documents
            .iter()
            .map(|document| Self::point_id(&document.chunk.source_url, document.chunk.chunk_index))
            .collect();

        let mut seen = self.existing_ids(&ids).await?;

        let _: Value = send_json(
            SERVICE,
            self.request(Method::PUT, "/points?wait=true")
                .json(&json!({ "points": points })),
        )
        .await?;

        let mut counts = UpsertCounts::default();
        for id in ids {
            if seen.insert(id) {
                counts.inserted_count += 1;
            } else {
                counts.modified_count += 1;
            }
        }
        Ok(counts)
    }

    async fn candidates(
        &self,
        filter: &CandidateFilter,
        cap: usize,
    ) -> Result<Vec<StoredChunk>, StoreError> {
        if cap == 0 {
            return Ok(Vec::new());
        }
        self.ensure_collection().await?;

        let mut must = vec![json!({ "key": SEARCHABLE_FLAG, "match": { "value": true } })];
        if !filter.file_numbers.is_empty() {
            must.push(json!({ "key": "fileNumber", "match": { "any": filter.file_numbers } }));
        }

        let response: QdrantResponse<ScrollResult> = send_json(
            SERVICE,
            self.request(Method::POST, "/points/scroll").json(&json!({
                "filter": { "must": must },
                "limit": cap,
                "with_payload": true,
                "with_vector": [VECTOR_NAME],
            })),
        )
        .await?;

        response
            .result
            .points
            .into_iter()
            .map(from_point)
            .filter(|parsed| match parsed {
                Ok(record) => record.is_searchable(),
                Err(_) => true,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BoundingBox, Chunk, ChunkMetadata};
    use chrono::Utc;
    use httpmock::{
        Method::{GET, POST, PUT},
        MockServer,
    };

    fn store_for(server: &MockServer) -> QdrantChunkStore {
        QdrantChunkStore::new(
            server.base_url(),
            "zoning",
            3,
            Some("qdrant-key".to_string()),
            Duration::from_secs(5),
        )
    }

    fn document(index: u32) -> StoredChunk {
        StoredChunk {
            chunk: Chunk {
                text: format!("chunk {index}"),
                page_number: 2,
                bounding_box: BoundingBox::FULL_PAGE,
                chunk_index: index,
                file_number: "PC-2024-9".to_string(),
                source_url: "https://x.gov/pc.pdf".to_string(),
                section: Some("Section 3".to_string()),
                table_detected: false,
            },
            embedding: Some(vec![-128, 0, 127]),
            embedding_dimensions: 3,
            metadata: ChunkMetadata {
                embedded_at: Utc::now(),
                title: None,
                attachment_type: None,
            },
        }
    }

    async fn collection_exists(server: &MockServer) {
        server
            .mock_async(|when, then| {
                when.method(GET).path("/collections/zoning");
                then.status(200).json_body(json!({"result": {"status": "green"}}));
            })
            .await;
    }

    #[test]
    fn point_ids_are_stable_per_key() {
        let first = QdrantChunkStore::point_id("https://x.gov/a.pdf", 3);
        let again = QdrantChunkStore::point_id("https://x.gov/a.pdf", 3);
        let other = QdrantChunkStore::point_id("https://x.gov/a.pdf", 4);
        assert_eq!(first, again);
        assert_ne!(first, other);
        assert!(Uuid::parse_str(&first).is_ok());
    }

    #[tokio::test]
    async fn upsert_counts_existing_points_as_modified() {
        let server = MockServer::start_async().await;
        collection_exists(&server).await;
        let existing = QdrantChunkStore::point_id("https://x.gov/pc.pdf", 0);
        let lookup = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/collections/zoning/points")
                    .header("api-key", "qdrant-key");
                then.status(200)
                    .json_body(json!({"result": [{"id": existing}]}));
            })
            .await;
        let write = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/collections/zoning/points")
                    .query_param("wait", "true");
                then.status(200)
                    .json_body(json!({"result": {"status": "completed"}}));
            })
            .await;

        let counts = store_for(&server)
            .upsert(&[document(0), document(1)])
            .await
            .unwrap();

        lookup.assert();
        write.assert();
        assert_eq!(counts.modified_count, 1);
        assert_eq!(counts.inserted_count, 1);
    }

    #[tokio::test]
    async fn candidates_are_rebuilt_from_scrolled_points() {
        let server = MockServer::start_async().await;
        collection_exists(&server).await;
        let mut payload = serde_json::to_value(document(7)).unwrap();
        let fields = payload.as_object_mut().unwrap();
        fields.remove("embedding");
        fields.insert("hasEmbedding".to_string(), Value::Bool(true));

        let scroll = server
            .mock_async(|when, then| {
                when.method(POST).path("/collections/zoning/points/scroll");
                then.status(200).json_body(json!({
                    "result": {
                        "points": [{
                            "id": "abc",
                            "payload": payload,
                            "vector": {"embedding": [-128.0, 0.0, 127.0]}
                        }],
                        "next_page_offset": null
                    }
                }));
            })
            .await;

        let filter = CandidateFilter {
            file_numbers: vec!["PC-2024-9".to_string()],
        };
        let found = store_for(&server).candidates(&filter, 500).await.unwrap();

        scroll.assert();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].chunk.chunk_index, 7);
        assert_eq!(found[0].embedding, Some(vec![-128, 0, 127]));
        assert_eq!(found[0].chunk.section.as_deref(), Some("Section 3"));
    }

    #[tokio::test]
    async fn missing_collection_is_created_with_int8_quantization() {
        let server = MockServer::start_async().await;
        let lookup = server
            .mock_async(|when, then| {
                when.method(GET).path("/collections/zoning");
                then.status(404).json_body(json!({"status": {"error": "Not found"}}));
            })
            .await;
        let create = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/collections/zoning")
                    .header("api-key", "qdrant-key")
                    .json_body(json!({
                        "vectors": {
                            "embedding": { "size": 3, "distance": "Cosine" }
                        },
                        "quantization_config": {
                            "scalar": { "type": "int8", "always_ram": true }
                        }
                    }));
                then.status(200).json_body(json!({"result": true}));
            })
            .await;
        let index = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/collections/zoning/index")
                    .json_body(json!({"field_name": "fileNumber", "field_schema": "keyword"}));
                then.status(200).json_body(json!({"result": {"status": "completed"}}));
            })
            .await;

        let store = store_for(&server);
        store.ensure_collection().await.unwrap();
        store.ensure_collection().await.unwrap();

        lookup.assert_hits(1);
        create.assert_hits(1);
        index.assert_hits(1);
    }

    #[tokio::test]
    async fn wrong_dimensionality_is_rejected_before_writing() {
        let server = MockServer::start_async().await;
        collection_exists(&server).await;
        let mut bad = document(0);
        bad.embedding = Some(vec![1, 2]);

        let error = store_for(&server).upsert(&[bad]).await.unwrap_err();
        assert!(matches!(error, StoreError::InvalidDocument(_)));
    }
}
