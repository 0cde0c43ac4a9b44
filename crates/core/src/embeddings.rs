use crate::error::ServiceError;
use crate::http::{build_client, send_json};
use crate::traits::{EmbeddingBatch, EmbeddingClient, InputType};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const SERVICE: &str = "embedding";

/// Most inputs the embedding service accepts in one call.
pub const MAX_INPUTS_PER_CALL: usize = 128;

/// Client for an embeddings endpoint that takes `{input, model, input_type}` and answers with
/// `{data: [{embedding, index}], usage: {total_tokens}}`.
pub struct HttpEmbeddingClient {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    dimensions: usize,
}

impl HttpEmbeddingClient {
    pub fn new(
        base_url: impl AsRef<str>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            client: build_client(timeout),
            endpoint: format!("{}/embeddings", base_url.as_ref().trim_end_matches('/')),
            api_key: api_key.into(),
            model: model.into(),
            dimensions,
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
    input_type: InputType,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: u64,
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(
        &self,
        inputs: &[String],
        input_type: InputType,
    ) -> Result<EmbeddingBatch, ServiceError> {
        if inputs.is_empty() {
            return Ok(EmbeddingBatch {
                vectors: Vec::new(),
                total_tokens: 0,
            });
        }
        if inputs.len() > MAX_INPUTS_PER_CALL {
            return Err(ServiceError::InvalidRequest(format!(
                "batch of {} exceeds the service maximum of {MAX_INPUTS_PER_CALL}",
                inputs.len()
            )));
        }

        let request = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                input: inputs,
                model: &self.model,
                input_type,
            });
        let mut response: EmbeddingResponse = send_json(SERVICE, request).await?;

        if response.data.len() != inputs.len() {
            return Err(ServiceError::Malformed {
                service: SERVICE,
                details: format!(
                    "{} embeddings returned for {} inputs",
                    response.data.len(),
                    inputs.len()
                ),
            });
        }

        response.data.sort_by_key(|entry| entry.index);
        if let Some(entry) = response
            .data
            .iter()
            .find(|entry| entry.embedding.len() != self.dimensions)
        {
            return Err(ServiceError::Malformed {
                service: SERVICE,
                details: format!(
                    "vector {} has {} dimensions, expected {}",
                    entry.index,
                    entry.embedding.len(),
                    self.dimensions
                ),
            });
        }

        let total_tokens = response.usage.map_or(0, |usage| usage.total_tokens);
        debug!(inputs = inputs.len(), total_tokens, ?input_type, "embedding batch complete");

        Ok(EmbeddingBatch {
            vectors: response
                .data
                .into_iter()
                .map(|entry| entry.embedding)
                .collect(),
            total_tokens,
        })
    }
}
