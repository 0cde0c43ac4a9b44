use crate::error::ServiceError;
use crate::http::{build_client, send_json};
use crate::retry::{retry_transient, RetryPolicy};
use crate::traits::DocumentExtractor;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::info;
use url::Url;

const SERVICE: &str = "extraction";

#[derive(Debug, Clone)]
pub struct ExtractionEndpointConfig {
    pub endpoint: String,
    pub api_key: String,
    /// Layout extraction of a long PDF can take minutes.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Serialize)]
struct ExtractionRequest<'a> {
    document_url: &'a str,
}

/// Sends a document URL to the layout-extraction service and hands back its raw response.
pub struct HttpExtractionClient {
    client: Client,
    config: ExtractionEndpointConfig,
}

impl HttpExtractionClient {
    pub fn new(config: ExtractionEndpointConfig) -> Self {
        Self {
            client: build_client(config.timeout),
            config,
        }
    }
}

#[async_trait]
impl DocumentExtractor for HttpExtractionClient {
    async fn extract(&self, document_url: &str) -> Result<Value, ServiceError> {
        let parsed = Url::parse(document_url).map_err(|error| {
            ServiceError::InvalidRequest(format!("invalid document url {document_url}: {error}"))
        })?;

        let payload = ExtractionRequest {
            document_url: parsed.as_str(),
        };
        let response: Value = retry_transient(&self.config.retry, "extract document", || {
            send_json(
                SERVICE,
                self.client
                    .post(&self.config.endpoint)
                    .bearer_auth(&self.config.api_key)
                    .json(&payload),
            )
        })
        .await?;

        info!(document_url, "extraction response received");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};
    use serde_json::json;

    fn client_for(server: &MockServer, max_attempts: u32) -> HttpExtractionClient {
        HttpExtractionClient::new(ExtractionEndpointConfig {
            endpoint: server.url("/parse"),
            api_key: "secret".to_string(),
            timeout: Duration::from_secs(5),
            retry: RetryPolicy::new(max_attempts, Duration::ZERO),
        })
    }

    #[tokio::test]
    async fn posts_the_document_url_and_returns_the_raw_payload() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/parse")
                    .header("authorization", "Bearer secret")
                    .json_body(json!({"document_url": "https://records.example.gov/a.pdf"}));
                then.status(200)
                    .json_body(json!({"markdown": "Variance granted for a 5 foot side yard."}));
            })
            .await;

        let response = client_for(&server, 1)
            .extract("https://records.example.gov/a.pdf")
            .await
            .unwrap();

        mock.assert();
        assert_eq!(
            response["markdown"],
            "Variance granted for a 5 foot side yard."
        );
    }

    #[tokio::test]
    async fn server_errors_are_retried_before_surfacing() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/parse");
                then.status(502);
            })
            .await;

        let error = client_for(&server, 3)
            .extract("https://records.example.gov/a.pdf")
            .await
            .unwrap_err();

        mock.assert_hits(3);
        assert!(matches!(error, ServiceError::Status { status: 502, .. }));
    }

    #[tokio::test]
    async fn invalid_urls_fail_before_any_request() {
        let server = MockServer::start_async().await;
        let error = client_for(&server, 1).extract("not a url").await.unwrap_err();
        assert!(matches!(error, ServiceError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn timeouts_fail_the_call_without_retrying() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/parse");
                then.status(200)
                    .delay(Duration::from_millis(500))
                    .json_body(json!({"markdown": "late"}));
            })
            .await;
        let client = HttpExtractionClient::new(ExtractionEndpointConfig {
            endpoint: server.url("/parse"),
            api_key: "secret".to_string(),
            timeout: Duration::from_millis(100),
            retry: RetryPolicy::new(3, Duration::ZERO),
        });

        let error = client
            .extract("https://records.example.gov/a.pdf")
            .await
            .unwrap_err();

        mock.assert_hits(1);
        assert!(matches!(error, ServiceError::Timeout { .. }));
        assert!(!error.is_transient());
    }
}
