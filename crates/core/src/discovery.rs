use crate::error::ServiceError;
use crate::http::{build_client, send_json};
use crate::models::{DiscoveredDocument, DiscoveryRequest};
use crate::retry::{retry_transient, RetryPolicy};
use crate::traits::DiscoverySource;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tracing::warn;
use url::Url;

const SERVICE: &str = "discovery";

/// Client for a crawler service that answers a [`DiscoveryRequest`] with candidate PDFs.
pub struct HttpDiscoveryClient {
    client: Client,
    endpoint: String,
    retry: RetryPolicy,
}

impl HttpDiscoveryClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            client: build_client(timeout),
            endpoint: endpoint.into(),
            retry,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DiscoveryResponse {
    Bare(Vec<Value>),
    Envelope { documents: Vec<Value> },
}

/// Decodes entries one at a time so a single malformed record does not sink the whole list.
fn decode_entries(entries: Vec<Value>) -> Vec<DiscoveredDocument> {
    entries
        .into_iter()
        .enumerate()
        .filter_map(|(position, entry)| {
            match serde_json::from_value::<DiscoveredDocument>(entry) {
                Ok(document) => Some(document),
                Err(error) => {
                    warn!(position, %error, "skipping malformed discovery entry");
                    None
                }
            }
        })
        .collect()
}

#[async_trait]
impl DiscoverySource for HttpDiscoveryClient {
    async fn discover(
        &self,
        request: &DiscoveryRequest,
    ) -> Result<Vec<DiscoveredDocument>, ServiceError> {
        let response: DiscoveryResponse = retry_transient(&self.retry, "discover documents", || {
            send_json(SERVICE, self.client.post(&self.endpoint).json(request))
        })
        .await?;

        let entries = match response {
            DiscoveryResponse::Bare(entries) => entries,
            DiscoveryResponse::Envelope { documents } => documents,
        };
        Ok(sanitize_discovered(decode_entries(entries), request.max_documents))
    }
}

/// A fixed document list, for runs where the caller already knows which PDFs to process.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    documents: Vec<DiscoveredDocument>,
}

impl StaticDiscovery {
    pub fn new(documents: Vec<DiscoveredDocument>) -> Self {
        Self { documents }
    }
}

#[async_trait]
impl DiscoverySource for StaticDiscovery {
    async fn discover(
        &self,
        request: &DiscoveryRequest,
    ) -> Result<Vec<DiscoveredDocument>, ServiceError> {
        let selected = self
            .documents
            .iter()
            .filter(|document| {
                request.case_numbers.is_empty()
                    || request
                        .case_numbers
                        .iter()
                        .any(|case| case.eq_ignore_ascii_case(&document.case_number))
            })
            .cloned()
            .collect();
        Ok(sanitize_discovered(selected, request.max_documents))
    }
}

/// Drops documents whose URL does not parse, keeps the first of each URL, and caps the list.
pub fn sanitize_discovered(
    documents: Vec<DiscoveredDocument>,
    max_documents: usize,
) -> Vec<DiscoveredDocument> {
    let mut seen = HashSet::new();
    documents
        .into_iter()
        .filter(|document| match Url::parse(&document.url) {
            Ok(_) => true,
            Err(error) => {
                warn!(url = %document.url, %error, "skipping discovered document with invalid url");
                false
            }
        })
        .filter(|document| seen.insert(document.url.clone()))
        .take(max_documents)
        .collect()
}
