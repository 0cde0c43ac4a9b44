use crate::batcher::{BatchOptions, MAX_EMBEDDING_BATCH};
use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use std::time::Duration;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 1024;
pub const DEFAULT_CANDIDATE_CAP: usize = 500;
pub const DEFAULT_UPSERT_BATCH_SIZE: usize = 100;

/// Every tunable of the pipeline and the search path, with production defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub discovery_url: Option<String>,
    pub extraction_url: Option<String>,
    pub extraction_api_key: Option<String>,
    pub extraction_timeout: Duration,
    pub embedding_url: String,
    pub embedding_api_key: Option<String>,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub embedding_batch_size: usize,
    pub inter_batch_delay: Duration,
    pub qdrant_url: String,
    pub qdrant_collection: String,
    pub qdrant_api_key: Option<String>,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub upsert_batch_size: usize,
    pub candidate_cap: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            discovery_url: None,
            extraction_url: None,
            extraction_api_key: None,
            extraction_timeout: Duration::from_secs(600),
            embedding_url: "https://api.voyageai.com/v1".to_string(),
            embedding_api_key: None,
            embedding_model: "voyage-3".to_string(),
            embedding_dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
            embedding_batch_size: MAX_EMBEDDING_BATCH,
            inter_batch_delay: Duration::from_millis(250),
            qdrant_url: "http://localhost:6333".to_string(),
            qdrant_collection: "zoning_chunks".to_string(),
            qdrant_api_key: None,
            request_timeout: Duration::from_secs(60),
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            upsert_batch_size: DEFAULT_UPSERT_BATCH_SIZE,
            candidate_cap: DEFAULT_CANDIDATE_CAP,
        }
    }
}

impl Settings {
    /// Checks everything a pipeline run needs before a single request goes out.
    pub fn validate_for_pipeline(&self) -> Result<(), ConfigError> {
        require(&self.extraction_url, "EXTRACTION_URL")?;
        require(&self.extraction_api_key, "EXTRACTION_API_KEY")?;
        self.validate_for_search()?;
        if self.upsert_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "UPSERT_BATCH_SIZE",
                details: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn validate_for_search(&self) -> Result<(), ConfigError> {
        require(&self.embedding_api_key, "EMBEDDING_API_KEY")?;
        if self.embedding_dimensions == 0 {
            return Err(ConfigError::InvalidValue {
                key: "EMBEDDING_DIMENSIONS",
                details: "must be greater than zero".to_string(),
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_ATTEMPTS",
                details: "at least one attempt is required".to_string(),
            });
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.retry_base_delay)
    }

    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            batch_size: self.embedding_batch_size.clamp(1, MAX_EMBEDDING_BATCH),
            inter_batch_delay: self.inter_batch_delay,
            retry: self.retry_policy(),
        }
    }
}

fn require(value: &Option<String>, key: &'static str) -> Result<(), ConfigError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(()),
        _ => Err(ConfigError::MissingCredential(key)),
    }
}
