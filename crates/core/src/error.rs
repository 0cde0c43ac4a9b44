use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required credential: {0}")]
    MissingCredential(&'static str),

    #[error("invalid value for {key}: {details}")]
    InvalidValue { key: &'static str, details: String },
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{service} returned {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("{service} call timed out")]
    Timeout { service: &'static str },

    #[error("{service} transport error: {source}")]
    Transport {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{service} returned a malformed response: {details}")]
    Malformed {
        service: &'static str,
        details: String,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ServiceError {
    pub fn from_reqwest(service: &'static str, error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout { service }
        } else {
            Self::Transport {
                service,
                source: error,
            }
        }
    }

    /// Rate limiting, server-side failures and dropped connections are worth another attempt.
    /// Timeouts are not: a call that exceeded its bound is reported as a stage failure.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Transport { source, .. } => source.is_connect() || source.is_request(),
            Self::Timeout { .. } | Self::Malformed { .. } | Self::InvalidRequest(_) => false,
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid stored document: {0}")]
    InvalidDocument(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Service(error) if error.is_transient())
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("query embedding failed: {0}")]
    Embedding(#[from] ServiceError),

    #[error("store query failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("discovery failed: {0}")]
    Discovery(#[source] ServiceError),

    #[error("extraction failed for {url}: {source}")]
    Extraction {
        url: String,
        #[source]
        source: ServiceError,
    },

    #[error("embedding failed: {0}")]
    Embedding(#[source] ServiceError),

    #[error("upsert failed: {0}")]
    Store(#[source] StoreError),

    #[error("illegal job transition from {from} to {to}")]
    InvalidTransition {
        from: crate::models::PipelineStatus,
        to: crate::models::PipelineStatus,
    },
}
