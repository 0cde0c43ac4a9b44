use anyhow::{bail, Context};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use zoning_search_core::{
    summary_message, ActionDispatcher, ApiResponse, ChunkStore, DiscoveredDocument,
    DiscoveryRequest, DiscoverySource, EmbeddingClient, ExtractionEndpointConfig,
    HttpDiscoveryClient, HttpEmbeddingClient, HttpExtractionClient, MemoryChunkStore,
    PipelineOptions, PipelineOrchestrator, PipelineStatus, QdrantChunkStore, SearchRequest,
    SearchService, Settings, StaticDiscovery,
};

type Dispatcher = ActionDispatcher<
    Box<dyn DiscoverySource>,
    HttpExtractionClient,
    dyn EmbeddingClient,
    dyn ChunkStore,
>;

#[derive(Parser)]
#[command(name = "zoning-search", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Document discovery service endpoint.
    #[arg(long, global = true, env = "DISCOVERY_URL")]
    discovery_url: Option<String>,

    /// Layout extraction service endpoint.
    #[arg(long, global = true, env = "EXTRACTION_URL")]
    extraction_url: Option<String>,

    /// Layout extraction service API key.
    #[arg(long, global = true, env = "EXTRACTION_API_KEY", hide_env_values = true)]
    extraction_api_key: Option<String>,

    /// Seconds a single extraction call may take.
    #[arg(long, global = true, env = "EXTRACTION_TIMEOUT_SECS", default_value_t = 600)]
    extraction_timeout_secs: u64,

    /// Embedding service base URL.
    #[arg(long, global = true, env = "EMBEDDING_URL", default_value = "https://api.voyageai.com/v1")]
    embedding_url: String,

    /// Embedding service API key.
    #[arg(long, global = true, env = "EMBEDDING_API_KEY", hide_env_values = true)]
    embedding_api_key: Option<String>,

    /// Embedding model.
    #[arg(long, global = true, env = "EMBEDDING_MODEL", default_value = "voyage-3")]
    embedding_model: String,

    /// Embedding dimensionality.
    #[arg(long, global = true, env = "EMBEDDING_DIMENSIONS", default_value_t = 1024)]
    embedding_dimensions: usize,

    /// Chunks per embedding call.
    #[arg(long, global = true, env = "EMBEDDING_BATCH_SIZE", default_value_t = 128)]
    embedding_batch_size: usize,

    /// Pause between embedding calls, in milliseconds.
    #[arg(long, global = true, env = "EMBEDDING_BATCH_DELAY_MS", default_value_t = 250)]
    embedding_batch_delay_ms: u64,

    /// Chunk storage backend.
    #[arg(long, global = true, value_enum, env = "CHUNK_STORE", default_value_t = StoreKind::Qdrant)]
    store: StoreKind,

    /// Qdrant base URL.
    #[arg(long, global = true, env = "QDRANT_URL", default_value = "http://localhost:6333")]
    qdrant_url: String,

    /// Qdrant collection.
    #[arg(long, global = true, env = "QDRANT_COLLECTION", default_value = "zoning_chunks")]
    qdrant_collection: String,

    /// Qdrant API key.
    #[arg(long, global = true, env = "QDRANT_API_KEY", hide_env_values = true)]
    qdrant_api_key: Option<String>,

    /// Seconds any other upstream call may take.
    #[arg(long, global = true, env = "REQUEST_TIMEOUT_SECS", default_value_t = 60)]
    request_timeout_secs: u64,

    /// Attempts per upstream call on transient failures.
    #[arg(long, global = true, env = "MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    /// First retry delay in milliseconds, doubled on each further attempt.
    #[arg(long, global = true, env = "RETRY_BASE_DELAY_MS", default_value_t = 500)]
    retry_base_delay_ms: u64,

    /// Chunks per storage upsert call.
    #[arg(long, global = true, env = "UPSERT_BATCH_SIZE", default_value_t = 100)]
    upsert_batch_size: usize,

    /// Most stored chunks scored per query.
    #[arg(long, global = true, env = "CANDIDATE_CAP", default_value_t = 500)]
    candidate_cap: usize,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    Qdrant,
    Memory,
}

#[derive(Subcommand)]
enum Command {
    /// Discover, extract, embed and store documents, then print the finished job.
    Run {
        /// Restrict discovery to these case numbers.
        #[arg(long = "case-number")]
        case_numbers: Vec<String>,
        /// Free-text discovery terms.
        #[arg(long = "search-term")]
        search_terms: Vec<String>,
        /// Most documents to process.
        #[arg(long, default_value_t = 10)]
        max_documents: usize,
        /// Process a known document instead of asking the discovery service (CASE=URL).
        #[arg(long = "document", value_parser = parse_document)]
        documents: Vec<DiscoveredDocument>,
    },
    /// Rank stored chunks against a free-text query.
    Search {
        /// Query text.
        #[arg(long)]
        query: String,
        /// Restrict results to these case numbers.
        #[arg(long = "case-number")]
        case_numbers: Vec<String>,
        /// Number of results to return.
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Lowest similarity to return.
        #[arg(long, default_value_t = 0.5)]
        min_score: f32,
    },
    /// Serve the action endpoint at `POST /api/pipeline`.
    Serve {
        /// Address to bind (host:port).
        #[arg(long, env = "BIND_ADDRESS", default_value = "127.0.0.1:8080")]
        bind: String,
    },
}

impl Cli {
    fn settings(&self) -> Settings {
        Settings {
            discovery_url: self.discovery_url.clone(),
            extraction_url: self.extraction_url.clone(),
            extraction_api_key: self.extraction_api_key.clone(),
            extraction_timeout: Duration::from_secs(self.extraction_timeout_secs),
            embedding_url: self.embedding_url.clone(),
            embedding_api_key: self.embedding_api_key.clone(),
            embedding_model: self.embedding_model.clone(),
            embedding_dimensions: self.embedding_dimensions,
            embedding_batch_size: self.embedding_batch_size,
            inter_batch_delay: Duration::from_millis(self.embedding_batch_delay_ms),
            qdrant_url: self.qdrant_url.clone(),
            qdrant_collection: self.qdrant_collection.clone(),
            qdrant_api_key: self.qdrant_api_key.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_attempts: self.max_attempts,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            upsert_batch_size: self.upsert_batch_size,
            candidate_cap: self.candidate_cap,
        }
    }
}

fn parse_document(raw: &str) -> Result<DiscoveredDocument, String> {
    let (case_number, url) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected CASE=URL, got {raw}"))?;
    Ok(DiscoveredDocument {
        url: url.trim().to_string(),
        title: String::new(),
        case_number: case_number.trim().to_string(),
        attachment_type: None,
        discovered_at: Utc::now(),
    })
}

fn build_embedder(settings: &Settings) -> anyhow::Result<Arc<dyn EmbeddingClient>> {
    let api_key = settings
        .embedding_api_key
        .clone()
        .context("EMBEDDING_API_KEY is not set")?;
    Ok(Arc::new(HttpEmbeddingClient::new(
        &settings.embedding_url,
        api_key,
        settings.embedding_model.clone(),
        settings.embedding_dimensions,
        settings.request_timeout,
    )))
}

fn build_store(settings: &Settings, kind: StoreKind) -> Arc<dyn ChunkStore> {
    match kind {
        StoreKind::Qdrant => Arc::new(QdrantChunkStore::new(
            settings.qdrant_url.clone(),
            settings.qdrant_collection.clone(),
            settings.embedding_dimensions,
            settings.qdrant_api_key.clone(),
            settings.request_timeout,
        )),
        StoreKind::Memory => Arc::new(MemoryChunkStore::new()),
    }
}

fn build_extractor(settings: &Settings) -> anyhow::Result<HttpExtractionClient> {
    Ok(HttpExtractionClient::new(ExtractionEndpointConfig {
        endpoint: settings
            .extraction_url
            .clone()
            .context("EXTRACTION_URL is not set")?,
        api_key: settings
            .extraction_api_key
            .clone()
            .context("EXTRACTION_API_KEY is not set")?,
        timeout: settings.extraction_timeout,
        retry: settings.retry_policy(),
    }))
}

fn build_discovery(
    settings: &Settings,
    documents: Vec<DiscoveredDocument>,
) -> Box<dyn DiscoverySource> {
    match (&settings.discovery_url, documents.is_empty()) {
        (_, false) => Box::new(StaticDiscovery::new(documents)),
        (Some(endpoint), true) => Box::new(HttpDiscoveryClient::new(
            endpoint.clone(),
            settings.request_timeout,
            settings.retry_policy(),
        )),
        (None, true) => {
            warn!("no DISCOVERY_URL and no explicit documents; runs will discover nothing");
            Box::new(StaticDiscovery::default())
        }
    }
}

fn build_pipeline(
    settings: &Settings,
    kind: StoreKind,
    documents: Vec<DiscoveredDocument>,
) -> anyhow::Result<(
    PipelineOrchestrator<Box<dyn DiscoverySource>, HttpExtractionClient, dyn EmbeddingClient, dyn ChunkStore>,
    Arc<dyn EmbeddingClient>,
    Arc<dyn ChunkStore>,
)> {
    let embedder = build_embedder(settings)?;
    let store = build_store(settings, kind);
    let pipeline = PipelineOrchestrator::new(
        build_discovery(settings, documents),
        build_extractor(settings)?,
        embedder.clone(),
        store.clone(),
        PipelineOptions::from_settings(settings),
    );
    Ok((pipeline, embedder, store))
}

async fn handle_action(
    State(dispatcher): State<Arc<Dispatcher>>,
    body: Result<Json<Value>, JsonRejection>,
) -> (StatusCode, Json<ApiResponse>) {
    match body {
        Ok(Json(body)) => (StatusCode::OK, Json(dispatcher.dispatch_json(body).await)),
        Err(rejection) => (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::failure(rejection.body_text(), Instant::now())),
        ),
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let settings = cli.settings();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "zoning-search boot"
    );

    match cli.command {
        Command::Run {
            case_numbers,
            search_terms,
            max_documents,
            documents,
        } => {
            settings.validate_for_pipeline()?;
            let (pipeline, _, _) = build_pipeline(&settings, cli.store, documents)?;
            let request = DiscoveryRequest {
                case_numbers,
                search_terms,
                max_documents,
            };

            let job = pipeline.run(&request).await;
            let message = summary_message(&job);
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "job": &job, "message": &message }))?
            );
            if job.status == PipelineStatus::Failed {
                bail!(message);
            }
        }
        Command::Search {
            query,
            case_numbers,
            limit,
            min_score,
        } => {
            settings.validate_for_search()?;
            let service = SearchService::new(
                build_embedder(&settings)?,
                build_store(&settings, cli.store),
                settings.candidate_cap,
                settings.retry_policy(),
            );
            let outcome = service
                .search(&SearchRequest {
                    query,
                    case_numbers,
                    limit,
                    min_score,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Serve { bind } => {
            settings.validate_for_pipeline()?;
            let (pipeline, embedder, store) = build_pipeline(&settings, cli.store, Vec::new())?;
            let search = SearchService::new(
                embedder,
                store,
                settings.candidate_cap,
                settings.retry_policy(),
            );
            let dispatcher: Arc<Dispatcher> = Arc::new(ActionDispatcher::new(pipeline, search));

            let app = Router::new()
                .route("/api/pipeline", post(handle_action))
                .with_state(dispatcher);
            let addr: SocketAddr = bind
                .parse()
                .with_context(|| format!("invalid bind address {bind}"))?;
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            info!(%addr, "action endpoint listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .context("server shutdown")?;
        }
    }

    Ok(())
}
