use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Width of the nominal US Letter page in PDF points.
pub const PAGE_WIDTH_POINTS: f32 = 612.0;
/// Height of the nominal US Letter page in PDF points.
pub const PAGE_HEIGHT_POINTS: f32 = 792.0;

/// Rectangle on a source page, in PDF point units.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Sentinel for "somewhere on this page": used when the extractor reports no geometry.
    pub const FULL_PAGE: BoundingBox = BoundingBox {
        left: 0.0,
        top: 0.0,
        width: PAGE_WIDTH_POINTS,
        height: PAGE_HEIGHT_POINTS,
    };

    pub fn is_full_page(&self) -> bool {
        *self == Self::FULL_PAGE
    }

    pub fn right(&self) -> f32 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.top + self.height
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        let left = self.left.min(other.left);
        let top = self.top.min(other.top);
        BoundingBox {
            left,
            top,
            width: self.right().max(other.right()) - left,
            height: self.bottom().max(other.bottom()) - top,
        }
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::FULL_PAGE
    }
}

/// One retrievable unit of extracted document text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub text: String,
    pub page_number: u32,
    pub bounding_box: BoundingBox,
    pub chunk_index: u32,
    pub file_number: String,
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default)]
    pub table_detected: bool,
}

impl Chunk {
    pub fn dedup_key(&self) -> (&str, u32) {
        (&self.source_url, self.chunk_index)
    }
}

/// A candidate PDF reported by the discovery collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredDocument {
    pub url: String,
    #[serde(default)]
    pub title: String,
    pub case_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_type: Option<String>,
    #[serde(default = "Utc::now")]
    pub discovered_at: DateTime<Utc>,
}

/// Input to a discovery run.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryRequest {
    #[serde(default)]
    pub case_numbers: Vec<String>,
    #[serde(default)]
    pub search_terms: Vec<String>,
    pub max_documents: usize,
}

/// Storage-side bookkeeping attached to each persisted chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub embedded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_type: Option<String>,
}

/// A chunk as persisted: quantized vector plus the dimensionality it was produced with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredChunk {
    #[serde(flatten)]
    pub chunk: Chunk,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<i8>>,
    pub embedding_dimensions: usize,
    pub metadata: ChunkMetadata,
}

impl StoredChunk {
    pub fn is_searchable(&self) -> bool {
        self.embedding
            .as_ref()
            .is_some_and(|embedding| !embedding.is_empty())
    }
}

/// Result of one bulk upsert.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpsertCounts {
    pub inserted_count: usize,
    pub modified_count: usize,
}

impl UpsertCounts {
    pub fn total(&self) -> usize {
        self.inserted_count + self.modified_count
    }

    pub fn merge(&mut self, other: UpsertCounts) {
        self.inserted_count += other.inserted_count;
        self.modified_count += other.modified_count;
    }
}

/// Narrowing applied before similarity scoring.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CandidateFilter {
    /// Empty means every file number.
    #[serde(default)]
    pub file_numbers: Vec<String>,
}

impl CandidateFilter {
    pub fn admits(&self, file_number: &str) -> bool {
        self.file_numbers.is_empty() || self.file_numbers.iter().any(|item| item == file_number)
    }
}

/// A ranked hit. Carries the chunk and its metadata, never the stored vector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub chunk: Chunk,
    pub metadata: ChunkMetadata,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub case_numbers: Vec<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
}

fn default_limit() -> usize {
    10
}

fn default_min_score() -> f32 {
    0.5
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Pending,
    Discovering,
    Parsing,
    Embedding,
    Upserting,
    Completed,
    Failed,
}

impl PipelineStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Forward-only transitions. `Failed` is reachable from every non-terminal state;
    /// discovery and parsing may short-circuit to `Completed` when they produce nothing.
    pub fn can_advance_to(self, next: PipelineStatus) -> bool {
        use PipelineStatus::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Pending, Discovering)
            | (Discovering, Parsing)
            | (Discovering, Completed)
            | (Parsing, Embedding)
            | (Parsing, Completed)
            | (Embedding, Upserting)
            | (Upserting, Completed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Discovering => "discovering",
            Self::Parsing => "parsing",
            Self::Embedding => "embedding",
            Self::Upserting => "upserting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run-state of one pipeline invocation. Owned by the orchestrator for the duration of the
/// run and handed back to the caller; never shared between runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineJob {
    pub id: Uuid,
    pub status: PipelineStatus,
    pub discovered_pdfs: u64,
    pub parsed_chunks: u64,
    pub embedded_chunks: u64,
    pub upserted_chunks: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineJob {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            status: PipelineStatus::Pending,
            discovered_pdfs: 0,
            parsed_chunks: 0,
            embedded_chunks: 0,
            upserted_chunks: 0,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    pub fn advance(&mut self, next: PipelineStatus) -> Result<(), crate::PipelineError> {
        if !self.status.can_advance_to(next) {
            return Err(crate::PipelineError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Freezes the job at `Failed`, keeping whatever counters were already accumulated.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = PipelineStatus::Failed;
        self.error = Some(message.into());
        self.completed_at = Some(Utc::now());
    }
}

impl Default for PipelineJob {
    fn default() -> Self {
        Self::new()
    }
}
