use crate::error::SearchError;
use crate::models::{CandidateFilter, SearchHit, SearchRequest};
use crate::retry::{retry_transient, RetryPolicy};
use crate::traits::{ChunkStore, EmbeddingClient, InputType};
use regex::{Captures, Regex};
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use tracing::info;

/// Zoning abbreviations and the designation appended after them before a query is embedded.
pub const QUERY_SYNONYMS: &[(&str, &str)] = &[
    ("R-1", "Single-Family Residential"),
    ("R-2", "Two-Family Residential"),
    ("R-3", "Multi-Family Residential"),
    ("R-4", "High-Density Residential"),
    ("C-1", "Neighborhood Commercial"),
    ("C-2", "General Commercial"),
    ("C-3", "Central Business District"),
    ("M-1", "Light Industrial"),
    ("M-2", "Heavy Industrial"),
    ("I-1", "Light Industrial"),
    ("AG", "Agricultural"),
    ("PUD", "Planned Unit Development"),
    ("CUP", "Conditional Use Permit"),
    ("SUP", "Special Use Permit"),
    ("ZBA", "Zoning Board of Appeals"),
    ("BZA", "Board of Zoning Appeals"),
    ("FAR", "Floor Area Ratio"),
    ("ADU", "Accessory Dwelling Unit"),
    ("ROW", "Right-of-Way"),
];

fn synonym_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    CELL.get_or_init(|| {
        let alternation = QUERY_SYNONYMS
            .iter()
            .map(|(code, _)| regex::escape(code))
            .collect::<Vec<_>>()
            .join("|");
        Regex::new(&format!(r"(?i)\b(?:{alternation})\b")).expect("synonym pattern compiles")
    })
}

/// Whole-word, case-insensitive expansion of known abbreviations. The abbreviation itself is
/// kept so exact-code mentions in documents still match.
pub fn expand_query(query: &str) -> String {
    synonym_pattern()
        .replace_all(query, |captures: &Captures<'_>| {
            let matched = &captures[0];
            match QUERY_SYNONYMS
                .iter()
                .find(|(code, _)| code.eq_ignore_ascii_case(matched))
            {
                Some((_, designation)) => format!("{matched} {designation}"),
                None => matched.to_string(),
            }
        })
        .into_owned()
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearchOutcome {
    pub query: String,
    pub expanded_query: String,
    pub results: Vec<SearchHit>,
}

/// Read path: enrich the query, embed it, and rank the capped candidate set.
pub struct SearchService<E: ?Sized, S: ?Sized> {
    embedder: Arc<E>,
    store: Arc<S>,
    candidate_cap: usize,
    retry: RetryPolicy,
}

impl<E, S> SearchService<E, S>
where
    E: EmbeddingClient + ?Sized,
    S: ChunkStore + ?Sized,
{
    pub fn new(embedder: Arc<E>, store: Arc<S>, candidate_cap: usize, retry: RetryPolicy) -> Self {
        Self {
            embedder,
            store,
            candidate_cap,
            retry,
        }
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchOutcome, SearchError> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(SearchError::InvalidQuery("query is empty".to_string()));
        }
        if !request.min_score.is_finite() {
            return Err(SearchError::InvalidQuery(
                "minScore must be a finite number".to_string(),
            ));
        }

        let expanded_query = expand_query(query);
        let inputs = vec![expanded_query.clone()];
        let embedded = retry_transient(&self.retry, "embed query", || {
            self.embedder.embed(&inputs, InputType::Query)
        })
        .await?;
        let query_vector = embedded.vectors.into_iter().next().ok_or_else(|| {
            SearchError::Embedding(crate::ServiceError::Malformed {
                service: "embedding",
                details: "no vector returned for query".to_string(),
            })
        })?;

        let filter = CandidateFilter {
            file_numbers: request.case_numbers.clone(),
        };
        let results = if request.limit == 0 {
            Vec::new()
        } else {
            retry_transient(&self.retry, "fetch candidates", || {
                self.store.search(
                    &query_vector,
                    &filter,
                    self.candidate_cap,
                    request.limit,
                    request.min_score,
                )
            })
            .await?
        };

        info!(
            query,
            expanded = %expanded_query,
            hits = results.len(),
            "search finished"
        );

        Ok(SearchOutcome {
            query: query.to_string(),
            expanded_query,
            results,
        })
    }
}
