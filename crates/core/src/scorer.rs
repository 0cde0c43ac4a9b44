use crate::models::{SearchHit, StoredChunk};
use crate::quantize::widen;

/// Cosine similarity in `[-1, 1]`. Empty, mismatched or zero-magnitude inputs score 0.
pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.is_empty() || left.len() != right.len() {
        return 0.0;
    }

    let (dot, left_norm, right_norm) = left.iter().zip(right.iter()).fold(
        (0f64, 0f64, 0f64),
        |(dot, left_norm, right_norm), (a, b)| {
            let (a, b) = (f64::from(*a), f64::from(*b));
            (dot + a * b, left_norm + a * a, right_norm + b * b)
        },
    );

    let magnitude = left_norm.sqrt() * right_norm.sqrt();
    if magnitude == 0.0 || !magnitude.is_finite() {
        return 0.0;
    }

    let similarity = dot / magnitude;
    if similarity.is_finite() {
        similarity.clamp(-1.0, 1.0) as f32
    } else {
        0.0
    }
}

/// Scores every candidate against `query`, keeps those at or above `min_score`, and returns
/// at most `limit` hits, best first. Equal scores keep candidate order. Stored vectors are
/// dropped from the output.
pub fn rank_candidates(
    query: &[f32],
    candidates: Vec<StoredChunk>,
    limit: usize,
    min_score: f32,
) -> Vec<SearchHit> {
    let mut hits: Vec<SearchHit> = candidates
        .into_iter()
        .filter_map(|candidate| {
            let stored = candidate.embedding.as_deref().filter(|vector| !vector.is_empty())?;
            let score = cosine_similarity(query, &widen(stored));
            (score >= min_score).then_some(SearchHit {
                chunk: candidate.chunk,
                metadata: candidate.metadata,
                score,
            })
        })
        .collect();

    hits.sort_by(|left, right| right.score.total_cmp(&left.score));
    hits.truncate(limit);
    hits
}
