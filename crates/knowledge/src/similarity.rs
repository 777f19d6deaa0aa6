//! Cosine ranking over in-memory candidates. Linear scan; the corpus is small.

use serde::Serialize;

/// A candidate paired with its similarity to the query.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScoredMatch<T> {
    pub item: T,
    pub score: f32,
}

/// Cosine similarity in `[-1, 1]`.
///
/// Returns `0.0` when either vector has zero norm, the lengths differ, or a
/// non-finite component makes the score undefined.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let score = dot / (norm_a.sqrt() * norm_b.sqrt());
    if !score.is_finite() {
        return 0.0;
    }
    score.clamp(-1.0, 1.0) as f32
}

/// Scores every candidate against `query`, best first.
///
/// The sort is stable, so equal scores keep their input order.
pub fn rank<T, V>(query: &[f32], candidates: impl IntoIterator<Item = (T, V)>) -> Vec<ScoredMatch<T>>
where
    V: AsRef<[f32]>,
{
    let mut scored: Vec<ScoredMatch<T>> = candidates
        .into_iter()
        .map(|(item, vector)| ScoredMatch {
            score: cosine_similarity(query, vector.as_ref()),
            item,
        })
        .collect();
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored
}

/// Keeps the first `k` entries of an already ranked list.
pub fn top_k<T>(mut ranked: Vec<ScoredMatch<T>>, k: usize) -> Vec<ScoredMatch<T>> {
    ranked.truncate(k);
    ranked
}
