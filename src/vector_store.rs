//! In-memory nearest-neighbour store over embedded chunks.
//!
//! The searchable set lives in an immutable [`Snapshot`] behind an `Arc`.
//! `load` builds a new snapshot and swaps the pointer, so a search that
//! started before the swap finishes against the generation it began with.

use crate::chunking::Chunk;
use crate::error::{AdvisorError, AdvisorResult};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};

const EPSILON: f32 = 1e-8;

/// One generation of searchable chunks
#[derive(Debug, Default)]
pub struct Snapshot {
    generation: u64,
    chunks: Vec<Chunk>,
}

impl Snapshot {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Rank every chunk against `query` and keep the best `k`
    pub fn search(&self, query: &[f32], k: usize) -> AdvisorResult<Vec<ScoredChunk>> {
        if k == 0 {
            return Err(AdvisorError::validation("k must be at least 1"));
        }

        let mut scored: Vec<(usize, f32)> = self
            .chunks
            .iter()
            .enumerate()
            .map(|(idx, chunk)| (idx, cosine_similarity(query, &chunk.embedding)))
            .collect();

        // sort_by is stable: equal scores keep ingestion order
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(idx, score)| ScoredChunk {
                chunk: self.chunks[idx].clone(),
                score,
            })
            .collect())
    }
}

/// A retrieved chunk with its similarity to the query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Holds the current snapshot and swaps it atomically
#[derive(Debug, Default)]
pub struct VectorStore {
    current: RwLock<Arc<Snapshot>>,
}

impl VectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole searchable set, returning the new generation.
    ///
    /// Not additive: callers that want to grow the set pass the union.
    pub fn load(&self, chunks: Vec<Chunk>) -> u64 {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let generation = current.generation + 1;
        *current = Arc::new(Snapshot { generation, chunks });
        generation
    }

    /// The snapshot searches currently run against
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Top-`k` chunks by cosine similarity, best first
    pub fn search(&self, query: &[f32], k: usize) -> AdvisorResult<Vec<ScoredChunk>> {
        self.snapshot().search(query, k)
    }

    pub fn len(&self) -> usize {
        self.snapshot().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().generation
    }
}

/// `dot(a, b) / (|a| * |b| + ε)`; zero vectors score 0 instead of NaN
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    dot / (norm_a * norm_b + EPSILON)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, embedding: Vec<f32>) -> Chunk {
        Chunk {
            id: id.to_string(),
            source: "test".to_string(),
            offset: 0,
            text: format!("text of {id}"),
            embedding,
        }
    }

    fn ids(results: &[ScoredChunk]) -> Vec<&str> {
        results.iter().map(|r| r.chunk.id.as_str()).collect()
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-2.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_identical_vector_ranks_first() {
        let store = VectorStore::new();
        store.load(vec![
            chunk("a", vec![0.1, 0.9, 0.0]),
            chunk("b", vec![0.7, 0.2, 0.1]),
            chunk("c", vec![0.0, 0.3, 0.9]),
        ]);

        let results = store.search(&[0.7, 0.2, 0.1], 1).unwrap();
        assert_eq!(ids(&results), vec!["b"]);
        assert!(results[0].score > 0.99);
    }

    #[test]
    fn test_results_descending_with_stable_ties() {
        let store = VectorStore::new();
        store.load(vec![
            chunk("low", vec![0.0, 1.0]),
            chunk("tie-1", vec![1.0, 1.0]),
            chunk("best", vec![1.0, 0.0]),
            chunk("tie-2", vec![2.0, 2.0]),
        ]);

        let results = store.search(&[1.0, 0.0], 4).unwrap();
        assert_eq!(ids(&results), vec!["best", "tie-1", "tie-2", "low"]);
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_nan_scores_do_not_break_ranking() {
        let store = VectorStore::new();
        store.load(vec![
            chunk("nan", vec![f32::NAN, 1.0]),
            chunk("best", vec![1.0, 0.0]),
            chunk("other", vec![0.0, 1.0]),
        ]);

        let results = store.search(&[1.0, 0.0], 3).unwrap();
        assert_eq!(results.len(), 3);
        let finite: Vec<&str> = results
            .iter()
            .filter(|r| !r.score.is_nan())
            .map(|r| r.chunk.id.as_str())
            .collect();
        assert_eq!(finite, vec!["best", "other"]);

        assert_eq!(store.search(&[f32::NAN, 0.0], 2).unwrap().len(), 2);
    }

    #[test]
    fn test_k_larger_than_store_returns_all() {
        let store = VectorStore::new();
        store.load(vec![chunk("a", vec![1.0]), chunk("b", vec![0.5])]);
        assert_eq!(store.search(&[1.0], 6).unwrap().len(), 2);
        assert!(VectorStore::new().search(&[1.0], 6).unwrap().is_empty());
    }

    #[test]
    fn test_zero_k_rejected() {
        let store = VectorStore::new();
        assert!(matches!(
            store.search(&[1.0], 0),
            Err(AdvisorError::Validation(_))
        ));
    }

    #[test]
    fn test_load_replaces_instead_of_appending() {
        let store = VectorStore::new();
        assert_eq!(store.generation(), 0);
        assert_eq!(store.load(vec![chunk("old", vec![1.0])]), 1);
        assert_eq!(store.load(vec![chunk("new", vec![1.0])]), 2);

        let results = store.search(&[1.0], 10).unwrap();
        assert_eq!(ids(&results), vec!["new"]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_held_snapshot_unaffected_by_reload() {
        let store = VectorStore::new();
        store.load(vec![chunk("first", vec![1.0]), chunk("second", vec![1.0])]);
        let held = store.snapshot();

        store.load(Vec::new());

        assert_eq!(held.generation(), 1);
        assert_eq!(held.search(&[1.0], 5).unwrap().len(), 2);
        assert!(store.is_empty());
    }
}
