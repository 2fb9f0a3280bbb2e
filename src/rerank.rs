//! Optional second-stage reranking of retrieval candidates.
//!
//! A [`RelevanceModel`] scores the query against candidate texts; the
//! blended score keeps part of the original retrieval signal so the
//! model refines the order rather than replacing it. Reranking never
//! adds documents and never fails a search: a broken model degrades to
//! the unreranked top results.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::{RerankBackendKind, RerankConfig};
use crate::models::RetrievedChunk;

/// Share of the blended score taken from the relevance model; the rest
/// comes from the retrieval combined score.
const MODEL_WEIGHT: f64 = 0.7;
const RETRIEVAL_WEIGHT: f64 = 0.3;

pub trait RelevanceModel: Send + Sync {
    fn name(&self) -> &str;
    /// Scores each document against the query. Higher is more relevant;
    /// scale is model-defined (normalized before blending).
    fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f64>>;
}

pub enum Reranker {
    Disabled,
    Model(Box<dyn RelevanceModel>),
}

static RERANK_FAILURE_LOGGED: AtomicBool = AtomicBool::new(false);

impl Reranker {
    pub fn from_config(config: &RerankConfig) -> Self {
        match config.backend {
            RerankBackendKind::Disabled => Reranker::Disabled,
            RerankBackendKind::Bm25 => {
                Reranker::Model(Box::new(Bm25Model::new(config.k1, config.b)))
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Reranker::Disabled)
    }

    /// Reorders `candidates` and trims to `final_k`. Pass-through when
    /// disabled or when there is nothing to reorder.
    pub fn rerank(
        &self,
        query: &str,
        mut candidates: Vec<RetrievedChunk>,
        final_k: usize,
    ) -> Vec<RetrievedChunk> {
        let model = match self {
            Reranker::Disabled => {
                candidates.truncate(final_k);
                return candidates;
            }
            Reranker::Model(model) => model,
        };
        if candidates.len() <= final_k {
            return candidates;
        }

        let documents: Vec<String> = candidates.iter().map(|c| c.content.clone()).collect();
        let model_scores = match model.score(query, &documents) {
            Ok(scores) if scores.len() == documents.len() => scores,
            Ok(scores) => {
                warn_once(model.name(), &format!("returned {} scores for {} documents", scores.len(), documents.len()));
                candidates.truncate(final_k);
                return candidates;
            }
            Err(e) => {
                warn_once(model.name(), &e.to_string());
                candidates.truncate(final_k);
                return candidates;
            }
        };

        let max = model_scores.iter().fold(f64::MIN, |a, &b| a.max(b));
        let mut scored: Vec<(usize, RetrievedChunk)> =
            candidates.into_iter().enumerate().collect();
        for (i, chunk) in &mut scored {
            let norm = if max > f64::EPSILON {
                model_scores[*i] / max
            } else {
                0.0
            };
            chunk.score = MODEL_WEIGHT * norm + RETRIEVAL_WEIGHT * chunk.score;
        }

        scored.sort_by(|a, b| b.1.score.total_cmp(&a.1.score).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(final_k);
        scored.into_iter().map(|(_, c)| c).collect()
    }
}

fn warn_once(model: &str, reason: &str) {
    if !RERANK_FAILURE_LOGGED.swap(true, Ordering::Relaxed) {
        tracing::warn!(model, reason, "reranker unavailable, serving unreranked results");
    }
}

// ============ BM25 ============

/// BM25 over the candidate set itself: document frequencies come from
/// the candidates, not a global corpus, which is enough to reorder a
/// few dozen chunks.
pub struct Bm25Model {
    k1: f64,
    b: f64,
}

impl Bm25Model {
    pub fn new(k1: f64, b: f64) -> Self {
        Self { k1, b }
    }
}

impl RelevanceModel for Bm25Model {
    fn name(&self) -> &str {
        "bm25"
    }

    fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f64>> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() || documents.is_empty() {
            return Ok(vec![0.0; documents.len()]);
        }

        let docs: Vec<Vec<String>> = documents.iter().map(|d| tokenize(d)).collect();
        let n = docs.len() as f64;
        let avg_len = docs.iter().map(|d| d.len() as f64).sum::<f64>() / n;

        // Document frequency per query term.
        let mut df: HashMap<&str, f64> = HashMap::new();
        for term in &query_terms {
            let count = docs
                .iter()
                .filter(|doc| doc.iter().any(|w| w == term))
                .count() as f64;
            df.insert(term.as_str(), count);
        }

        let scores = docs
            .iter()
            .map(|doc| {
                let len = doc.len() as f64;
                query_terms
                    .iter()
                    .map(|term| {
                        let tf = doc.iter().filter(|w| *w == term).count() as f64;
                        if tf == 0.0 {
                            return 0.0;
                        }
                        let df = df[term.as_str()];
                        let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                        let denom = tf
                            + self.k1 * (1.0 - self.b + self.b * len / avg_len.max(f64::EPSILON));
                        idf * tf * (self.k1 + 1.0) / denom
                    })
                    .sum()
            })
            .collect();
        Ok(scores)
    }
}

/// Lowercase alphanumeric tokens, two characters or longer.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkMeta, RetrievalKind};
    use std::collections::HashSet;

    fn ids(results: &[RetrievedChunk]) -> HashSet<String> {
        results.iter().map(|c| c.chunk_id.clone()).collect()
    }

    fn chunk(id: &str, content: &str, score: f64) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: id.to_string(),
            message_key: format!("msg-{id}"),
            content: content.to_string(),
            meta: ChunkMeta {
                sender: "s".into(),
                subject: "t".into(),
                date: "d".into(),
                folder: "INBOX".into(),
                quality_overall: 50.0,
            },
            score,
            retrieval: RetrievalKind::Hybrid,
        }
    }

    fn bm25() -> Reranker {
        Reranker::Model(Box::new(Bm25Model::new(1.5, 0.75)))
    }

    struct FailingModel;
    impl RelevanceModel for FailingModel {
        fn name(&self) -> &str {
            "failing"
        }
        fn score(&self, _query: &str, _documents: &[String]) -> Result<Vec<f64>> {
            anyhow::bail!("model unavailable")
        }
    }

    #[test]
    fn disabled_is_passthrough_truncation() {
        let candidates = vec![
            chunk("a", "first", 0.9),
            chunk("b", "second", 0.8),
            chunk("c", "third", 0.7),
        ];
        let out = Reranker::Disabled.rerank("q", candidates, 2);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].chunk_id, "a");
        assert_eq!(out[1].chunk_id, "b");
    }

    #[test]
    fn small_candidate_sets_are_untouched() {
        let candidates = vec![chunk("a", "first", 0.9), chunk("b", "second", 0.8)];
        let out = bm25().rerank("second", candidates, 5);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].chunk_id, "a");
        assert_eq!(out[0].score, 0.9);
    }

    #[test]
    fn rerank_never_adds_documents() {
        let candidates: Vec<RetrievedChunk> = (0..6)
            .map(|i| chunk(&format!("c{i}"), "budget review meeting notes", 0.5))
            .collect();
        let before = ids(&candidates);
        let out = bm25().rerank("budget", candidates, 3);
        assert_eq!(out.len(), 3);
        assert!(ids(&out).is_subset(&before));
    }

    #[test]
    fn bm25_promotes_term_matches() {
        let candidates = vec![
            chunk("noise", "lunch plans for tuesday afternoon", 0.6),
            chunk("hit", "the quarterly budget forecast and budget risks", 0.5),
            chunk("other", "weekend hiking photos attached", 0.55),
        ];
        let out = bm25().rerank("budget forecast", candidates, 2);
        assert_eq!(out[0].chunk_id, "hit");
    }

    #[test]
    fn blend_keeps_retrieval_signal() {
        // Both documents match equally; the retrieval score decides.
        let candidates = vec![
            chunk("low", "shipping schedule update", 0.2),
            chunk("high", "shipping schedule update", 0.9),
            chunk("zero", "unrelated content entirely", 0.1),
        ];
        let out = bm25().rerank("shipping schedule", candidates, 2);
        assert_eq!(out[0].chunk_id, "high");
        assert_eq!(out[1].chunk_id, "low");
    }

    #[test]
    fn model_failure_falls_back_to_retrieval_order() {
        let candidates = vec![
            chunk("a", "first", 0.9),
            chunk("b", "second", 0.8),
            chunk("c", "third", 0.7),
        ];
        let reranker = Reranker::Model(Box::new(FailingModel));
        let out = reranker.rerank("q", candidates, 2);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].chunk_id, "a");
        assert_eq!(out[1].chunk_id, "b");
    }

    #[test]
    fn bm25_scores_shape() {
        let model = Bm25Model::new(1.5, 0.75);
        let docs = vec![
            "alpha beta gamma".to_string(),
            "alpha alpha alpha".to_string(),
            "delta epsilon".to_string(),
        ];
        let scores = model.score("alpha", &docs).unwrap();
        assert_eq!(scores.len(), 3);
        assert!(scores[1] > scores[0]);
        assert_eq!(scores[2], 0.0);

        let empty = model.score("??", &docs).unwrap();
        assert_eq!(empty, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn tokenizer_drops_short_tokens() {
        assert_eq!(tokenize("A b3 CD-ef"), vec!["b3", "cd", "ef"]);
    }
}
