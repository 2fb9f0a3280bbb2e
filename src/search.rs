//! Hybrid retrieval over the chunk index.
//!
//! Two channels feed the ranking: FTS5 keyword match (BM25) and cosine
//! similarity over stored embedding vectors. Each channel's scores are
//! normalized against that channel's own maximum, then fused with the
//! configured weights. A chunk present in only one channel contributes
//! zero from the missing side.

use anyhow::{bail, Result};
use sqlx::SqlitePool;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::embedding::{self, blob_to_vec, cosine_similarity, Embedder};
use crate::models::{ChunkMeta, RetrievalKind, RetrievedChunk};

/// Candidates fetched per channel, as a multiple of the requested count.
const CANDIDATE_FACTOR: usize = 2;

#[derive(Debug, Clone, Copy)]
pub struct FusionWeights {
    pub vector: f64,
    pub keyword: f64,
}

/// Querying an index with no content is a normal outcome, not an error.
#[derive(Debug)]
pub enum RetrievalOutcome {
    NotIndexed,
    Results(Vec<RetrievedChunk>),
}

#[derive(Debug, Clone)]
struct CandidateRow {
    id: String,
    message_key: String,
    content: String,
    sender: String,
    subject: String,
    date: String,
    folder: String,
    quality_overall: f64,
}

#[derive(Debug, Clone)]
struct ChannelHit {
    row: CandidateRow,
    score: f64,
}

/// Runs one retrieval with the given strategy, returning up to `limit`
/// fused results.
pub async fn retrieve(
    pool: &SqlitePool,
    embedder: Option<&dyn Embedder>,
    query: &str,
    strategy: RetrievalKind,
    limit: usize,
    weights: &FusionWeights,
) -> Result<RetrievalOutcome> {
    let chunk_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(pool)
        .await?;
    if chunk_count == 0 {
        return Ok(RetrievalOutcome::NotIndexed);
    }

    let fetch_k = limit.max(1) * CANDIDATE_FACTOR;

    let keyword = if strategy == RetrievalKind::Semantic {
        Vec::new()
    } else {
        keyword_candidates(pool, query, fetch_k).await?
    };

    let vector = match strategy {
        RetrievalKind::Keyword => Vec::new(),
        _ => match embedder {
            Some(embedder) => {
                let query_vec = embedding::embed_query(embedder, query).await?;
                vector_candidates(pool, &query_vec, fetch_k).await?
            }
            None if strategy == RetrievalKind::Semantic => {
                bail!("semantic search requires an embedding backend")
            }
            // Hybrid without an embedder degrades to the keyword channel.
            None => Vec::new(),
        },
    };

    let fused = fuse(vector, keyword, strategy, weights, limit);
    Ok(RetrievalOutcome::Results(fused))
}

/// Retrieval followed by reranking: fetches a wider candidate set
/// (2 × `top_k`), then lets the reranker trim it to `top_k`.
pub async fn retrieve_and_rerank(
    pool: &SqlitePool,
    embedder: Option<&dyn Embedder>,
    reranker: &crate::rerank::Reranker,
    query: &str,
    strategy: RetrievalKind,
    top_k: usize,
    weights: &FusionWeights,
) -> Result<RetrievalOutcome> {
    let candidates = retrieve(pool, embedder, query, strategy, top_k * 2, weights).await?;
    match candidates {
        RetrievalOutcome::NotIndexed => Ok(RetrievalOutcome::NotIndexed),
        RetrievalOutcome::Results(results) => Ok(RetrievalOutcome::Results(
            reranker.rerank(query, results, top_k),
        )),
    }
}

async fn keyword_candidates(
    pool: &SqlitePool,
    query: &str,
    fetch_k: usize,
) -> Result<Vec<ChannelHit>> {
    let Some(match_expr) = fts_match_expr(query) else {
        return Ok(Vec::new());
    };

    let rows: Vec<(String, String, String, String, String, String, String, f64, f64)> =
        sqlx::query_as(
            r#"
            SELECT c.id, c.message_key, c.content, c.sender, c.subject,
                   c.date, c.folder, c.quality_overall,
                   -chunks_fts.rank AS raw_score
            FROM chunks_fts
            JOIN chunks c ON c.id = chunks_fts.chunk_id
            WHERE chunks_fts MATCH ?
            ORDER BY chunks_fts.rank
            LIMIT ?
            "#,
        )
        .bind(&match_expr)
        .bind(fetch_k as i64)
        .fetch_all(pool)
        .await?;

    Ok(rows
        .into_iter()
        .map(
            |(id, message_key, content, sender, subject, date, folder, quality_overall, raw)| {
                ChannelHit {
                    row: CandidateRow {
                        id,
                        message_key,
                        content,
                        sender,
                        subject,
                        date,
                        folder,
                        quality_overall,
                    },
                    score: raw,
                }
            },
        )
        .collect())
}

async fn vector_candidates(
    pool: &SqlitePool,
    query_vec: &[f32],
    fetch_k: usize,
) -> Result<Vec<ChannelHit>> {
    let norm: f32 = query_vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm < f32::EPSILON {
        bail!("query embedded to a zero vector");
    }

    let rows: Vec<(String, String, String, String, String, String, String, f64, Vec<u8>)> =
        sqlx::query_as(
            r#"
            SELECT c.id, c.message_key, c.content, c.sender, c.subject,
                   c.date, c.folder, c.quality_overall, v.embedding
            FROM chunk_vectors v
            JOIN chunks c ON c.id = v.chunk_id
            "#,
        )
        .fetch_all(pool)
        .await?;

    let mut hits: Vec<ChannelHit> = rows
        .into_iter()
        .map(
            |(id, message_key, content, sender, subject, date, folder, quality_overall, blob)| {
                let similarity = cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64;
                ChannelHit {
                    row: CandidateRow {
                        id,
                        message_key,
                        content,
                        sender,
                        subject,
                        date,
                        folder,
                        quality_overall,
                    },
                    score: similarity,
                }
            },
        )
        .collect();

    hits.sort_by(|a, b| b.score.total_cmp(&a.score));
    hits.truncate(fetch_k);
    Ok(hits)
}

/// Builds an FTS5 MATCH expression from free text: each alphanumeric
/// token quoted, joined with OR. Returns `None` for queries with no
/// usable tokens.
fn fts_match_expr(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

struct FusedCandidate {
    row: CandidateRow,
    vector_norm: Option<f64>,
    vector_rank: Option<usize>,
    keyword_norm: Option<f64>,
}

/// Normalizes each channel against its own maximum, merges by chunk id,
/// and orders by the weighted combination. Ties go to the better vector
/// rank, then the higher-quality message, then the smaller chunk id so
/// the ordering is total.
fn fuse(
    vector: Vec<ChannelHit>,
    keyword: Vec<ChannelHit>,
    strategy: RetrievalKind,
    weights: &FusionWeights,
    limit: usize,
) -> Vec<RetrievedChunk> {
    let vector = normalize(vector);
    let keyword = normalize(keyword);

    let mut merged: HashMap<String, FusedCandidate> = HashMap::new();
    for (rank, hit) in vector.into_iter().enumerate() {
        merged.insert(
            hit.row.id.clone(),
            FusedCandidate {
                row: hit.row,
                vector_norm: Some(hit.score),
                vector_rank: Some(rank),
                keyword_norm: None,
            },
        );
    }
    for hit in keyword {
        let ChannelHit { row, score } = hit;
        match merged.entry(row.id.clone()) {
            Entry::Occupied(mut e) => e.get_mut().keyword_norm = Some(score),
            Entry::Vacant(e) => {
                e.insert(FusedCandidate {
                    row,
                    vector_norm: None,
                    vector_rank: None,
                    keyword_norm: Some(score),
                });
            }
        }
    }

    let mut scored: Vec<(FusedCandidate, f64)> = merged
        .into_values()
        .map(|c| {
            let v = c.vector_norm.unwrap_or(0.0);
            let k = c.keyword_norm.unwrap_or(0.0);
            let combined = match strategy {
                RetrievalKind::Semantic => v,
                RetrievalKind::Keyword => k,
                RetrievalKind::Hybrid => v * weights.vector + k * weights.keyword,
            };
            (c, combined)
        })
        .collect();

    scored.sort_by(|(a, sa), (b, sb)| {
        sb.total_cmp(sa)
            .then_with(|| {
                let ra = a.vector_rank.unwrap_or(usize::MAX);
                let rb = b.vector_rank.unwrap_or(usize::MAX);
                ra.cmp(&rb)
            })
            .then_with(|| b.row.quality_overall.total_cmp(&a.row.quality_overall))
            .then_with(|| a.row.id.cmp(&b.row.id))
    });
    scored.truncate(limit);

    scored
        .into_iter()
        .map(|(c, score)| RetrievedChunk {
            chunk_id: c.row.id,
            message_key: c.row.message_key,
            content: c.row.content,
            meta: ChunkMeta {
                sender: c.row.sender,
                subject: c.row.subject,
                date: c.row.date,
                folder: c.row.folder,
                quality_overall: c.row.quality_overall,
            },
            score,
            retrieval: strategy,
        })
        .collect()
}

/// Divides every score in the list by the list's maximum. Non-positive
/// maxima leave the list untouched rather than dividing by zero.
fn normalize(mut hits: Vec<ChannelHit>) -> Vec<ChannelHit> {
    let max = hits.iter().map(|h| h.score).fold(f64::MIN, f64::max);
    if max > f64::EPSILON {
        for hit in &mut hits {
            hit.score /= max;
        }
    }
    hits
}

pub fn parse_strategy(s: &str) -> Result<RetrievalKind> {
    match s {
        "keyword" => Ok(RetrievalKind::Keyword),
        "semantic" => Ok(RetrievalKind::Semantic),
        "hybrid" => Ok(RetrievalKind::Hybrid),
        other => bail!("unknown search strategy '{other}' (expected keyword, semantic, or hybrid)"),
    }
}

/// Run the search command: retrieve, rerank, and print ranked results.
pub async fn run_search(
    ctx: &crate::service::ServiceContext,
    query: &str,
    strategy: &str,
    top_k: usize,
) -> Result<()> {
    let strategy = parse_strategy(strategy)?;
    let outcome = retrieve_and_rerank(
        &ctx.pool,
        ctx.embedder.as_deref(),
        &ctx.reranker,
        query,
        strategy,
        top_k,
        &ctx.fusion_weights(),
    )
    .await?;

    let results = match outcome {
        RetrievalOutcome::NotIndexed => {
            println!("Index is empty — run `mailseek sync` first.");
            return Ok(());
        }
        RetrievalOutcome::Results(results) => results,
    };

    if results.is_empty() {
        println!("No results for \"{query}\".");
        return Ok(());
    }

    println!(
        "{} result{} for \"{}\" ({} search)",
        results.len(),
        if results.len() == 1 { "" } else { "s" },
        query,
        strategy.as_str()
    );
    println!();
    for (i, r) in results.iter().enumerate() {
        println!(
            "{:>2}. [{:.3}] {} — {} ({}, {})",
            i + 1,
            r.score,
            r.meta.sender,
            r.meta.subject,
            r.meta.folder,
            r.meta.date
        );
        println!("      {}", snippet(&r.content, 200));
    }
    Ok(())
}

/// First `max_chars` of the content on one line.
fn snippet(content: &str, max_chars: usize) -> String {
    let flat: String = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}…", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, score: f64, quality: f64) -> ChannelHit {
        ChannelHit {
            row: CandidateRow {
                id: id.to_string(),
                message_key: format!("msg-{id}"),
                content: format!("content {id}"),
                sender: "s".into(),
                subject: "t".into(),
                date: "d".into(),
                folder: "INBOX".into(),
                quality_overall: quality,
            },
            score,
        }
    }

    const EVEN: FusionWeights = FusionWeights {
        vector: 0.5,
        keyword: 0.5,
    };

    #[test]
    fn normalize_divides_by_list_max() {
        let hits = normalize(vec![hit("a", 4.0, 0.0), hit("b", 2.0, 0.0)]);
        assert_eq!(hits[0].score, 1.0);
        assert_eq!(hits[1].score, 0.5);
    }

    #[test]
    fn normalize_leaves_empty_and_zero_lists_alone() {
        assert!(normalize(vec![]).is_empty());
        let hits = normalize(vec![hit("a", 0.0, 0.0)]);
        assert_eq!(hits[0].score, 0.0);
    }

    #[test]
    fn chunk_in_both_lists_beats_single_list_top() {
        // Moderate in both channels vs. top of exactly one.
        let vector = vec![hit("top-v", 1.0, 50.0), hit("both", 0.8, 50.0)];
        let keyword = vec![hit("top-k", 3.0, 50.0), hit("both", 2.4, 50.0)];
        let results = fuse(vector, keyword, RetrievalKind::Hybrid, &EVEN, 10);

        assert_eq!(results[0].chunk_id, "both");
        assert!((results[0].score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn missing_channel_contributes_zero() {
        let vector = vec![hit("v-only", 1.0, 50.0)];
        let results = fuse(vector, vec![], RetrievalKind::Hybrid, &EVEN, 10);
        assert_eq!(results.len(), 1);
        assert!((results[0].score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn keyword_strategy_ignores_vector_scores() {
        let vector = vec![hit("a", 1.0, 50.0)];
        let keyword = vec![hit("b", 5.0, 50.0)];
        let results = fuse(vector, keyword, RetrievalKind::Keyword, &EVEN, 10);
        assert_eq!(results[0].chunk_id, "b");
        // The vector-only chunk scores zero under the keyword strategy.
        assert_eq!(results[1].chunk_id, "a");
        assert_eq!(results[1].score, 0.0);
    }

    #[test]
    fn ties_break_by_vector_rank_then_quality_then_id() {
        // Same combined score; "a" has the better vector rank.
        let vector = vec![hit("a", 1.0, 10.0), hit("b", 1.0, 90.0)];
        let results = fuse(vector, vec![], RetrievalKind::Semantic, &EVEN, 10);
        assert_eq!(results[0].chunk_id, "a");

        // No vector ranks at all: quality decides.
        let keyword = vec![hit("low", 2.0, 10.0), hit("high", 2.0, 90.0)];
        let results = fuse(vec![], keyword, RetrievalKind::Keyword, &EVEN, 10);
        assert_eq!(results[0].chunk_id, "high");

        // Identical everything: id keeps the order deterministic.
        let keyword = vec![hit("zz", 2.0, 50.0), hit("aa", 2.0, 50.0)];
        let results = fuse(vec![], keyword, RetrievalKind::Keyword, &EVEN, 10);
        assert_eq!(results[0].chunk_id, "aa");
    }

    #[test]
    fn results_truncate_to_limit() {
        let keyword = (0..10).map(|i| hit(&format!("k{i}"), 10.0 - i as f64, 50.0)).collect();
        let results = fuse(vec![], keyword, RetrievalKind::Keyword, &EVEN, 3);
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn weights_shift_the_winner() {
        let vector = vec![hit("v", 1.0, 50.0)];
        let keyword = vec![hit("k", 1.0, 50.0)];

        let vector_heavy = FusionWeights {
            vector: 0.9,
            keyword: 0.1,
        };
        let results = fuse(
            vector.clone(),
            keyword.clone(),
            RetrievalKind::Hybrid,
            &vector_heavy,
            10,
        );
        assert_eq!(results[0].chunk_id, "v");

        let keyword_heavy = FusionWeights {
            vector: 0.1,
            keyword: 0.9,
        };
        let results = fuse(vector, keyword, RetrievalKind::Hybrid, &keyword_heavy, 10);
        assert_eq!(results[0].chunk_id, "k");
    }

    #[test]
    fn pure_vector_weights_reduce_to_the_vector_channel() {
        let vector = vec![
            hit("v1", 0.9, 50.0),
            hit("v2", 0.7, 50.0),
            hit("v3", 0.5, 50.0),
        ];
        let keyword = vec![hit("k-only", 10.0, 99.0), hit("v3", 9.0, 99.0)];
        let weights = FusionWeights {
            vector: 1.0,
            keyword: 0.0,
        };

        let hybrid = fuse(vector.clone(), keyword, RetrievalKind::Hybrid, &weights, 10);
        let semantic = fuse(vector, vec![], RetrievalKind::Semantic, &weights, 10);

        let hybrid_ids: Vec<&str> = hybrid.iter().map(|c| c.chunk_id.as_str()).collect();
        let semantic_ids: Vec<&str> = semantic.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(&hybrid_ids[..3], &semantic_ids[..]);
        for (h, s) in hybrid.iter().zip(&semantic) {
            assert!((h.score - s.score).abs() < 1e-9);
        }

        // The keyword-only candidate is present but contributes nothing.
        let k_only = hybrid.iter().find(|c| c.chunk_id == "k-only").unwrap();
        assert_eq!(k_only.score, 0.0);
        assert_eq!(hybrid_ids.last(), Some(&"k-only"));
    }

    #[test]
    fn fts_match_expr_quotes_tokens() {
        assert_eq!(
            fts_match_expr("deploy window friday"),
            Some("\"deploy\" OR \"window\" OR \"friday\"".to_string())
        );
        assert_eq!(
            fts_match_expr("what's the q3-budget?"),
            Some("\"what\" OR \"s\" OR \"the\" OR \"q3\" OR \"budget\"".to_string())
        );
        assert_eq!(fts_match_expr("?!,"), None);
        assert_eq!(fts_match_expr(""), None);
    }

    #[test]
    fn strategy_parsing() {
        assert_eq!(parse_strategy("hybrid").unwrap(), RetrievalKind::Hybrid);
        assert_eq!(parse_strategy("keyword").unwrap(), RetrievalKind::Keyword);
        assert_eq!(parse_strategy("semantic").unwrap(), RetrievalKind::Semantic);
        assert!(parse_strategy("fuzzy").is_err());
    }

    #[test]
    fn snippet_flattens_and_truncates() {
        assert_eq!(snippet("a\nb  c", 200), "a b c");
        let long = "word ".repeat(100);
        let s = snippet(&long, 20);
        assert!(s.chars().count() <= 21);
        assert!(s.ends_with('…'));
    }
}
