//! Core data models used throughout mailseek.
//!
//! These types represent the messages, quality assessments, chunks, and
//! search results that flow through the ingestion and retrieval pipeline.

use sha2::{Digest, Sha256};

/// A raw message as delivered by the mail transport, before any cleaning.
///
/// Raw messages are transient: they are scored and chunked during a sync
/// cycle and then discarded. Only chunks of accepted messages are persisted.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub sender: String,
    pub subject: String,
    /// Message body, possibly HTML.
    pub body: String,
    pub date: String,
    /// Transport-assigned sequence identifier (e.g. IMAP UID). Monotone
    /// per mailbox; used as the sync resumption marker.
    pub seq_id: i64,
    /// Globally unique message identifier, when the transport provides one.
    pub message_id: Option<String>,
    pub folder: String,
}

/// Number of leading body bytes that participate in the content-hash
/// fallback of [`RawMessage::dedup_key`].
const DEDUP_BODY_PREFIX: usize = 1000;

impl RawMessage {
    /// Stable identity used for deduplication.
    ///
    /// The message id wins when present; otherwise a SHA-256 over
    /// (sender, subject, date, first [`DEDUP_BODY_PREFIX`] body bytes).
    /// Two messages with the same dedup key are never both indexed.
    pub fn dedup_key(&self) -> String {
        if let Some(id) = &self.message_id {
            if !id.trim().is_empty() {
                return id.trim().to_string();
            }
        }

        let mut hasher = Sha256::new();
        hasher.update(self.sender.as_bytes());
        hasher.update([0]);
        hasher.update(self.subject.as_bytes());
        hasher.update([0]);
        hasher.update(self.date.as_bytes());
        hasher.update([0]);
        let body = self.body.as_bytes();
        hasher.update(&body[..body.len().min(DEDUP_BODY_PREFIX)]);
        format!("{:x}", hasher.finalize())
    }
}

/// Content quality assessment for one message.
///
/// All fields are bounded: `content_ratio` in `[0, 1]`, everything else in
/// `[0, 100]`. A score is derived once per message and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityScore {
    /// Weighted aggregate, 0 (junk) to 100 (clean prose).
    pub overall: f64,
    /// Useful content vs. noise, 0.0 to 1.0.
    pub content_ratio: f64,
    /// 0 = not promotional, 100 = pure marketing.
    pub marketing: f64,
    /// 0 = unique text, 100 = boilerplate template.
    pub template: f64,
    /// 0 = unreadable, 100 = well-formed sentences.
    pub readability: f64,
    /// Confidence that the text is natural English, 0 to 100.
    pub language_confidence: f64,
    /// Human-readable issue tags accumulated during scoring.
    pub issues: Vec<String>,
}

impl QualityScore {
    /// The score assigned to empty or near-empty bodies.
    pub fn zero(issue: impl Into<String>) -> Self {
        Self {
            overall: 0.0,
            content_ratio: 0.0,
            marketing: 0.0,
            template: 0.0,
            readability: 0.0,
            language_confidence: 0.0,
            issues: vec![issue.into()],
        }
    }
}

/// Structural role of a chunk within its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Greeting,
    Body,
    Paragraph,
    Signature,
    Quote,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Greeting => "greeting",
            ChunkKind::Body => "body",
            ChunkKind::Paragraph => "paragraph",
            ChunkKind::Signature => "signature",
            ChunkKind::Quote => "quote",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "greeting" => Some(ChunkKind::Greeting),
            "body" => Some(ChunkKind::Body),
            "paragraph" => Some(ChunkKind::Paragraph),
            "signature" => Some(ChunkKind::Signature),
            "quote" => Some(ChunkKind::Quote),
            _ => None,
        }
    }
}

/// Message metadata carried on every chunk so search results are
/// self-describing without a join back to a message table.
#[derive(Debug, Clone)]
pub struct ChunkMeta {
    pub sender: String,
    pub subject: String,
    pub date: String,
    pub folder: String,
    /// Overall quality of the owning message, used as a ranking tiebreaker.
    pub quality_overall: f64,
}

/// A bounded span of one message's cleaned text, sized for embedding.
///
/// Chunks are immutable once created; a message is only ever re-chunked
/// wholesale, never patched chunk by chunk.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    /// Dedup key of the owning message.
    pub message_key: String,
    pub kind: ChunkKind,
    /// Zero-based position within the owning message.
    pub chunk_index: i64,
    /// Back-filled once the full chunk list for the message is known.
    pub total_chunks: i64,
    pub token_count: i64,
    pub content: String,
    /// SHA-256 of `content`, for staleness detection on embeddings.
    pub hash: String,
    pub meta: ChunkMeta,
}

/// Which retrieval channel produced (or dominated) a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalKind {
    Keyword,
    Semantic,
    Hybrid,
}

impl RetrievalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalKind::Keyword => "keyword",
            RetrievalKind::Semantic => "semantic",
            RetrievalKind::Hybrid => "hybrid",
        }
    }
}

/// One ranked result from the retrieval pipeline.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub message_key: String,
    pub content: String,
    pub meta: ChunkMeta,
    /// Fused (and possibly reranked) relevance score.
    pub score: f64,
    pub retrieval: RetrievalKind,
}

/// Counters produced by one indexing batch.
#[derive(Debug, Clone, Default)]
pub struct IndexReport {
    /// Messages whose chunks were appended to the store this batch.
    pub indexed_messages: u64,
    /// Messages skipped because their dedup key was already processed.
    pub skipped_messages: u64,
    /// Messages rejected by the quality gate (a normal outcome).
    pub rejected_messages: u64,
    /// Messages that errored mid-indexing; retried on the next cycle.
    pub failed_messages: u64,
    pub added_chunks: u64,
    /// One reason string per rejected message.
    pub rejection_reasons: Vec<String>,
}

impl IndexReport {
    pub fn absorb(&mut self, other: IndexReport) {
        self.indexed_messages += other.indexed_messages;
        self.skipped_messages += other.skipped_messages;
        self.rejected_messages += other.rejected_messages;
        self.failed_messages += other.failed_messages;
        self.added_chunks += other.added_chunks;
        self.rejection_reasons.extend(other.rejection_reasons);
    }
}

/// Persisted sync resumption state. The sole source of truth for what has
/// already been indexed; written once per successful cycle, at the end.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncState {
    /// Highest transport sequence id seen; monotone non-decreasing.
    pub last_seq_id: i64,
    /// Unix timestamp of the last successful cycle.
    pub last_sync_time: Option<i64>,
    /// Cumulative count of messages indexed across all cycles.
    pub total_processed: i64,
}
