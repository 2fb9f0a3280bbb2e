//! Boundary-aware chunking of cleaned messages.
//!
//! Sections map to chunk kinds: greeting and signature become their own
//! chunks when significant, quoted text is chunked at half size, and the
//! main body is packed paragraph by paragraph up to the token limit.
//! Oversize paragraphs split at sentence boundaries, then at word
//! boundaries. A chunk never ends mid-word.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::clean::MessageSections;
use crate::config::ChunkingConfig;
use crate::models::{Chunk, ChunkKind, ChunkMeta};

/// Rough token approximation: four characters per token.
const CHARS_PER_TOKEN: usize = 4;

/// Greetings shorter than this merge into the body instead of standing alone.
const MIN_GREETING_CHARS: usize = 20;
/// Signatures shorter than this are dropped as noise.
const MIN_SIGNATURE_CHARS: usize = 30;
/// Quoted text longer than this is dropped entirely.
const MAX_QUOTE_CHARS: usize = 2000;

/// How tokens are counted. Fixed for the lifetime of an index; mixing
/// counters across runs would make stored `token_count`s incomparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenCounter {
    /// `len / 4`, the usual embedding-model approximation.
    CharApprox,
    /// Whitespace-separated words.
    Words,
}

impl TokenCounter {
    pub fn count(&self, text: &str) -> usize {
        match self {
            TokenCounter::CharApprox => text.len().div_ceil(CHARS_PER_TOKEN),
            TokenCounter::Words => text.split_whitespace().count(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkLimits {
    pub min_size: usize,
    pub max_size: usize,
    pub overlap: usize,
    pub preserve_paragraphs: bool,
    pub preserve_sentences: bool,
}

impl From<&ChunkingConfig> for ChunkLimits {
    fn from(c: &ChunkingConfig) -> Self {
        Self {
            min_size: c.min_size,
            max_size: c.max_size,
            overlap: c.overlap,
            preserve_paragraphs: c.preserve_paragraphs,
            preserve_sentences: c.preserve_sentences,
        }
    }
}

pub struct Chunker {
    limits: ChunkLimits,
    counter: TokenCounter,
}

impl Chunker {
    pub fn new(limits: ChunkLimits, counter: TokenCounter) -> Self {
        let mut limits = limits;
        limits.max_size = limits.max_size.max(1);
        // Overlap at or above the chunk size would loop forever.
        limits.overlap = limits.overlap.min(limits.max_size.saturating_sub(1));
        Self { limits, counter }
    }

    /// Chunks one cleaned message. Empty input yields an empty list; the
    /// caller treats that as a processing failure. Non-empty input always
    /// yields at least one chunk.
    pub fn chunk(
        &self,
        message_key: &str,
        sections: &MessageSections,
        meta: &ChunkMeta,
    ) -> Vec<Chunk> {
        if sections.full_text.trim().is_empty() {
            return Vec::new();
        }

        let mut pieces: Vec<(ChunkKind, String)> = Vec::new();

        if let Some(greeting) = &sections.greeting {
            if greeting.chars().count() > MIN_GREETING_CHARS {
                pieces.push((ChunkKind::Greeting, greeting.clone()));
            }
        }

        pieces.extend(self.chunk_main(&sections.main));

        if let Some(signature) = &sections.signature {
            if signature.chars().count() > MIN_SIGNATURE_CHARS {
                for part in self.split_oversize(signature, self.limits.max_size) {
                    pieces.push((ChunkKind::Signature, part));
                }
            }
        }

        if let Some(quoted) = &sections.quoted {
            if quoted.chars().count() < MAX_QUOTE_CHARS {
                let quote_limit = (self.limits.max_size / 2).max(1);
                for part in self.split_oversize(quoted, quote_limit) {
                    pieces.push((ChunkKind::Quote, part));
                }
            }
        }

        // Sectioning can come up empty (e.g. body was all sub-threshold
        // fragments); fall back to one chunk of the whole cleaned text.
        if pieces.is_empty() {
            pieces.push((ChunkKind::Body, sections.full_text.trim().to_string()));
        }

        let total = pieces.len() as i64;
        pieces
            .into_iter()
            .enumerate()
            .map(|(i, (kind, content))| self.build_chunk(message_key, meta, kind, i as i64, total, content))
            .collect()
    }

    /// Greedy paragraph packing with last-paragraph overlap carry.
    fn chunk_main(&self, main: &str) -> Vec<(ChunkKind, String)> {
        let main = main.trim();
        if main.is_empty() {
            return Vec::new();
        }
        if !self.limits.preserve_paragraphs {
            return self
                .split_oversize(main, self.limits.max_size)
                .into_iter()
                .map(|c| (ChunkKind::Body, c))
                .collect();
        }

        let paragraphs: Vec<&str> = main
            .split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();

        let mut out: Vec<(ChunkKind, String)> = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut current_tokens = 0usize;

        for paragraph in paragraphs {
            let ptokens = self.counter.count(paragraph);

            if ptokens > self.limits.max_size {
                if !current.is_empty() {
                    out.push((ChunkKind::Paragraph, current.join("\n\n")));
                    current.clear();
                    current_tokens = 0;
                }
                for part in self.split_oversize(paragraph, self.limits.max_size) {
                    out.push((ChunkKind::Body, part));
                }
                continue;
            }

            if current_tokens + ptokens <= self.limits.max_size {
                current_tokens += ptokens;
                current.push(paragraph.to_string());
                continue;
            }

            // Flush, carrying the last paragraph forward as overlap unless
            // the carry would push the next chunk past the size limit.
            let carry = if self.limits.overlap > 0 {
                current
                    .last()
                    .filter(|last| self.counter.count(last) + ptokens <= self.limits.max_size)
                    .cloned()
            } else {
                None
            };
            out.push((ChunkKind::Paragraph, current.join("\n\n")));
            current.clear();
            current_tokens = 0;
            if let Some(carry) = carry {
                current_tokens += self.counter.count(&carry);
                current.push(carry);
            }
            current_tokens += ptokens;
            current.push(paragraph.to_string());
        }

        if !current.is_empty() {
            out.push((ChunkKind::Paragraph, current.join("\n\n")));
        }
        out
    }

    /// Splits text that exceeds `limit` tokens, at sentence boundaries
    /// first, then words. Every returned piece is at most `limit` tokens
    /// unless it is a single unbreakable word.
    fn split_oversize(&self, text: &str, limit: usize) -> Vec<String> {
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }
        if self.counter.count(text) <= limit {
            return vec![text.to_string()];
        }

        let units: Vec<String> = if self.limits.preserve_sentences {
            split_sentences(text)
        } else {
            text.split_whitespace().map(str::to_string).collect()
        };

        let mut out = Vec::new();
        let mut current = String::new();
        for unit in units {
            if self.counter.count(&unit) > limit {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
                out.extend(self.split_words(&unit, limit));
                continue;
            }
            let joined = if current.is_empty() {
                unit.clone()
            } else {
                format!("{current} {unit}")
            };
            if self.counter.count(&joined) <= limit {
                current = joined;
            } else {
                out.push(std::mem::take(&mut current));
                current = unit;
            }
        }
        if !current.is_empty() {
            out.push(current);
        }
        out
    }

    fn split_words(&self, text: &str, limit: usize) -> Vec<String> {
        let mut out = Vec::new();
        let mut current = String::new();
        for word in text.split_whitespace() {
            let joined = if current.is_empty() {
                word.to_string()
            } else {
                format!("{current} {word}")
            };
            if self.counter.count(&joined) <= limit || current.is_empty() {
                current = joined;
            } else {
                out.push(std::mem::take(&mut current));
                current = word.to_string();
            }
        }
        if !current.is_empty() {
            out.push(current);
        }
        out
    }

    fn build_chunk(
        &self,
        message_key: &str,
        meta: &ChunkMeta,
        kind: ChunkKind,
        index: i64,
        total: i64,
        content: String,
    ) -> Chunk {
        let hash = format!("{:x}", Sha256::digest(content.as_bytes()));
        Chunk {
            id: Uuid::new_v4().to_string(),
            message_key: message_key.to_string(),
            kind,
            chunk_index: index,
            total_chunks: total,
            token_count: self.counter.count(&content) as i64,
            content,
            hash,
            meta: meta.clone(),
        }
    }
}

/// Sentence split at `.`/`!`/`?` runs followed by whitespace. Keeps the
/// terminator with its sentence.
fn split_sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if matches!(bytes[i], b'.' | b'!' | b'?') {
            let mut end = i + 1;
            while end < bytes.len() && matches!(bytes[end], b'.' | b'!' | b'?') {
                end += 1;
            }
            if end >= bytes.len() || bytes[end].is_ascii_whitespace() {
                let sentence = text[start..end].trim();
                if !sentence.is_empty() {
                    out.push(sentence.to_string());
                }
                start = end;
            }
            i = end;
        } else {
            i += 1;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> ChunkMeta {
        ChunkMeta {
            sender: "Ada".into(),
            subject: "Notes".into(),
            date: "2025-03-03".into(),
            folder: "INBOX".into(),
            quality_overall: 80.0,
        }
    }

    fn limits(max: usize, overlap: usize) -> ChunkLimits {
        ChunkLimits {
            min_size: 5,
            max_size: max,
            overlap,
            preserve_paragraphs: true,
            preserve_sentences: true,
        }
    }

    fn sections(main: &str) -> MessageSections {
        MessageSections {
            greeting: None,
            main: main.to_string(),
            signature: None,
            quoted: None,
            full_text: main.to_string(),
        }
    }

    fn word_chunker(max: usize, overlap: usize) -> Chunker {
        Chunker::new(limits(max, overlap), TokenCounter::Words)
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        let chunks = word_chunker(50, 5).chunk("k", &sections("   "), &meta());
        assert!(chunks.is_empty());
    }

    #[test]
    fn small_message_is_one_chunk() {
        let chunks = word_chunker(50, 5).chunk("k", &sections("short and sweet"), &meta());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].kind, ChunkKind::Paragraph);
        assert_eq!(chunks[0].total_chunks, 1);
    }

    #[test]
    fn three_paragraphs_pack_within_limit() {
        // Three paragraphs of 40 words each, max 100: first two pack
        // together, the third starts a new chunk.
        let para = |word: &str| {
            std::iter::repeat(word)
                .take(40)
                .collect::<Vec<_>>()
                .join(" ")
        };
        let main = format!("{}\n\n{}\n\n{}", para("alpha"), para("beta"), para("gamma"));
        let chunker = word_chunker(100, 0);
        let chunks = chunker.chunk("k", &sections(&main), &meta());

        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].content.contains("alpha") && chunks[0].content.contains("beta"));
        assert!(chunks[1].content.contains("gamma"));
        for c in &chunks {
            assert!(c.token_count <= 100);
        }
    }

    #[test]
    fn oversize_paragraph_splits_at_sentences_never_mid_word() {
        let main = (0..30)
            .map(|i| format!("Sentence number {i} has exactly six words."))
            .collect::<Vec<_>>()
            .join(" ");
        let chunker = word_chunker(20, 0);
        let chunks = chunker.chunk("k", &sections(&main), &meta());

        assert!(chunks.len() > 1);
        for c in &chunks {
            assert_eq!(c.kind, ChunkKind::Body);
            assert!(c.token_count <= 20, "chunk had {} tokens", c.token_count);
            // Sentence-preserving split: each chunk ends at a terminator.
            assert!(c.content.ends_with('.'));
            for word in c.content.split_whitespace() {
                assert!(main.contains(word), "mid-word split produced {word:?}");
            }
        }
    }

    #[test]
    fn overlap_carries_last_paragraph() {
        let para = |word: &str, n: usize| {
            std::iter::repeat(word).take(n).collect::<Vec<_>>().join(" ")
        };
        // 60 + 10 fills the first chunk; the 10-word paragraph is within
        // the overlap budget so it reappears at the head of the second.
        let main = format!(
            "{}\n\n{}\n\n{}",
            para("alpha", 60),
            para("bridge", 10),
            para("gamma", 60)
        );
        let chunker = word_chunker(70, 15);
        let chunks = chunker.chunk("k", &sections(&main), &meta());

        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].content.contains("bridge"));
        assert!(chunks[1].content.starts_with("bridge"));
        assert!(chunks[1].content.contains("gamma"));
        for c in &chunks {
            assert!(c.token_count <= 70);
        }
    }

    #[test]
    fn default_sized_paragraphs_share_an_overlap_paragraph() {
        let para = |i: usize| {
            std::iter::repeat(format!("w{i}"))
                .take(100)
                .collect::<Vec<_>>()
                .join(" ")
        };
        let main = (0..8).map(para).collect::<Vec<_>>().join("\n\n");
        let chunks = word_chunker(384, 30).chunk("k", &sections(&main), &meta());

        assert!(chunks.len() > 1);
        // Every chunk after the first opens with the previous chunk's
        // closing paragraph.
        for pair in chunks.windows(2) {
            let last = pair[0].content.split("\n\n").last().unwrap();
            assert!(
                pair[1].content.starts_with(last),
                "consecutive chunks share no paragraph: {:?} then {:?}",
                &pair[0].content[pair[0].content.len() - 8..],
                &pair[1].content[..8]
            );
        }
        for c in &chunks {
            assert!(c.token_count <= 384);
        }
    }

    #[test]
    fn chunks_reassemble_the_input_after_overlap_dedup() {
        let para = |i: usize| {
            std::iter::repeat(format!("topic{i}"))
                .take(40)
                .collect::<Vec<_>>()
                .join(" ")
        };
        let main = (0..6).map(para).collect::<Vec<_>>().join("\n\n");
        let chunks = word_chunker(100, 20).chunk("k", &sections(&main), &meta());
        assert!(chunks.len() > 1);

        let mut rebuilt: Vec<&str> = Vec::new();
        for c in &chunks {
            for p in c.content.split("\n\n") {
                if rebuilt.last() != Some(&p) {
                    rebuilt.push(p);
                }
            }
        }
        assert_eq!(rebuilt.join("\n\n"), main);
    }

    #[test]
    fn greeting_and_signature_get_own_chunks() {
        let s = MessageSections {
            greeting: Some("Good morning project team members,".into()),
            main: "The migration finished without data loss overnight.".into(),
            signature: Some("Best regards,\nAda Lovelace\nAnalytical Engines Ltd".into()),
            quoted: None,
            full_text: "whole text".into(),
        };
        let chunks = word_chunker(50, 5).chunk("k", &s, &meta());
        let kinds: Vec<ChunkKind> = chunks.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![ChunkKind::Greeting, ChunkKind::Paragraph, ChunkKind::Signature]
        );
    }

    #[test]
    fn short_greeting_is_not_its_own_chunk() {
        let s = MessageSections {
            greeting: Some("Hi Bob,".into()),
            main: "Quick question about the invoice from last week.".into(),
            signature: None,
            quoted: None,
            full_text: "whole".into(),
        };
        let chunks = word_chunker(50, 5).chunk("k", &s, &meta());
        assert!(chunks.iter().all(|c| c.kind != ChunkKind::Greeting));
    }

    #[test]
    fn long_quote_is_dropped_short_quote_kept() {
        let mut s = sections("The answer to your question is inline below.");
        s.quoted = Some("x ".repeat(1500));
        let chunks = word_chunker(50, 5).chunk("k", &s, &meta());
        assert!(chunks.iter().all(|c| c.kind != ChunkKind::Quote));

        s.quoted = Some("On Monday you wrote: can we ship early? I think so.".into());
        let chunks = word_chunker(50, 5).chunk("k", &s, &meta());
        assert!(chunks.iter().any(|c| c.kind == ChunkKind::Quote));
    }

    #[test]
    fn indices_contiguous_and_totals_backfilled() {
        let main = (0..20)
            .map(|i| format!("Paragraph {i} talks about topic {i} at length today."))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = word_chunker(25, 5).chunk("k", &sections(&main), &meta());
        assert!(!chunks.is_empty());
        let total = chunks.len() as i64;
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
            assert_eq!(c.total_chunks, total);
            assert_eq!(c.message_key, "k");
        }
    }

    #[test]
    fn fallback_single_body_chunk_when_sections_empty() {
        let s = MessageSections {
            greeting: None,
            main: String::new(),
            signature: None,
            quoted: None,
            full_text: "text that only survived in full_text".into(),
        };
        let chunks = word_chunker(50, 5).chunk("k", &s, &meta());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].kind, ChunkKind::Body);
        assert_eq!(chunks[0].content, "text that only survived in full_text");
    }

    #[test]
    fn char_approx_counter_rounds_up() {
        assert_eq!(TokenCounter::CharApprox.count(""), 0);
        assert_eq!(TokenCounter::CharApprox.count("abcd"), 1);
        assert_eq!(TokenCounter::CharApprox.count("abcde"), 2);
        assert_eq!(TokenCounter::Words.count("two words"), 2);
    }

    #[test]
    fn sentence_split_keeps_terminators() {
        let s = split_sentences("One sentence. Two!! Three? And a tail");
        assert_eq!(s, vec!["One sentence.", "Two!!", "Three?", "And a tail"]);
    }

    #[test]
    fn giant_unbreakable_word_becomes_own_chunk() {
        let main = format!("start {} end", "x".repeat(400));
        let chunker = Chunker::new(
            ChunkLimits {
                min_size: 1,
                max_size: 10,
                overlap: 2,
                preserve_paragraphs: true,
                preserve_sentences: false,
            },
            TokenCounter::CharApprox,
        );
        let chunks = chunker.chunk("k", &sections(&main), &meta());
        // The long token is not split, everything else respects the limit.
        assert!(chunks.iter().any(|c| c.content.contains("xxxx")));
        for c in chunks {
            assert!(c.token_count <= 10 || !c.content.contains(' '));
        }
    }
}
