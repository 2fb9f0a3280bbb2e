//! Incremental indexing: clean, gate, chunk, embed, append.
//!
//! One message is one transaction. Chunk rows, FTS rows, vector rows, and
//! the dedup-key record commit together, so readers see a message either
//! fully indexed or not at all. A failure mid-message rolls back and the
//! message is retried on the next cycle; earlier messages in the batch
//! stay indexed.

use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;

use crate::chunker::Chunker;
use crate::clean::MessageCleaner;
use crate::config::QualityConfig;
use crate::embedding::{vec_to_blob, Embedder};
use crate::models::{Chunk, IndexReport, RawMessage};
use crate::quality::QualityScorer;
use crate::state;

pub struct Indexer<'a> {
    pool: &'a SqlitePool,
    cleaner: &'a MessageCleaner,
    scorer: &'a QualityScorer,
    chunker: &'a Chunker,
    quality: &'a QualityConfig,
    embedder: Option<&'a dyn Embedder>,
    embed_batch_size: usize,
}

#[derive(Debug)]
pub enum MessageOutcome {
    Indexed { chunks: u64 },
    Skipped,
    Rejected { reason: String },
}

impl<'a> Indexer<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: &'a SqlitePool,
        cleaner: &'a MessageCleaner,
        scorer: &'a QualityScorer,
        chunker: &'a Chunker,
        quality: &'a QualityConfig,
        embedder: Option<&'a dyn Embedder>,
        embed_batch_size: usize,
    ) -> Self {
        Self {
            pool,
            cleaner,
            scorer,
            chunker,
            quality,
            embedder,
            embed_batch_size: embed_batch_size.max(1),
        }
    }

    /// Indexes a batch of raw messages. Per-message errors are counted,
    /// logged, and never abort the rest of the batch.
    pub async fn index_batch(&self, messages: &[RawMessage]) -> IndexReport {
        let mut report = IndexReport::default();
        for msg in messages {
            match self.index_message(msg).await {
                Ok(MessageOutcome::Indexed { chunks }) => {
                    report.indexed_messages += 1;
                    report.added_chunks += chunks;
                }
                Ok(MessageOutcome::Skipped) => report.skipped_messages += 1,
                Ok(MessageOutcome::Rejected { reason }) => {
                    tracing::debug!(seq_id = msg.seq_id, %reason, "message rejected");
                    report.rejected_messages += 1;
                    report.rejection_reasons.push(reason);
                }
                Err(e) => {
                    tracing::warn!(seq_id = msg.seq_id, error = %e, "failed to index message");
                    report.failed_messages += 1;
                }
            }
        }
        report
    }

    pub async fn index_message(&self, msg: &RawMessage) -> Result<MessageOutcome> {
        let key = msg.dedup_key();
        // First write wins: a key already in the processed set is skipped
        // even if the message content was edited since.
        if state::is_processed(self.pool, &key).await? {
            return Ok(MessageOutcome::Skipped);
        }

        let cleaned = self.cleaner.clean(&msg.sender, &msg.subject, &msg.body);
        let score = self.scorer.score(&cleaned.sections.full_text);

        if let Some(reason) = self.gate_rejection(&cleaned.sections.full_text, &score) {
            // Record the key so rejected mail is not rescored every cycle.
            state::mark_processed(self.pool, &key, msg.seq_id).await?;
            return Ok(MessageOutcome::Rejected { reason });
        }

        let meta = crate::models::ChunkMeta {
            sender: cleaned.sender,
            subject: cleaned.subject,
            date: msg.date.clone(),
            folder: msg.folder.clone(),
            quality_overall: score.overall,
        };
        let chunks = self.chunker.chunk(&key, &cleaned.sections, &meta);
        if chunks.is_empty() {
            bail!("cleaned message produced no chunks");
        }

        let vectors = match self.embedder {
            Some(embedder) => Some(self.embed_chunks(embedder, &chunks).await?),
            None => None,
        };

        let mut tx = self.pool.begin().await?;
        for chunk in &chunks {
            insert_chunk(&mut tx, chunk).await?;
        }
        if let Some(vectors) = &vectors {
            for (chunk, vector) in chunks.iter().zip(vectors) {
                insert_vector(&mut tx, &chunk.id, &chunk.message_key, vector).await?;
            }
        }
        state::mark_processed(&mut *tx, &key, msg.seq_id).await?;
        tx.commit().await?;

        Ok(MessageOutcome::Indexed {
            chunks: chunks.len() as u64,
        })
    }

    fn gate_rejection(&self, text: &str, score: &crate::models::QualityScore) -> Option<String> {
        if text.chars().count() < self.quality.min_length {
            return Some("content below minimum length".to_string());
        }
        if score.overall < self.quality.threshold {
            let detail = if score.issues.is_empty() {
                String::new()
            } else {
                format!(" ({})", score.issues.join(", "))
            };
            return Some(format!(
                "quality {:.1} below threshold {:.1}{detail}",
                score.overall, self.quality.threshold
            ));
        }
        if score.marketing > self.quality.max_marketing {
            return Some(format!(
                "marketing score {:.1} above limit {:.1}",
                score.marketing, self.quality.max_marketing
            ));
        }
        if score.language_confidence < self.quality.min_language_confidence {
            return Some(format!(
                "language confidence {:.1} below minimum {:.1}",
                score.language_confidence, self.quality.min_language_confidence
            ));
        }
        None
    }

    async fn embed_chunks(
        &self,
        embedder: &dyn Embedder,
        chunks: &[Chunk],
    ) -> Result<Vec<Vec<f32>>> {
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = embedder
            .embed(&texts)
            .await
            .context("Failed to embed chunks")?;
        if vectors.len() != chunks.len() {
            bail!(
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            );
        }
        for v in &vectors {
            if v.len() != embedder.dims() {
                bail!(
                    "embedder returned {}-dim vector, expected {}",
                    v.len(),
                    embedder.dims()
                );
            }
        }
        Ok(vectors)
    }

    /// Checks the stored index metadata against the configured embedder.
    /// A model or dimensionality mismatch triggers a full vector rebuild.
    /// Returns `true` when a rebuild ran.
    pub async fn ensure_compatible_index(&self) -> Result<bool> {
        let Some(embedder) = self.embedder else {
            return Ok(false);
        };

        let stored: Option<(String, i64)> =
            sqlx::query_as("SELECT model, dims FROM index_meta WHERE id = 1")
                .fetch_optional(self.pool)
                .await?;

        match stored {
            None => {
                write_index_meta(self.pool, embedder.model_name(), embedder.dims()).await?;
                Ok(false)
            }
            Some((model, dims))
                if model == embedder.model_name() && dims == embedder.dims() as i64 =>
            {
                Ok(false)
            }
            Some((model, dims)) => {
                tracing::warn!(
                    stored_model = %model,
                    stored_dims = dims,
                    model = embedder.model_name(),
                    dims = embedder.dims(),
                    "index built with a different embedder, rebuilding vectors"
                );
                let rebuilt = self
                    .rebuild_vectors()
                    .await
                    .context("Vector rebuild after embedder change failed")?;
                tracing::info!(chunks = rebuilt, "vector rebuild complete");
                Ok(true)
            }
        }
    }

    /// Drops all vectors and re-embeds every stored chunk with the current
    /// embedder. Returns the number of chunks embedded.
    pub async fn rebuild_vectors(&self) -> Result<u64> {
        let Some(embedder) = self.embedder else {
            bail!("cannot rebuild vectors without an embedding backend");
        };

        sqlx::query("DELETE FROM chunk_vectors")
            .execute(self.pool)
            .await?;
        write_index_meta(self.pool, embedder.model_name(), embedder.dims()).await?;

        let rows: Vec<(String, String, String)> =
            sqlx::query_as("SELECT id, message_key, content FROM chunks ORDER BY rowid")
                .fetch_all(self.pool)
                .await?;

        let mut embedded = 0u64;
        for batch in rows.chunks(self.embed_batch_size) {
            let texts: Vec<String> = batch.iter().map(|(_, _, c)| c.clone()).collect();
            let vectors = embedder.embed(&texts).await?;
            if vectors.len() != batch.len() {
                bail!(
                    "embedder returned {} vectors for {} chunks",
                    vectors.len(),
                    batch.len()
                );
            }
            let mut tx = self.pool.begin().await?;
            for ((id, message_key, _), vector) in batch.iter().zip(&vectors) {
                insert_vector(&mut tx, id, message_key, vector).await?;
            }
            tx.commit().await?;
            embedded += batch.len() as u64;
        }
        Ok(embedded)
    }

    /// Wipes all indexed content and metadata. Used by full resync.
    pub async fn clear_index(&self) -> Result<()> {
        sqlx::query("DELETE FROM chunk_vectors")
            .execute(self.pool)
            .await?;
        sqlx::query("DELETE FROM chunks_fts").execute(self.pool).await?;
        sqlx::query("DELETE FROM chunks").execute(self.pool).await?;
        sqlx::query("DELETE FROM index_meta").execute(self.pool).await?;
        Ok(())
    }
}

async fn insert_chunk(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    chunk: &Chunk,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO chunks (
            id, message_key, chunk_index, total_chunks, kind, token_count,
            content, hash, sender, subject, date, folder, quality_overall,
            indexed_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, unixepoch())
        "#,
    )
    .bind(&chunk.id)
    .bind(&chunk.message_key)
    .bind(chunk.chunk_index)
    .bind(chunk.total_chunks)
    .bind(chunk.kind.as_str())
    .bind(chunk.token_count)
    .bind(&chunk.content)
    .bind(&chunk.hash)
    .bind(&chunk.meta.sender)
    .bind(&chunk.meta.subject)
    .bind(&chunk.meta.date)
    .bind(&chunk.meta.folder)
    .bind(chunk.meta.quality_overall)
    .execute(&mut **tx)
    .await?;

    sqlx::query("INSERT INTO chunks_fts (chunk_id, message_key, content) VALUES (?, ?, ?)")
        .bind(&chunk.id)
        .bind(&chunk.message_key)
        .bind(&chunk.content)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

async fn insert_vector(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    chunk_id: &str,
    message_key: &str,
    vector: &[f32],
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO chunk_vectors (chunk_id, message_key, embedding)
        VALUES (?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET embedding = excluded.embedding
        "#,
    )
    .bind(chunk_id)
    .bind(message_key)
    .bind(vec_to_blob(vector))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn write_index_meta(pool: &SqlitePool, model: &str, dims: usize) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO index_meta (id, model, dims, built_at)
        VALUES (1, ?, ?, unixepoch())
        ON CONFLICT(id) DO UPDATE SET
            model = excluded.model,
            dims = excluded.dims,
            built_at = excluded.built_at
        "#,
    )
    .bind(model)
    .bind(dims as i64)
    .execute(pool)
    .await?;
    Ok(())
}
