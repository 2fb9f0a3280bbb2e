use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Acceptance gate thresholds. A message is indexed only when its overall
/// quality clears `threshold`, its marketing score stays at or below
/// `max_marketing`, and the cleaned body is at least `min_length` chars.
#[derive(Debug, Deserialize, Clone)]
pub struct QualityConfig {
    #[serde(default = "default_quality_threshold")]
    pub threshold: f64,
    #[serde(default = "default_max_marketing")]
    pub max_marketing: f64,
    /// Additional gate on language confidence; 0 disables it.
    #[serde(default)]
    pub min_language_confidence: f64,
    #[serde(default = "default_min_length")]
    pub min_length: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            threshold: default_quality_threshold(),
            max_marketing: default_max_marketing(),
            min_language_confidence: 0.0,
            min_length: default_min_length(),
        }
    }
}

fn default_quality_threshold() -> f64 {
    40.0
}
fn default_max_marketing() -> f64 {
    50.0
}
fn default_min_length() -> usize {
    20
}

/// Chunk size limits, all in token units.
#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_min_chunk")]
    pub min_size: usize,
    #[serde(default = "default_max_chunk")]
    pub max_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
    #[serde(default = "default_true")]
    pub preserve_paragraphs: bool,
    #[serde(default = "default_true")]
    pub preserve_sentences: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_size: default_min_chunk(),
            max_size: default_max_chunk(),
            overlap: default_overlap(),
            preserve_paragraphs: true,
            preserve_sentences: true,
        }
    }
}

fn default_min_chunk() -> usize {
    50
}
fn default_max_chunk() -> usize {
    384
}
fn default_overlap() -> usize {
    30
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_bm25_weight")]
    pub bm25_weight: f64,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_weight: default_vector_weight(),
            bm25_weight: default_bm25_weight(),
            final_limit: default_final_limit(),
        }
    }
}

fn default_vector_weight() -> f64 {
    0.6
}
fn default_bm25_weight() -> f64 {
    0.4
}
fn default_final_limit() -> usize {
    10
}

/// Embedding backend selection. A closed set: adding a backend means adding
/// a variant here plus an implementation, not widening string comparisons.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackendKind {
    #[default]
    Disabled,
    #[serde(rename = "openai")]
    OpenAi,
    Ollama,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub backend: EmbeddingBackendKind,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackendKind::Disabled,
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.backend != EmbeddingBackendKind::Disabled
    }
}

fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

/// Reranker backend selection, same closed-enum shape as embeddings.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RerankBackendKind {
    #[default]
    Disabled,
    Bm25,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    #[serde(default)]
    pub backend: RerankBackendKind,
    /// BM25 term-frequency saturation.
    #[serde(default = "default_bm25_k1")]
    pub k1: f64,
    /// BM25 document-length normalization.
    #[serde(default = "default_bm25_b")]
    pub b: f64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            backend: RerankBackendKind::Disabled,
            k1: default_bm25_k1(),
            b: default_bm25_b(),
        }
    }
}

fn default_bm25_k1() -> f64 {
    1.5
}
fn default_bm25_b() -> f64 {
    0.75
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Seconds between sync cycles.
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,
    /// Messages fetched per transport batch within a cycle.
    #[serde(default = "default_sync_batch")]
    pub batch_size: usize,
    /// First-run lookback window when no sequence id has been recorded.
    #[serde(default = "default_initial_window")]
    pub initial_window_days: i64,
    /// Delay before reconnecting after a connection-level error.
    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,
    /// Cap on the processed-message dedup set; oldest keys evicted first.
    #[serde(default = "default_processed_cap")]
    pub processed_cap: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval(),
            batch_size: default_sync_batch(),
            initial_window_days: default_initial_window(),
            error_backoff_secs: default_error_backoff(),
            processed_cap: default_processed_cap(),
        }
    }
}

fn default_sync_interval() -> u64 {
    120
}
fn default_sync_batch() -> usize {
    50
}
fn default_initial_window() -> i64 {
    7
}
fn default_error_backoff() -> u64 {
    30
}
fn default_processed_cap() -> usize {
    10_000
}

/// Mail source selection. Only the JSON-file transport ships in-tree;
/// network transports implement [`crate::transport::MailTransport`].
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TransportConfig {
    pub json_file: Option<JsonFileTransportConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JsonFileTransportConfig {
    /// Path to a `.json` (array) or `.jsonl` (one record per line) export.
    pub path: PathBuf,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_size == 0 {
        anyhow::bail!("chunking.max_size must be > 0");
    }
    if config.chunking.min_size > config.chunking.max_size {
        anyhow::bail!("chunking.min_size must not exceed chunking.max_size");
    }

    if !(0.0..=100.0).contains(&config.quality.threshold) {
        anyhow::bail!("quality.threshold must be in [0, 100]");
    }
    if !(0.0..=100.0).contains(&config.quality.max_marketing) {
        anyhow::bail!("quality.max_marketing must be in [0, 100]");
    }

    if config.retrieval.vector_weight < 0.0 || config.retrieval.bm25_weight < 0.0 {
        anyhow::bail!("retrieval weights must be >= 0");
    }
    if config.retrieval.vector_weight + config.retrieval.bm25_weight <= 0.0 {
        anyhow::bail!("at least one retrieval weight must be > 0");
    }
    if config.retrieval.final_limit == 0 {
        anyhow::bail!("retrieval.final_limit must be >= 1");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when backend is {:?}",
                config.embedding.backend
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when backend is {:?}",
                config.embedding.backend
            );
        }
    }

    if config.sync.batch_size == 0 {
        anyhow::bail!("sync.batch_size must be >= 1");
    }
    if config.sync.interval_secs == 0 {
        anyhow::bail!("sync.interval_secs must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_text: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_text)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse(
            r#"
            [db]
            path = "data/mailseek.sqlite"
            "#,
        )
        .unwrap();

        assert_eq!(config.quality.threshold, 40.0);
        assert_eq!(config.quality.max_marketing, 50.0);
        assert_eq!(config.chunking.max_size, 384);
        assert_eq!(config.chunking.overlap, 30);
        assert_eq!(config.retrieval.vector_weight, 0.6);
        assert_eq!(config.sync.batch_size, 50);
        assert_eq!(config.sync.processed_cap, 10_000);
        assert_eq!(config.embedding.backend, EmbeddingBackendKind::Disabled);
        assert_eq!(config.rerank.backend, RerankBackendKind::Disabled);
    }

    #[test]
    fn enabled_embedding_requires_model_and_dims() {
        let err = parse(
            r#"
            [db]
            path = "data/mailseek.sqlite"

            [embedding]
            backend = "openai"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("dims"));
    }

    #[test]
    fn openai_backend_name_parses() {
        let config = parse(
            r#"
            [db]
            path = "data/mailseek.sqlite"

            [embedding]
            backend = "openai"
            model = "text-embedding-3-small"
            dims = 1536
            "#,
        )
        .unwrap();
        assert_eq!(config.embedding.backend, EmbeddingBackendKind::OpenAi);
    }

    #[test]
    fn unknown_backend_is_rejected_at_parse_time() {
        let result = parse(
            r#"
            [db]
            path = "data/mailseek.sqlite"

            [embedding]
            backend = "sentencepiece"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn zero_weights_rejected() {
        let err = parse(
            r#"
            [db]
            path = "data/mailseek.sqlite"

            [retrieval]
            vector_weight = 0.0
            bm25_weight = 0.0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("weight"));
    }

    #[test]
    fn full_config_parses() {
        let config = parse(
            r#"
            [db]
            path = "data/mailseek.sqlite"

            [quality]
            threshold = 50.0
            max_marketing = 40.0
            min_language_confidence = 30.0

            [chunking]
            min_size = 50
            max_size = 256
            overlap = 30

            [retrieval]
            vector_weight = 0.7
            bm25_weight = 0.3
            final_limit = 5

            [embedding]
            backend = "ollama"
            model = "nomic-embed-text"
            dims = 768

            [rerank]
            backend = "bm25"

            [sync]
            interval_secs = 60
            batch_size = 25

            [transport.json_file]
            path = "data/raw/export.jsonl"
            "#,
        )
        .unwrap();

        assert_eq!(config.embedding.backend, EmbeddingBackendKind::Ollama);
        assert_eq!(config.rerank.backend, RerankBackendKind::Bm25);
        assert!(config.transport.json_file.is_some());
    }
}
