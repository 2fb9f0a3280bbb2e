//! Shared service context: configuration, database pool, and the
//! long-lived pipeline components. Everything that needs them receives
//! the context explicitly; there is no process-wide state.

use anyhow::{bail, Result};

use crate::chunker::{ChunkLimits, Chunker, TokenCounter};
use crate::clean::MessageCleaner;
use crate::config::Config;
use crate::db;
use crate::embedding::{create_embedder, Embedder};
use crate::indexer::Indexer;
use crate::migrate;
use crate::quality::QualityScorer;
use crate::rerank::Reranker;
use crate::search::FusionWeights;
use crate::transport::{JsonFileTransport, MailTransport};

pub struct ServiceContext {
    pub config: Config,
    pub pool: sqlx::SqlitePool,
    pub cleaner: MessageCleaner,
    pub scorer: QualityScorer,
    pub chunker: Chunker,
    pub embedder: Option<Box<dyn Embedder>>,
    pub reranker: Reranker,
}

impl ServiceContext {
    /// Connects the database, runs migrations, and builds the pipeline
    /// components from configuration.
    pub async fn init(config: Config) -> Result<Self> {
        let pool = db::connect(&config.db.path).await?;
        migrate::run_migrations(&pool).await?;

        let cleaner = MessageCleaner::new()?;
        let scorer = QualityScorer::new()?;
        let chunker = Chunker::new(
            ChunkLimits::from(&config.chunking),
            TokenCounter::CharApprox,
        );
        let embedder = create_embedder(&config.embedding)?;
        let reranker = Reranker::from_config(&config.rerank);

        Ok(Self {
            config,
            pool,
            cleaner,
            scorer,
            chunker,
            embedder,
            reranker,
        })
    }

    pub fn indexer(&self) -> Indexer<'_> {
        Indexer::new(
            &self.pool,
            &self.cleaner,
            &self.scorer,
            &self.chunker,
            &self.config.quality,
            self.embedder.as_deref(),
            self.config.embedding.batch_size,
        )
    }

    pub fn fusion_weights(&self) -> FusionWeights {
        FusionWeights {
            vector: self.config.retrieval.vector_weight,
            keyword: self.config.retrieval.bm25_weight,
        }
    }

    /// Builds the configured mail transport.
    pub fn transport(&self) -> Result<Box<dyn MailTransport>> {
        match &self.config.transport.json_file {
            Some(t) => Ok(Box::new(JsonFileTransport::new(&t.path))),
            None => bail!("no mail transport configured (set [transport.json_file] in the config)"),
        }
    }
}
