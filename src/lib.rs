//! # Mailseek
//!
//! A local-first email retrieval pipeline: messages are cleaned and
//! quality-scored, chunked along their structural boundaries, indexed
//! into SQLite (FTS5 for keywords, embedding BLOBs for semantics), and
//! served through hybrid search with optional reranking. A background
//! sync engine keeps the index fresh against a mail source.
//!
//! The crate is both a library and the `mailseek` CLI binary. The CLI
//! drives the same public modules; nothing in the pipeline is
//! binary-private.

pub mod chunker;
pub mod clean;
pub mod config;
pub mod db;
pub mod embedding;
pub mod indexer;
pub mod migrate;
pub mod models;
pub mod quality;
pub mod rerank;
pub mod search;
pub mod service;
pub mod state;
pub mod stats;
pub mod sync;
pub mod transport;
