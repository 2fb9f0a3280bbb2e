//! Mail transport abstraction.
//!
//! The sync engine talks to a mailbox only through [`MailTransport`] and
//! [`MailConnection`]; protocol details (IMAP, JMAP, exports) live behind
//! the trait. In-tree there is one implementation, [`JsonFileTransport`],
//! which serves messages from a `.json` or `.jsonl` export file.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::RawMessage;

/// Where a fetch should resume.
#[derive(Debug, Clone, Copy)]
pub enum ResumePoint {
    /// Messages with a sequence id strictly greater than this.
    SeqAfter(i64),
    /// First run: messages received since this instant.
    Since(DateTime<Utc>),
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Opens a fresh connection. Called once per sync cycle; the engine
    /// never holds a connection across cycles.
    async fn connect(&self) -> Result<Box<dyn MailConnection>>;
}

#[async_trait]
pub trait MailConnection: Send {
    /// Fetches up to `max` messages past the resume point, in ascending
    /// sequence order. An empty result means the mailbox is drained.
    async fn fetch_batch(&mut self, resume: &ResumePoint, max: usize) -> Result<Vec<RawMessage>>;

    /// Server keepalive between batches (IMAP NOOP equivalent).
    async fn keepalive(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

// ============ JSON file transport ============

/// Serves messages from a JSON export: either a top-level array or one
/// record per line (JSONL). Field names follow the export format
/// (`from`, `uid`), with our own names accepted too.
pub struct JsonFileTransport {
    path: PathBuf,
}

impl JsonFileTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl MailTransport for JsonFileTransport {
    async fn connect(&self) -> Result<Box<dyn MailConnection>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read mail export: {}", self.path.display()))?;
        let mut messages = parse_export(&content, &self.path)?;
        messages.sort_by_key(|m| m.seq_id);
        Ok(Box::new(JsonFileConnection { messages }))
    }
}

fn parse_export(content: &str, path: &Path) -> Result<Vec<RawMessage>> {
    let records: Vec<JsonMailRecord> = if content.trim_start().starts_with('[') {
        serde_json::from_str(content)
            .with_context(|| format!("Invalid JSON array in {}", path.display()))?
    } else {
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .enumerate()
            .map(|(i, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("Invalid JSONL record at line {} of {}", i + 1, path.display()))
            })
            .collect::<Result<Vec<_>>>()?
    };
    Ok(records.into_iter().map(JsonMailRecord::into_raw).collect())
}

#[derive(Debug, Deserialize)]
struct JsonMailRecord {
    #[serde(default, alias = "from")]
    sender: String,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    date: String,
    #[serde(alias = "uid")]
    seq_id: i64,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default = "default_folder")]
    folder: String,
}

fn default_folder() -> String {
    "INBOX".to_string()
}

impl JsonMailRecord {
    fn into_raw(self) -> RawMessage {
        RawMessage {
            sender: self.sender,
            subject: self.subject,
            body: self.body,
            date: self.date,
            seq_id: self.seq_id,
            message_id: self.message_id,
            folder: self.folder,
        }
    }
}

struct JsonFileConnection {
    messages: Vec<RawMessage>,
}

#[async_trait]
impl MailConnection for JsonFileConnection {
    async fn fetch_batch(&mut self, resume: &ResumePoint, max: usize) -> Result<Vec<RawMessage>> {
        let after = match resume {
            ResumePoint::SeqAfter(seq) => *seq,
            // Export files carry no reliable receive timestamps; a
            // since-window resume serves from the beginning and dedup
            // keeps replays harmless.
            ResumePoint::Since(_) => i64::MIN,
        };
        Ok(self
            .messages
            .iter()
            .filter(|m| m.seq_id > after)
            .take(max)
            .cloned()
            .collect())
    }

    async fn keepalive(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
