//! Index and sync statistics overview.
//!
//! A quick summary of what's indexed: message and chunk counts, embedding
//! coverage, per-folder breakdowns, and sync progress. Used by
//! `mailseek stats` to give confidence that sync and embedding are
//! working as expected.

use anyhow::Result;
use sqlx::Row;

use crate::service::ServiceContext;
use crate::state;

/// Per-folder breakdown of message and chunk counts.
struct FolderStats {
    folder: String,
    message_count: i64,
    chunk_count: i64,
    embedded_count: i64,
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(ctx: &ServiceContext) -> Result<()> {
    let pool = &ctx.pool;

    let total_messages: i64 =
        sqlx::query_scalar("SELECT COUNT(DISTINCT message_key) FROM chunks")
            .fetch_one(pool)
            .await?;

    let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(pool)
        .await?;

    let total_embedded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
        .fetch_one(pool)
        .await?;

    let processed_keys: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM processed_messages")
        .fetch_one(pool)
        .await?;

    let avg_quality: Option<f64> =
        sqlx::query_scalar("SELECT AVG(quality_overall) FROM chunks")
            .fetch_one(pool)
            .await?;

    let index_meta: Option<(String, i64)> =
        sqlx::query_as("SELECT model, dims FROM index_meta WHERE id = 1")
            .fetch_optional(pool)
            .await?;

    let sync_state = state::load_sync_state(pool).await?;

    let db_size = std::fs::metadata(&ctx.config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Mailseek — Index Stats");
    println!("======================");
    println!();
    println!("  Database:    {}", ctx.config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Messages:    {}", total_messages);
    println!("  Chunks:      {}", total_chunks);
    println!(
        "  Embedded:    {} / {} ({}%)",
        total_embedded,
        total_chunks,
        if total_chunks > 0 {
            (total_embedded * 100) / total_chunks
        } else {
            0
        }
    );
    if let Some(avg) = avg_quality {
        println!("  Avg quality: {:.1}", avg);
    }
    match index_meta {
        Some((model, dims)) => println!("  Embedder:    {} ({} dims)", model, dims),
        None => println!("  Embedder:    none (keyword-only index)"),
    }

    // Per-folder breakdown
    let folder_rows = sqlx::query(
        r#"
        SELECT
            c.folder,
            COUNT(DISTINCT c.message_key) AS message_count,
            COUNT(DISTINCT c.id) AS chunk_count,
            COUNT(DISTINCT cv.chunk_id) AS embedded_count
        FROM chunks c
        LEFT JOIN chunk_vectors cv ON cv.chunk_id = c.id
        GROUP BY c.folder
        ORDER BY message_count DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let folder_stats: Vec<FolderStats> = folder_rows
        .iter()
        .map(|row| FolderStats {
            folder: row.get("folder"),
            message_count: row.get("message_count"),
            chunk_count: row.get("chunk_count"),
            embedded_count: row.get("embedded_count"),
        })
        .collect();

    if !folder_stats.is_empty() {
        println!();
        println!("  By folder:");
        println!(
            "  {:<24} {:>9} {:>8} {:>10}",
            "FOLDER", "MESSAGES", "CHUNKS", "EMBEDDED"
        );
        println!("  {}", "-".repeat(56));
        for f in &folder_stats {
            println!(
                "  {:<24} {:>9} {:>8} {:>10}",
                f.folder, f.message_count, f.chunk_count, f.embedded_count
            );
        }
    }

    println!();
    println!("  Sync:");
    println!("    Last seq id:     {}", sync_state.last_seq_id);
    println!(
        "    Last sync:       {}",
        match sync_state.last_sync_time {
            Some(ts) => format_ts_relative(ts),
            None => "never".to_string(),
        }
    );
    println!("    Total processed: {}", sync_state.total_processed);
    println!("    Dedup keys held: {}", processed_keys);
    println!();

    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
