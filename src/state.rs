//! Persistence for sync resumption state and the processed-message set.
//!
//! Both live in the same SQLite database as the index so a chunk append
//! and its dedup-key record commit in one transaction.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::models::SyncState;

pub async fn load_sync_state(pool: &SqlitePool) -> Result<SyncState> {
    let row: Option<(i64, Option<i64>, i64)> = sqlx::query_as(
        "SELECT last_seq_id, last_sync_time, total_processed FROM sync_state WHERE id = 1",
    )
    .fetch_optional(pool)
    .await?;

    Ok(match row {
        Some((last_seq_id, last_sync_time, total_processed)) => SyncState {
            last_seq_id,
            last_sync_time,
            total_processed,
        },
        None => SyncState::default(),
    })
}

/// Writes the full state row. Called once per successful sync cycle.
pub async fn save_sync_state(pool: &SqlitePool, state: &SyncState) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_state (id, last_seq_id, last_sync_time, total_processed)
        VALUES (1, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            last_seq_id = excluded.last_seq_id,
            last_sync_time = excluded.last_sync_time,
            total_processed = excluded.total_processed
        "#,
    )
    .bind(state.last_seq_id)
    .bind(state.last_sync_time)
    .bind(state.total_processed)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn is_processed(pool: &SqlitePool, dedup_key: &str) -> Result<bool> {
    let exists: bool =
        sqlx::query_scalar("SELECT COUNT(*) > 0 FROM processed_messages WHERE dedup_key = ?")
            .bind(dedup_key)
            .fetch_one(pool)
            .await?;
    Ok(exists)
}

/// Records a dedup key. Takes any executor so the indexer can run it
/// inside the same transaction as the chunk append.
pub async fn mark_processed<'e, E>(executor: E, dedup_key: &str, seq_id: i64) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO processed_messages (dedup_key, seq_id, seen_at)
        VALUES (?, ?, unixepoch())
        ON CONFLICT(dedup_key) DO NOTHING
        "#,
    )
    .bind(dedup_key)
    .bind(seq_id)
    .execute(executor)
    .await?;
    Ok(())
}

/// Trims the processed set down to `cap` entries, oldest first. Returns
/// the number of evicted keys.
pub async fn evict_processed(pool: &SqlitePool, cap: usize) -> Result<u64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM processed_messages")
        .fetch_one(pool)
        .await?;
    let excess = count - cap as i64;
    if excess <= 0 {
        return Ok(0);
    }

    let result = sqlx::query(
        r#"
        DELETE FROM processed_messages WHERE dedup_key IN (
            SELECT dedup_key FROM processed_messages
            ORDER BY seen_at ASC, dedup_key ASC
            LIMIT ?
        )
        "#,
    )
    .bind(excess)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Clears resumption state and the processed set. Used by full resync;
/// indexed chunks are cleared separately by the indexer.
pub async fn reset(pool: &SqlitePool) -> Result<()> {
    sqlx::query("DELETE FROM sync_state").execute(pool).await?;
    sqlx::query("DELETE FROM processed_messages")
        .execute(pool)
        .await?;
    Ok(())
}
