//! Background sync engine.
//!
//! One tokio task cycles through: connect, drain the mailbox in batches,
//! index, persist resumption state, disconnect, sleep. Connections are
//! opened fresh each cycle and dropped between cycles so server idle
//! timeouts never bite. Connection-level errors put the engine into an
//! error phase with a visible retry countdown; it reconnects after the
//! backoff with all committed progress intact.
//!
//! Stop and status both travel over `tokio::sync::watch`: every wait
//! point selects over the stop signal, so shutdown is prompt without
//! cancelling a transaction mid-flight.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::models::{IndexReport, SyncState};
use crate::service::ServiceContext;
use crate::state;
use crate::transport::{MailTransport, ResumePoint};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Syncing,
    Error {
        retry_in_secs: u64,
    },
}

/// Snapshot published through the status channel after every change.
#[derive(Debug, Clone, Default)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub cycles_completed: u64,
    pub messages_indexed: u64,
    pub messages_skipped: u64,
    pub messages_rejected: u64,
    pub messages_failed: u64,
    pub chunks_added: u64,
    pub last_error: Option<String>,
}

/// Outcome of one complete sync cycle.
#[derive(Debug)]
pub struct CycleReport {
    pub fetched: u64,
    pub last_seq_id: i64,
    pub report: IndexReport,
}

pub struct SyncHandle {
    stop_tx: watch::Sender<bool>,
    status_rx: watch::Receiver<SyncStatus>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub fn status(&self) -> SyncStatus {
        self.status_rx.borrow().clone()
    }

    pub fn status_receiver(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    /// Signals the engine to stop and waits for the task to finish. Any
    /// in-flight message transaction completes first.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}

/// Starts the background engine. The returned handle is the only way to
/// observe or stop it.
pub fn spawn(ctx: Arc<ServiceContext>, transport: Arc<dyn MailTransport>) -> SyncHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let (status_tx, status_rx) = watch::channel(SyncStatus::default());

    let task = tokio::spawn(engine_loop(ctx, transport, status_tx, stop_rx));

    SyncHandle {
        stop_tx,
        status_rx,
        task,
    }
}

/// Runs exactly one cycle against the given transport. Used by the CLI
/// `sync` command; the background engine wraps the same cycle logic.
pub async fn run_once(ctx: &ServiceContext, transport: &dyn MailTransport) -> Result<CycleReport> {
    let (_stop_tx, stop_rx) = watch::channel(false);
    let (status_tx, _status_rx) = watch::channel(SyncStatus::default());
    run_cycle(ctx, transport, &status_tx, &stop_rx).await
}

async fn engine_loop(
    ctx: Arc<ServiceContext>,
    transport: Arc<dyn MailTransport>,
    status_tx: watch::Sender<SyncStatus>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        if *stop_rx.borrow() {
            break;
        }

        match run_cycle(&ctx, transport.as_ref(), &status_tx, &stop_rx).await {
            Ok(cycle) => {
                tracing::info!(
                    fetched = cycle.fetched,
                    indexed = cycle.report.indexed_messages,
                    skipped = cycle.report.skipped_messages,
                    rejected = cycle.report.rejected_messages,
                    failed = cycle.report.failed_messages,
                    chunks = cycle.report.added_chunks,
                    "sync cycle complete"
                );
                status_tx.send_modify(|s| {
                    s.phase = SyncPhase::Disconnected;
                    s.cycles_completed += 1;
                    s.last_error = None;
                });
                let interval = Duration::from_secs(ctx.config.sync.interval_secs);
                if wait_or_stop(&mut stop_rx, interval).await {
                    break;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "sync cycle failed");
                status_tx.send_modify(|s| s.last_error = Some(e.to_string()));
                // Countdown in one-second steps so observers see the
                // remaining backoff tick down.
                let backoff = ctx.config.sync.error_backoff_secs.max(1);
                let mut stopped = false;
                for remaining in (1..=backoff).rev() {
                    status_tx.send_modify(|s| {
                        s.phase = SyncPhase::Error {
                            retry_in_secs: remaining,
                        };
                    });
                    if wait_or_stop(&mut stop_rx, Duration::from_secs(1)).await {
                        stopped = true;
                        break;
                    }
                }
                if stopped {
                    break;
                }
            }
        }
    }
    status_tx.send_modify(|s| s.phase = SyncPhase::Disconnected);
}

/// Sleeps for `duration` unless the stop signal fires first. Returns
/// `true` when the engine should stop.
async fn wait_or_stop(stop_rx: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => *stop_rx.borrow(),
        changed = stop_rx.changed() => changed.is_err() || *stop_rx.borrow(),
    }
}

async fn run_cycle(
    ctx: &ServiceContext,
    transport: &dyn MailTransport,
    status_tx: &watch::Sender<SyncStatus>,
    stop_rx: &watch::Receiver<bool>,
) -> Result<CycleReport> {
    status_tx.send_modify(|s| s.phase = SyncPhase::Connecting);

    let prior = state::load_sync_state(&ctx.pool).await?;
    let indexer = ctx.indexer();
    indexer.ensure_compatible_index().await?;

    let mut conn = transport.connect().await?;
    status_tx.send_modify(|s| s.phase = SyncPhase::Connected);

    let mut resume = if prior.last_seq_id > 0 {
        ResumePoint::SeqAfter(prior.last_seq_id)
    } else {
        let window = chrono::Duration::days(ctx.config.sync.initial_window_days);
        ResumePoint::Since(Utc::now() - window)
    };
    let mut last_seq = prior.last_seq_id;
    let mut report = IndexReport::default();
    let mut fetched = 0u64;
    let batch_size = ctx.config.sync.batch_size;

    let drained = async {
        loop {
            if *stop_rx.borrow() {
                break;
            }

            status_tx.send_modify(|s| s.phase = SyncPhase::Syncing);
            let batch = conn.fetch_batch(&resume, batch_size).await?;
            if batch.is_empty() {
                status_tx.send_modify(|s| s.phase = SyncPhase::Connected);
                break;
            }
            fetched += batch.len() as u64;

            let batch_report = indexer.index_batch(&batch).await;
            status_tx.send_modify(|s| {
                s.messages_indexed += batch_report.indexed_messages;
                s.messages_skipped += batch_report.skipped_messages;
                s.messages_rejected += batch_report.rejected_messages;
                s.messages_failed += batch_report.failed_messages;
                s.chunks_added += batch_report.added_chunks;
            });
            report.absorb(batch_report);

            if let Some(max_seq) = batch.iter().map(|m| m.seq_id).max() {
                last_seq = last_seq.max(max_seq);
            }
            resume = ResumePoint::SeqAfter(last_seq);
            status_tx.send_modify(|s| s.phase = SyncPhase::Connected);

            if batch.len() < batch_size {
                break;
            }
            conn.keepalive().await?;
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    // The connection is released whether the drain succeeded or not;
    // close failures are not actionable either way.
    let _ = conn.close().await;
    drained?;

    let next = SyncState {
        last_seq_id: last_seq,
        last_sync_time: Some(Utc::now().timestamp()),
        total_processed: prior.total_processed + report.indexed_messages as i64,
    };
    state::save_sync_state(&ctx.pool, &next).await?;
    state::evict_processed(&ctx.pool, ctx.config.sync.processed_cap).await?;

    status_tx.send_modify(|s| s.phase = SyncPhase::Disconnected);
    Ok(CycleReport {
        fetched,
        last_seq_id: last_seq,
        report,
    })
}
