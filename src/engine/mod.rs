mod allocation;
mod error;
mod mutations;
mod queries;
mod store;
mod validate;
#[cfg(test)]
mod tests;

pub use allocation::{
    CancellationPlan, decide_placement, next_in_line, plan_cancellation, plan_renumber,
    waitlist_order,
};
pub use error::EngineError;
pub use store::{BookingStore, SharedSlotState};

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{error, info, warn};

use crate::config::{AllocatorConfig, MAX_CONCURRENT_BOOKINGS_KEY};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until a command arrives.
/// 2. For an Append, drain every Append already queued behind it.
/// 3. One flush_sync for the whole batch, then answer every sender.
/// 4. A control command found while draining runs right after the flush.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut deferred: Option<WalCommand> = None;
    loop {
        let cmd = match deferred.take() {
            Some(cmd) => cmd,
            None => match rx.recv().await {
                Some(cmd) => cmd,
                None => break,
            },
        };
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WalCommand::Append { event, response } => batch.push((event, response)),
                        control => {
                            deferred = Some(control);
                            break;
                        }
                    }
                }
                metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);
            }
            WalCommand::Compact { events, response } => {
                let result = Wal::write_compact_file(wal.path(), &events)
                    .and_then(|()| wal.swap_compact_file());
                let _ = response.send(result);
            }
            WalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(wal.appends_since_compact());
            }
        }
    }
}

/// All or nothing: a failed batch is cut back out of the file, so every
/// sender answered with an error is also absent on replay.
fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = &result {
        warn!(records = batch.len(), "WAL batch failed, rolling back: {e}");
        if let Err(rollback_err) = wal.rollback() {
            error!(path = %wal.path().display(), "WAL rollback failed: {rollback_err}");
        }
    }
    result
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// Run `attempt` until it stops reporting a write conflict, at most
/// `max_attempts` times. The flag passed to `attempt` is set on the final
/// try, which should decide under the slot's write lock so that contention
/// alone cannot exhaust the budget. A conflict on that try still surfaces
/// as `Transient`.
pub async fn retry_on_conflict<T, F, Fut>(
    max_attempts: u32,
    op: &'static str,
    mut attempt: F,
) -> Result<T, EngineError>
where
    F: FnMut(bool) -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let max_attempts = max_attempts.max(1);
    for n in 1..=max_attempts {
        match attempt(n == max_attempts).await {
            Err(EngineError::WriteConflict(key)) => {
                metrics::counter!(observability::WRITE_CONFLICTS_TOTAL, "op" => op).increment(1);
                warn!(%key, attempt = n, "{op}: write conflict");
            }
            other => return other,
        }
    }
    Err(EngineError::Transient(format!(
        "{op}: gave up after {max_attempts} conflicting attempts"
    )))
}

/// Slot mutations decide under the slot's read lock and commit under its
/// write lock only if the slot version has not moved in between. The last
/// retry decides under the write lock instead.
///
/// Lock order: user window mutex, then commit gate (shared), then the slot's
/// lock. Directory writes take the commit gate, then `directory_lock`.
/// Compaction takes the commit gate exclusively so no append can land
/// between its snapshot and the file swap.
pub struct Engine {
    pub(super) store: BookingStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) config: AllocatorConfig,
    pub(super) commit_gate: RwLock<()>,
    pub(super) directory_lock: Mutex<()>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        config: AllocatorConfig,
    ) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let store = BookingStore::from_events(&events);
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        info!(
            path = %wal_path.display(),
            events = events.len(),
            resources = store.resource_count(),
            "engine replayed WAL"
        );

        Ok(Self {
            store,
            wal_tx,
            notify,
            config,
            commit_gate: RwLock::new(()),
            directory_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> AllocatorConfig {
        self.config
    }

    /// The stored setting, or the configured default when it was never written.
    pub fn max_concurrent_bookings(&self) -> u32 {
        self.store
            .setting(MAX_CONCURRENT_BOOKINGS_KEY)
            .unwrap_or(self.config.default_max_concurrent)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Transient("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Transient("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Transient(e.to_string()))
    }

    /// Conditional commit: persist and apply `event` only if the slot is still
    /// at `expected_version`. The caller holds the slot's write lock.
    pub(super) async fn commit(
        &self,
        slot: &mut SlotState,
        expected_version: u64,
        event: &Event,
    ) -> Result<(), EngineError> {
        if slot.version != expected_version {
            return Err(EngineError::WriteConflict(slot.key));
        }
        self.wal_append(event).await?;
        self.store.apply_booking_event(slot, event);
        Ok(())
    }

    /// WAL-append + apply for resource and settings events.
    pub(super) async fn persist_directory(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_directory_event(event);
        Ok(())
    }
}
