mod admission;
mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;
mod txn;

pub use admission::{
    check_booking_admission, check_unavailability_admission, AdmissionStore, Conflict, Decision,
};
pub use availability::{free_windows, merge_overlapping, subtract_intervals};
pub use error::{EngineError, ErrorKind};
pub use store::{SharedResourceState, Store};
pub use txn::Transaction;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::model::*;
use crate::wal::Wal;

use store::LockedResources;

// ── Group-commit WAL channel ─────────────────────────────

pub(crate) enum WalCommand {
    /// All events of one committed transaction.
    Append {
        events: Vec<Event>,
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

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain all immediately available Appends (the batch window).
/// 3. Write the batch all-or-nothing with a single fsync.
/// 4. Respond to all senders with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            // Flush what we have before the non-append command runs.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                if let Err(e) = &result {
                    tracing::error!("WAL flush failed for {} transaction(s): {e}", batch.len());
                }
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!("WAL writer stopped: {}", wal.path().display());
}

/// Write the whole batch with one fsync. On failure the WAL has cut the file
/// back, so every caller in the batch is told it failed and none replays.
fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    wal.append_batch(batch.iter().map(|(events, _)| events.as_slice()))
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

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { events, response } => {
            let result = wal.append(&events);
            let _ = response.send(result);
        }
    }
}

/// Send one transaction's events to the group-commit writer and wait until
/// they are on disk.
async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, events: Vec<Event>) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append {
            events,
            response: tx,
        })
        .await
        .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::WalError(e.to_string()))
}

/// One organization's booking engine.
pub struct Engine {
    pub(crate) store: Arc<Store>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub config: EngineConfig,
    /// Serializes resource creation/deletion and compaction. Creates and
    /// deletes hand the guard to their transaction so it outlives the apply.
    catalog: Arc<Mutex<()>>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, config: EngineConfig) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Arc::new(Store::new());

        // Replay: we are the sole owner of every lock, so try_write_owned
        // succeeds without waiting. Never block here: this may run inside
        // an async context (lazy tenant creation).
        for event in &events {
            let mut locked = LockedResources::new();
            for id in event.resource_ids() {
                if let Some(rs) = store.get_resource(&id) {
                    let guard = rs.try_write_owned().map_err(|_| {
                        io::Error::other(format!("replay: resource {id} unexpectedly locked"))
                    })?;
                    locked.insert(id, guard);
                }
            }
            store.apply_event(&mut locked, event);
        }

        tracing::debug!(
            "replayed {} event(s) into {} resource(s) from {}",
            events.len(),
            store.resource_count(),
            wal_path.display()
        );

        Ok(Self {
            store,
            wal_tx,
            config,
            catalog: Arc::new(Mutex::new(())),
        })
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.store.get_resource(id)
    }

    pub fn get_resource_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.store.get_resource_for_entity(entity_id)
    }
}
