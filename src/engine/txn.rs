use std::sync::Arc;

use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::model::*;

use super::admission::AdmissionStore;
use super::conflict;
use super::store::{IdReservation, LockedResources, Store};
use super::{wal_append, Engine, EngineError, WalCommand};

/// A unit of work over a fixed set of resources.
///
/// Holds the write lock of every resource it was opened on until it is
/// committed or dropped. Writes are staged and only become durable and
/// visible in [`Transaction::commit`]; dropping an uncommitted transaction
/// discards them.
pub struct Transaction {
    store: Arc<Store>,
    wal_tx: mpsc::Sender<WalCommand>,
    locked: LockedResources,
    staged: Vec<Event>,
    /// Released only after the commit is applied, or on rollback.
    reservations: Vec<IdReservation>,
    catalog: Option<OwnedMutexGuard<()>>,
    cancel: CancellationToken,
    deadline: Instant,
}

impl Engine {
    pub async fn begin(&self, resource_ids: &[Ulid]) -> Result<Transaction, EngineError> {
        self.begin_with_cancel(resource_ids, CancellationToken::new()).await
    }

    /// Lock `resource_ids` in ascending order. Ids that do not exist (or are
    /// deleted while we wait) are skipped; lookups on them report not-found.
    pub async fn begin_with_cancel(
        &self,
        resource_ids: &[Ulid],
        cancel: CancellationToken,
    ) -> Result<Transaction, EngineError> {
        let deadline = Instant::now() + self.config.txn_timeout;

        let mut ids = resource_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mut locked = LockedResources::new();
        for id in ids {
            let Some(rs) = self.store.get_resource(&id) else {
                continue;
            };
            let guard = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    metrics::counter!(crate::observability::TXN_TIMEOUTS_TOTAL).increment(1);
                    return Err(EngineError::TimedOut);
                }
                guard = rs.write_owned() => guard,
            };
            if guard.deleted {
                continue;
            }
            locked.insert(id, guard);
        }

        Ok(Transaction {
            store: self.store.clone(),
            wal_tx: self.wal_tx.clone(),
            locked,
            staged: Vec::new(),
            reservations: Vec::new(),
            catalog: None,
            cancel,
            deadline,
        })
    }
}

impl Transaction {
    /// Locked state of a resource, as of the last commit.
    pub fn resource(&self, id: Ulid) -> Option<&ResourceState> {
        self.locked.get(&id).map(|g| &**g)
    }

    pub fn resource_or_not_found(&self, id: Ulid) -> Result<&ResourceState, EngineError> {
        self.resource(id).ok_or(EngineError::ResourceNotFound(id))
    }

    pub fn stage(&mut self, event: Event) {
        self.staged.push(event);
    }

    pub fn staged(&self) -> &[Event] {
        &self.staged
    }

    pub(crate) fn hold_id(&mut self, reservation: IdReservation) {
        self.reservations.push(reservation);
    }

    /// Keep the catalog locked until this transaction is applied or dropped.
    pub(crate) fn hold_catalog(&mut self, guard: OwnedMutexGuard<()>) {
        self.catalog = Some(guard);
    }

    /// Make every staged event durable, then visible, as one unit.
    ///
    /// Once started, the write runs on its own task: if the caller is
    /// dropped mid-commit the WAL append and the in-memory apply still
    /// finish together, and the locks are released afterwards.
    pub async fn commit(self) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if Instant::now() >= self.deadline {
            metrics::counter!(crate::observability::TXN_TIMEOUTS_TOTAL).increment(1);
            return Err(EngineError::TimedOut);
        }
        if self.staged.is_empty() {
            return Ok(());
        }

        let outside = self
            .staged
            .iter()
            .filter(|e| !matches!(e, Event::ResourceCreated { .. }))
            .flat_map(Event::resource_ids)
            .find(|id| !self.locked.contains_key(id));
        if let Some(id) = outside {
            return Err(EngineError::Internal(format!(
                "event touches resource {id} outside the transaction"
            )));
        }

        let Transaction {
            store,
            wal_tx,
            mut locked,
            staged,
            reservations,
            catalog,
            ..
        } = self;

        let task = tokio::spawn(async move {
            wal_append(&wal_tx, staged.clone()).await?;
            for event in &staged {
                store.apply_event(&mut locked, event);
            }
            drop(reservations);
            drop(catalog);
            Ok::<(), EngineError>(())
        });

        task.await
            .map_err(|e| EngineError::Internal(format!("commit task failed: {e}")))?
    }
}

impl AdmissionStore for Transaction {
    fn resource_capacity(&self, resource_id: Ulid) -> Option<Capacity> {
        self.resource(resource_id).map(|rs| rs.capacity)
    }

    fn count_overlapping(
        &self,
        resource_id: Ulid,
        kind: RecordKind,
        span: &Span,
        exclude: &[Ulid],
    ) -> Result<usize, EngineError> {
        let rs = self.resource(resource_id).ok_or_else(|| {
            EngineError::Internal(format!("resource {resource_id} is not locked by this transaction"))
        })?;
        Ok(conflict::count_overlapping(rs, kind, span, exclude))
    }
}
