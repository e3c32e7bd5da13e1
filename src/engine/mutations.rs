use tokio::sync::oneshot;
use ulid::Ulid;

use crate::model::*;

use super::admission::{admit_booking, admit_unavailability};
use super::conflict::{
    validate_capacity, validate_metadata, validate_schedule, validate_span, validate_text,
};
use super::{Engine, EngineError, Transaction, WalCommand};

/// How many times a record lookup is retried when the record moves to
/// another resource between the index lookup and the lock.
const RELOCK_ATTEMPTS: usize = 3;

impl Engine {
    // ── Resources ────────────────────────────────────────────

    /// Create an always-open resource.
    pub async fn create_resource(
        &self,
        id: Ulid,
        name: Option<String>,
        description: Option<String>,
        capacity: Option<u32>,
    ) -> Result<ResourceInfo, EngineError> {
        self.create_scheduled_resource(id, name, description, capacity, ScheduleInput::default())
            .await
    }

    pub async fn create_scheduled_resource(
        &self,
        id: Ulid,
        name: Option<String>,
        description: Option<String>,
        capacity: Option<u32>,
        schedule: ScheduleInput,
    ) -> Result<ResourceInfo, EngineError> {
        validate_text(name.as_deref(), self.config.max_name_len, "resource name too long")?;
        validate_text(
            description.as_deref(),
            self.config.max_description_len,
            "resource description too long",
        )?;
        let capacity = validate_capacity(capacity)?;
        let schedule =
            validate_schedule(schedule.timezone.as_deref(), &schedule.slots, &self.config)?;

        let catalog = self.catalog.clone().lock_owned().await;
        if self.store.resource_count() >= self.config.max_resources {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        let reservation = self.store.reserve_id(id).ok_or(EngineError::AlreadyExists(id))?;

        let mut txn = self.begin(&[]).await?;
        txn.hold_catalog(catalog);
        txn.hold_id(reservation);
        txn.stage(Event::ResourceCreated {
            id,
            name: name.clone(),
            description: description.clone(),
            capacity: capacity.limit(),
            schedule: schedule.clone(),
        });
        txn.commit().await?;

        tracing::debug!(
            "resource {id} created, capacity {:?}, {} slot(s)",
            capacity.limit(),
            schedule.slots.len()
        );
        Ok(ResourceInfo {
            id,
            name,
            description,
            capacity: capacity.limit(),
            schedule,
        })
    }

    /// Capacity changes never evict bookings: lowering capacity below the
    /// current occupancy only affects future admissions. Neither do schedule
    /// changes; they only shape reported availability.
    pub async fn update_resource(
        &self,
        id: Ulid,
        update: ResourceUpdate,
    ) -> Result<ResourceInfo, EngineError> {
        if let Some(name) = &update.name {
            validate_text(name.as_deref(), self.config.max_name_len, "resource name too long")?;
        }
        if let Some(description) = &update.description {
            validate_text(
                description.as_deref(),
                self.config.max_description_len,
                "resource description too long",
            )?;
        }
        let capacity = update.capacity.map(validate_capacity).transpose()?;

        let mut txn = self.begin(&[id]).await?;
        let rs = txn.resource_or_not_found(id)?;
        let schedule = if update.timezone.is_some() || update.slots.is_some() {
            let timezone = match update.timezone {
                Some(tz) => tz,
                None => Some(rs.schedule.timezone_label()),
            };
            let slots = update.slots.unwrap_or_else(|| rs.schedule.slot_inputs());
            validate_schedule(timezone.as_deref(), &slots, &self.config)?
        } else {
            rs.schedule.clone()
        };
        let info = ResourceInfo {
            id,
            name: update.name.unwrap_or_else(|| rs.name.clone()),
            description: update.description.unwrap_or_else(|| rs.description.clone()),
            capacity: capacity.unwrap_or(rs.capacity).limit(),
            schedule,
        };

        txn.stage(Event::ResourceUpdated {
            id,
            name: info.name.clone(),
            description: info.description.clone(),
            capacity: info.capacity,
            schedule: info.schedule.clone(),
        });
        txn.commit().await?;
        Ok(info)
    }

    pub async fn delete_resource(&self, id: Ulid) -> Result<(), EngineError> {
        let catalog = self.catalog.clone().lock_owned().await;
        let mut txn = self.begin(&[id]).await?;
        let rs = txn.resource_or_not_found(id)?;
        if !rs.intervals.is_empty() {
            return Err(EngineError::HasDependents(id));
        }
        txn.hold_catalog(catalog);
        txn.stage(Event::ResourceDeleted { id });
        txn.commit().await?;
        tracing::debug!("resource {id} deleted");
        Ok(())
    }

    // ── Bookings ─────────────────────────────────────────────

    pub async fn create_booking(
        &self,
        id: Ulid,
        resource_id: Ulid,
        span: Span,
        status: String,
        metadata: Metadata,
    ) -> Result<BookingInfo, EngineError> {
        validate_span(&span, &self.config)?;
        validate_text(Some(&status), self.config.max_status_len, "status too long")?;
        validate_metadata(&metadata, &self.config)?;

        let mut txn = self.begin(&[resource_id]).await?;
        self.check_new_record(&mut txn, id, resource_id)?;
        admit_booking(&txn, resource_id, &span, &[])?;

        txn.stage(Event::BookingCreated {
            id,
            resource_id,
            span,
            status: status.clone(),
            metadata: metadata.clone(),
        });
        txn.commit().await?;

        Ok(BookingInfo {
            id,
            resource_id,
            start: span.start,
            end: span.end,
            status,
            metadata,
        })
    }

    /// Admission runs only when the span changes; the booking never counts
    /// against itself.
    pub async fn update_booking(
        &self,
        id: Ulid,
        update: BookingUpdate,
    ) -> Result<BookingInfo, EngineError> {
        if let Some(span) = &update.span {
            validate_span(span, &self.config)?;
        }
        if let Some(status) = &update.status {
            validate_text(Some(status), self.config.max_status_len, "status too long")?;
        }
        if let Some(metadata) = &update.metadata {
            validate_metadata(metadata, &self.config)?;
        }

        let (resource_id, mut txn) = self.lock_record(id, RecordKind::Booking, None).await?;
        let current = txn
            .resource(resource_id)
            .and_then(|rs| rs.interval(id))
            .ok_or(EngineError::BookingNotFound(id))?;
        let IntervalKind::Booking { status, metadata } = &current.kind else {
            return Err(EngineError::BookingNotFound(id));
        };

        let span = update.span.unwrap_or(current.span);
        let status = update.status.unwrap_or_else(|| status.clone());
        let metadata = update.metadata.unwrap_or_else(|| metadata.clone());
        if span != current.span {
            admit_booking(&txn, resource_id, &span, &[id])?;
        }

        txn.stage(Event::BookingUpdated {
            id,
            resource_id,
            span,
            status: status.clone(),
            metadata: metadata.clone(),
        });
        txn.commit().await?;

        Ok(BookingInfo {
            id,
            resource_id,
            start: span.start,
            end: span.end,
            status,
            metadata,
        })
    }

    /// Deleting never needs admission. Returns the resource the booking was on.
    pub async fn delete_booking(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (resource_id, mut txn) = self.lock_record(id, RecordKind::Booking, None).await?;
        txn.stage(Event::BookingDeleted { id, resource_id });
        txn.commit().await?;
        Ok(resource_id)
    }

    // ── Unavailabilities ─────────────────────────────────────

    pub async fn create_unavailability(
        &self,
        id: Ulid,
        resource_id: Ulid,
        span: Span,
    ) -> Result<UnavailabilityInfo, EngineError> {
        validate_span(&span, &self.config)?;

        let mut txn = self.begin(&[resource_id]).await?;
        self.check_new_record(&mut txn, id, resource_id)?;
        admit_unavailability(&txn, resource_id, &span, &[])?;

        txn.stage(Event::UnavailabilityCreated {
            id,
            resource_id,
            span,
        });
        txn.commit().await?;

        Ok(UnavailabilityInfo {
            id,
            resource_id,
            start: span.start,
            end: span.end,
        })
    }

    /// Update in place, or move the window to another resource of the same
    /// organization. Both resources stay locked for the whole move.
    pub async fn update_unavailability(
        &self,
        id: Ulid,
        update: UnavailabilityUpdate,
    ) -> Result<UnavailabilityInfo, EngineError> {
        if let Some(span) = &update.span {
            validate_span(span, &self.config)?;
        }

        let (from_resource_id, mut txn) = self
            .lock_record(id, RecordKind::Unavailability, update.resource_id)
            .await?;
        let current_span = txn
            .resource(from_resource_id)
            .and_then(|rs| rs.interval(id))
            .map(|i| i.span)
            .ok_or(EngineError::UnavailabilityNotFound(id))?;

        let resource_id = update.resource_id.unwrap_or(from_resource_id);
        let target = txn.resource_or_not_found(resource_id)?;
        let moved = resource_id != from_resource_id;
        if moved && target.intervals.len() >= self.config.max_records_per_resource {
            return Err(EngineError::LimitExceeded("too many records on resource"));
        }

        let span = update.span.unwrap_or(current_span);
        if moved || span != current_span {
            admit_unavailability(&txn, resource_id, &span, &[id])?;
        }

        txn.stage(Event::UnavailabilityUpdated {
            id,
            from_resource_id,
            resource_id,
            span,
        });
        txn.commit().await?;

        if moved {
            tracing::debug!("unavailability {id} moved {from_resource_id} -> {resource_id}");
        }
        Ok(UnavailabilityInfo {
            id,
            resource_id,
            start: span.start,
            end: span.end,
        })
    }

    pub async fn delete_unavailability(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (resource_id, mut txn) = self
            .lock_record(id, RecordKind::Unavailability, None)
            .await?;
        txn.stage(Event::UnavailabilityDeleted { id, resource_id });
        txn.commit().await?;
        Ok(resource_id)
    }

    // ── Helpers ──────────────────────────────────────────────

    /// Shared checks before a new booking or unavailability is written.
    /// Claims `id` for the transaction, since only `resource_id` is locked
    /// and a create on another resource could race for the same id.
    fn check_new_record(
        &self,
        txn: &mut Transaction,
        id: Ulid,
        resource_id: Ulid,
    ) -> Result<(), EngineError> {
        let records = txn.resource_or_not_found(resource_id)?.intervals.len();
        let reservation = self.store.reserve_id(id).ok_or(EngineError::AlreadyExists(id))?;
        if records >= self.config.max_records_per_resource {
            return Err(EngineError::LimitExceeded("too many records on resource"));
        }
        txn.hold_id(reservation);
        Ok(())
    }

    /// Resolve record → resource and lock it (plus `also`, if given).
    /// Re-resolves when the record moved while we waited for the lock.
    async fn lock_record(
        &self,
        id: Ulid,
        kind: RecordKind,
        also: Option<Ulid>,
    ) -> Result<(Ulid, Transaction), EngineError> {
        let not_found = || match kind {
            RecordKind::Booking => EngineError::BookingNotFound(id),
            RecordKind::Unavailability => EngineError::UnavailabilityNotFound(id),
        };

        for _ in 0..RELOCK_ATTEMPTS {
            let resource_id = self
                .store
                .get_resource_for_entity(&id)
                .ok_or_else(not_found)?;
            let mut ids = vec![resource_id];
            ids.extend(also);

            let txn = self.begin(&ids).await?;
            let found = txn
                .resource(resource_id)
                .and_then(|rs| rs.interval(id))
                .map(|i| kind.matches(&i.kind));
            match found {
                Some(true) => return Ok((resource_id, txn)),
                Some(false) => return Err(not_found()),
                None => continue,
            }
        }
        Err(not_found())
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal event list that recreates current state.
    ///
    /// Holds the catalog lock and a read lock on every resource while the
    /// snapshot is written, so no commit can land between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;

        let mut guards = Vec::new();
        for id in self.store.resource_ids() {
            if let Some(rs) = self.store.get_resource(&id) {
                guards.push(rs.read_owned().await);
            }
        }

        let mut events = Vec::new();
        for rs in guards.iter().filter(|rs| !rs.deleted) {
            events.push(Event::ResourceCreated {
                id: rs.id,
                name: rs.name.clone(),
                description: rs.description.clone(),
                capacity: rs.capacity.limit(),
                schedule: rs.schedule.clone(),
            });
            for interval in &rs.intervals {
                events.push(match &interval.kind {
                    IntervalKind::Booking { status, metadata } => Event::BookingCreated {
                        id: interval.id,
                        resource_id: rs.id,
                        span: interval.span,
                        status: status.clone(),
                        metadata: metadata.clone(),
                    },
                    IntervalKind::Unavailability => Event::UnavailabilityCreated {
                        id: interval.id,
                        resource_id: rs.id,
                        span: interval.span,
                    },
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        drop(guards);
        tracing::debug!("WAL compacted to {count} event(s)");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
