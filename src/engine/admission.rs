//! Admission control: may a candidate window be written to a resource?
//!
//! The controllers are stateless and synchronous. They read only through an
//! [`AdmissionStore`], which in production is a [`Transaction`] holding the
//! resource's write lock, so the count they see cannot change before the
//! write they guard is committed.
//!
//! [`Transaction`]: super::Transaction

use ulid::Ulid;

use crate::model::{Capacity, RecordKind, Span};
use crate::observability;

use super::EngineError;

/// Read access the controllers need from the enclosing transaction.
pub trait AdmissionStore {
    /// `None` when the resource does not exist.
    fn resource_capacity(&self, resource_id: Ulid) -> Option<Capacity>;

    /// Records of `kind` on the resource overlapping `span`, skipping `exclude`.
    fn count_overlapping(
        &self,
        resource_id: Ulid,
        kind: RecordKind,
        span: &Span,
        exclude: &[Ulid],
    ) -> Result<usize, EngineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admitted,
    Rejected(Conflict),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    /// `overlapping` bookings already fill all `capacity` slots.
    Capacity { capacity: u32, overlapping: usize },
    Unavailability { overlapping: usize },
}

impl Conflict {
    pub fn into_error(self, resource_id: Ulid) -> EngineError {
        match self {
            Conflict::Capacity { overlapping, .. } => EngineError::BookingConflict {
                resource_id,
                overlapping,
            },
            Conflict::Unavailability { overlapping } => EngineError::UnavailabilityConflict {
                resource_id,
                overlapping,
            },
        }
    }
}

/// Booking admission: reject once the overlapping bookings reach capacity.
pub fn check_booking_admission(
    store: &impl AdmissionStore,
    resource_id: Ulid,
    span: &Span,
    exclude: &[Ulid],
) -> Result<Decision, EngineError> {
    let capacity = store
        .resource_capacity(resource_id)
        .ok_or(EngineError::ResourceNotFound(resource_id))?;

    let Capacity::Limited(limit) = capacity else {
        return Ok(Decision::Admitted);
    };

    let overlapping = store.count_overlapping(resource_id, RecordKind::Booking, span, exclude)?;
    if capacity.admits(overlapping) {
        Ok(Decision::Admitted)
    } else {
        Ok(Decision::Rejected(Conflict::Capacity {
            capacity: limit.get(),
            overlapping,
        }))
    }
}

/// Unavailability admission: windows on one resource never overlap each other.
pub fn check_unavailability_admission(
    store: &impl AdmissionStore,
    resource_id: Ulid,
    span: &Span,
    exclude: &[Ulid],
) -> Result<Decision, EngineError> {
    if store.resource_capacity(resource_id).is_none() {
        return Err(EngineError::ResourceNotFound(resource_id));
    }

    let overlapping =
        store.count_overlapping(resource_id, RecordKind::Unavailability, span, exclude)?;
    if overlapping > 0 {
        Ok(Decision::Rejected(Conflict::Unavailability { overlapping }))
    } else {
        Ok(Decision::Admitted)
    }
}

/// Full gate for writing a booking: the window must be clear of
/// unavailability and the resource must have a free slot.
pub(crate) fn admit_booking(
    store: &impl AdmissionStore,
    resource_id: Ulid,
    span: &Span,
    exclude: &[Ulid],
) -> Result<(), EngineError> {
    if store.resource_capacity(resource_id).is_none() {
        return Err(EngineError::ResourceNotFound(resource_id));
    }
    let blocked = store.count_overlapping(resource_id, RecordKind::Unavailability, span, &[])?;
    if blocked > 0 {
        record(RecordKind::Booking, "unavailable");
        return Err(EngineError::UnavailabilityConflict {
            resource_id,
            overlapping: blocked,
        });
    }

    match check_booking_admission(store, resource_id, span, exclude)? {
        Decision::Admitted => {
            record(RecordKind::Booking, "admitted");
            Ok(())
        }
        Decision::Rejected(conflict) => {
            record(RecordKind::Booking, "rejected");
            Err(conflict.into_error(resource_id))
        }
    }
}

/// Full gate for writing an unavailability: no other window on the resource
/// may overlap it, and neither may any existing booking.
pub(crate) fn admit_unavailability(
    store: &impl AdmissionStore,
    resource_id: Ulid,
    span: &Span,
    exclude: &[Ulid],
) -> Result<(), EngineError> {
    if let Decision::Rejected(conflict) =
        check_unavailability_admission(store, resource_id, span, exclude)?
    {
        record(RecordKind::Unavailability, "rejected");
        return Err(conflict.into_error(resource_id));
    }

    let booked = store.count_overlapping(resource_id, RecordKind::Booking, span, &[])?;
    if booked > 0 {
        record(RecordKind::Unavailability, "booked");
        return Err(EngineError::BookingConflict {
            resource_id,
            overlapping: booked,
        });
    }

    record(RecordKind::Unavailability, "admitted");
    Ok(())
}

fn record(kind: RecordKind, outcome: &'static str) {
    metrics::counter!(observability::ADMISSIONS_TOTAL, "kind" => kind.label(), "outcome" => outcome)
        .increment(1);
}
