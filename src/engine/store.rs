use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

/// Write guards held by a transaction, keyed (and therefore ordered) by resource id.
pub(crate) type LockedResources = BTreeMap<Ulid, OwnedRwLockWriteGuard<ResourceState>>;

/// One organization's resources plus the record → resource index.
pub struct Store {
    resources: DashMap<Ulid, SharedResourceState>,
    /// Booking / unavailability id → owning resource id.
    entity_to_resource: DashMap<Ulid, Ulid>,
    /// Ids claimed by creates that have not committed yet.
    reserved_ids: Arc<DashSet<Ulid>>,
}

/// Claim on an id for one pending create. Released on drop.
pub struct IdReservation {
    reserved: Arc<DashSet<Ulid>>,
    id: Ulid,
}

impl Drop for IdReservation {
    fn drop(&mut self) {
        self.reserved.remove(&self.id);
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            entity_to_resource: DashMap::new(),
            reserved_ids: Arc::new(DashSet::new()),
        }
    }

    // ── Resources ────────────────────────────────────────────

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn contains_resource(&self, id: &Ulid) -> bool {
        self.resources.contains_key(id)
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    /// Sorted, so callers that lock several resources always agree on the order.
    pub fn resource_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.resources.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    // ── Entity index ─────────────────────────────────────────

    pub fn get_resource_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_resource.get(entity_id).map(|e| *e.value())
    }

    pub fn contains_entity(&self, entity_id: &Ulid) -> bool {
        self.entity_to_resource.contains_key(entity_id)
    }

    /// Claim `id` for a new resource or record. `None` when the id is taken
    /// or another create holds it. The claim must outlive the apply of the
    /// create, so a second create always sees either the claim or the entry.
    pub fn reserve_id(&self, id: Ulid) -> Option<IdReservation> {
        if !self.reserved_ids.insert(id) {
            return None;
        }
        let reservation = IdReservation {
            reserved: self.reserved_ids.clone(),
            id,
        };
        if self.contains_entity(&id) || self.contains_resource(&id) {
            return None;
        }
        Some(reservation)
    }

    fn map_entity(&self, entity_id: Ulid, resource_id: Ulid) {
        self.entity_to_resource.insert(entity_id, resource_id);
    }

    fn unmap_entity(&self, entity_id: &Ulid) {
        self.entity_to_resource.remove(entity_id);
    }

    // ── Event application ────────────────────────────────────

    /// Apply a committed event. Every resource the event touches other than
    /// a newly created one must be present in `locked`.
    pub(crate) fn apply_event(&self, locked: &mut LockedResources, event: &Event) {
        match event {
            Event::ResourceCreated {
                id,
                name,
                description,
                capacity,
                schedule,
            } => {
                let capacity = Capacity::from_limit(*capacity).unwrap_or(Capacity::Unlimited);
                let mut rs = ResourceState::new(*id, name.clone(), description.clone(), capacity);
                rs.schedule = schedule.clone();
                self.resources.insert(*id, Arc::new(RwLock::new(rs)));
            }
            Event::ResourceUpdated {
                id,
                name,
                description,
                capacity,
                schedule,
            } => {
                if let Some(rs) = locked.get_mut(id) {
                    rs.name = name.clone();
                    rs.description = description.clone();
                    rs.capacity = Capacity::from_limit(*capacity).unwrap_or(Capacity::Unlimited);
                    rs.schedule = schedule.clone();
                }
            }
            Event::ResourceDeleted { id } => {
                // Waiters queued on this lock must see the resource as gone.
                if let Some(rs) = locked.get_mut(id) {
                    rs.deleted = true;
                }
                self.resources.remove(id);
            }
            Event::BookingCreated {
                id,
                resource_id,
                span,
                status,
                metadata,
            }
            | Event::BookingUpdated {
                id,
                resource_id,
                span,
                status,
                metadata,
            } => {
                if let Some(rs) = locked.get_mut(resource_id) {
                    rs.remove_interval(*id);
                    rs.insert_interval(Interval {
                        id: *id,
                        span: *span,
                        kind: IntervalKind::Booking {
                            status: status.clone(),
                            metadata: metadata.clone(),
                        },
                    });
                }
                self.map_entity(*id, *resource_id);
            }
            Event::UnavailabilityCreated {
                id,
                resource_id,
                span,
            } => {
                if let Some(rs) = locked.get_mut(resource_id) {
                    rs.insert_interval(Interval {
                        id: *id,
                        span: *span,
                        kind: IntervalKind::Unavailability,
                    });
                }
                self.map_entity(*id, *resource_id);
            }
            Event::UnavailabilityUpdated {
                id,
                from_resource_id,
                resource_id,
                span,
            } => {
                if let Some(rs) = locked.get_mut(from_resource_id) {
                    rs.remove_interval(*id);
                }
                if let Some(rs) = locked.get_mut(resource_id) {
                    rs.insert_interval(Interval {
                        id: *id,
                        span: *span,
                        kind: IntervalKind::Unavailability,
                    });
                }
                self.map_entity(*id, *resource_id);
            }
            Event::BookingDeleted { id, resource_id }
            | Event::UnavailabilityDeleted { id, resource_id } => {
                if let Some(rs) = locked.get_mut(resource_id) {
                    rs.remove_interval(*id);
                }
                self.unmap_entity(id);
            }
        }
    }
}
