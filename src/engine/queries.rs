use ulid::Ulid;

use crate::model::*;

use super::availability::free_windows;
use super::conflict::{page_bounds, validate_query_window};
use super::{Engine, EngineError};

/// Slice one page out of a fully filtered, ordered list.
fn paginate<T>(items: Vec<T>, offset: usize, limit: usize) -> (Vec<T>, usize) {
    let total = items.len();
    let page = items.into_iter().skip(offset).take(limit).collect();
    (page, total)
}

fn booking_info(resource_id: Ulid, interval: &Interval) -> Option<BookingInfo> {
    match &interval.kind {
        IntervalKind::Booking { status, metadata } => Some(BookingInfo {
            id: interval.id,
            resource_id,
            start: interval.span.start,
            end: interval.span.end,
            status: status.clone(),
            metadata: metadata.clone(),
        }),
        IntervalKind::Unavailability => None,
    }
}

fn unavailability_info(resource_id: Ulid, interval: &Interval) -> Option<UnavailabilityInfo> {
    match interval.kind {
        IntervalKind::Unavailability => Some(UnavailabilityInfo {
            id: interval.id,
            resource_id,
            start: interval.span.start,
            end: interval.span.end,
        }),
        IntervalKind::Booking { .. } => None,
    }
}

fn in_window(span: &Span, start_after: Option<Ms>, end_before: Option<Ms>) -> bool {
    start_after.is_none_or(|t| span.start >= t) && end_before.is_none_or(|t| span.end <= t)
}

impl Engine {
    pub async fn resource(&self, id: Ulid) -> Result<ResourceInfo, EngineError> {
        let rs = self
            .get_resource(&id)
            .ok_or(EngineError::ResourceNotFound(id))?;
        let guard = rs.read().await;
        if guard.deleted {
            return Err(EngineError::ResourceNotFound(id));
        }
        Ok(guard.info())
    }

    /// Resources in id (creation) order. Returns the page and the number of matches.
    pub async fn list_resources(
        &self,
        filter: ResourceFilter,
    ) -> Result<(Vec<ResourceInfo>, usize), EngineError> {
        let (offset, limit) = page_bounds(&filter.page, &self.config)?;
        let ids = match filter.id {
            Some(id) => vec![id],
            None => self.store.resource_ids(),
        };

        let mut matches = Vec::new();
        for id in ids {
            let Some(rs) = self.get_resource(&id) else {
                continue;
            };
            let guard = rs.read().await;
            if guard.deleted {
                continue;
            }
            if filter.name.is_some() && guard.name != filter.name {
                continue;
            }
            matches.push(guard.info());
        }
        Ok(paginate(matches, offset, limit))
    }

    pub async fn booking(&self, id: Ulid) -> Result<BookingInfo, EngineError> {
        let resource_id = self
            .get_resource_for_entity(&id)
            .ok_or(EngineError::BookingNotFound(id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::BookingNotFound(id))?;
        let guard = rs.read().await;
        guard
            .interval(id)
            .and_then(|i| booking_info(resource_id, i))
            .ok_or(EngineError::BookingNotFound(id))
    }

    /// Bookings ordered by start time. A `resource_id` that does not exist
    /// simply matches nothing.
    pub async fn find_bookings(
        &self,
        filter: BookingFilter,
    ) -> Result<(Vec<BookingInfo>, usize), EngineError> {
        let (offset, limit) = page_bounds(&filter.page, &self.config)?;
        let resource_ids = self.filter_scope(filter.id, filter.resource_id);

        let mut matches = Vec::new();
        for resource_id in resource_ids {
            let Some(rs) = self.get_resource(&resource_id) else {
                continue;
            };
            let guard = rs.read().await;
            matches.extend(
                guard
                    .intervals
                    .iter()
                    .filter(|i| filter.id.is_none_or(|id| i.id == id))
                    .filter(|i| in_window(&i.span, filter.start_after, filter.end_before))
                    .filter_map(|i| booking_info(resource_id, i))
                    .filter(|b| filter.status.as_ref().is_none_or(|s| &b.status == s)),
            );
        }
        matches.sort_by_key(|b| (b.start, b.id));
        Ok(paginate(matches, offset, limit))
    }

    pub async fn unavailability(&self, id: Ulid) -> Result<UnavailabilityInfo, EngineError> {
        let resource_id = self
            .get_resource_for_entity(&id)
            .ok_or(EngineError::UnavailabilityNotFound(id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::UnavailabilityNotFound(id))?;
        let guard = rs.read().await;
        guard
            .interval(id)
            .and_then(|i| unavailability_info(resource_id, i))
            .ok_or(EngineError::UnavailabilityNotFound(id))
    }

    pub async fn find_unavailabilities(
        &self,
        filter: UnavailabilityFilter,
    ) -> Result<(Vec<UnavailabilityInfo>, usize), EngineError> {
        let (offset, limit) = page_bounds(&filter.page, &self.config)?;
        let resource_ids = self.filter_scope(filter.id, filter.resource_id);

        let mut matches = Vec::new();
        for resource_id in resource_ids {
            let Some(rs) = self.get_resource(&resource_id) else {
                continue;
            };
            let guard = rs.read().await;
            matches.extend(
                guard
                    .intervals
                    .iter()
                    .filter(|i| filter.id.is_none_or(|id| i.id == id))
                    .filter(|i| in_window(&i.span, filter.start_after, filter.end_before))
                    .filter_map(|i| unavailability_info(resource_id, i)),
            );
        }
        matches.sort_by_key(|u| (u.start, u.id));
        Ok(paginate(matches, offset, limit))
    }

    /// Free windows of one resource inside the closed query `[start, end]`.
    pub async fn compute_availability(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        let query = Span::new(start, end);
        validate_query_window(&query, &self.config)?;
        if min_duration.is_some_and(|d| d < 0) {
            return Err(EngineError::InvalidInput("min_duration must not be negative"));
        }

        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let guard = rs.read().await;
        if guard.deleted {
            return Err(EngineError::ResourceNotFound(resource_id));
        }
        Ok(free_windows(&guard, &query, min_duration))
    }

    /// Which resources a record query has to look at.
    fn filter_scope(&self, record_id: Option<Ulid>, resource_id: Option<Ulid>) -> Vec<Ulid> {
        let by_record = record_id.map(|id| self.get_resource_for_entity(&id));
        match (by_record, resource_id) {
            (Some(None), _) => Vec::new(),
            (Some(Some(owner)), Some(rid)) if owner != rid => Vec::new(),
            (Some(Some(owner)), _) => vec![owner],
            (None, Some(rid)) => vec![rid],
            (None, None) => self.store.resource_ids(),
        }
    }
}
