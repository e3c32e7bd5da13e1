use chrono::{NaiveTime, Weekday};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::model::*;

use super::EngineError;

/// Count records of `kind` on `rs` whose span overlaps `span`, ignoring any id
/// in `exclude`. The caller holds the resource lock.
pub(crate) fn count_overlapping(
    rs: &ResourceState,
    kind: RecordKind,
    span: &Span,
    exclude: &[Ulid],
) -> usize {
    rs.overlapping(*span)
        .filter(|i| kind.matches(&i.kind))
        .filter(|i| !exclude.contains(&i.id))
        .count()
}

pub(crate) fn validate_span(span: &Span, config: &EngineConfig) -> Result<(), EngineError> {
    if span.start > span.end {
        return Err(EngineError::InvalidInput("start must not be after end"));
    }
    if span.start < config.min_valid_timestamp_ms || span.end > config.max_valid_timestamp_ms {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > config.max_span_duration_ms {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

pub(crate) fn validate_query_window(span: &Span, config: &EngineConfig) -> Result<(), EngineError> {
    if span.start > span.end {
        return Err(EngineError::InvalidInput("start must not be after end"));
    }
    if span.start < config.min_valid_timestamp_ms || span.end > config.max_valid_timestamp_ms {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > config.max_query_window_ms {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

pub(crate) fn validate_capacity(limit: Option<u32>) -> Result<Capacity, EngineError> {
    Capacity::from_limit(limit).ok_or(EngineError::InvalidInput("capacity must be at least 1"))
}

/// Parse and check a client schedule: a known UTC offset, well-formed
/// `HH:MM` slot times with start before end, and no two slots of one day
/// overlapping. Slots that only touch are fine.
pub(crate) fn validate_schedule(
    timezone: Option<&str>,
    slots: &[SlotInput],
    config: &EngineConfig,
) -> Result<Schedule, EngineError> {
    let utc_offset_minutes = match timezone {
        Some(tz) => Schedule::parse_timezone(tz)
            .ok_or(EngineError::InvalidInput("timezone must be a UTC offset like UTC+05:30"))?,
        None => 0,
    };
    if slots.len() > config.max_slots_per_resource {
        return Err(EngineError::LimitExceeded("too many slots"));
    }

    let mut parsed = Vec::with_capacity(slots.len());
    for slot in slots {
        let day: Weekday = slot
            .day
            .parse()
            .map_err(|_| EngineError::InvalidInput("slot day must be a weekday name"))?;
        let time = |t: &str| {
            NaiveTime::parse_from_str(t, "%H:%M")
                .map_err(|_| EngineError::InvalidInput("slot times must be HH:MM"))
        };
        let (start, end) = (time(&slot.start)?, time(&slot.end)?);
        if start >= end {
            return Err(EngineError::InvalidInput("slot start must be before its end"));
        }
        if slot.quantity == Some(0) {
            return Err(EngineError::InvalidInput("slot quantity must be at least 1"));
        }
        parsed.push(Slot {
            day,
            start,
            end,
            quantity: slot.quantity,
        });
    }

    parsed.sort_by_key(|s| (s.day.num_days_from_monday(), s.start));
    if parsed
        .windows(2)
        .any(|w| w[0].day == w[1].day && w[1].start < w[0].end)
    {
        return Err(EngineError::InvalidInput("slots on the same day overlap"));
    }

    Ok(Schedule {
        utc_offset_minutes,
        slots: parsed,
    })
}

pub(crate) fn validate_text(
    value: Option<&str>,
    max_len: usize,
    what: &'static str,
) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > max_len => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

pub(crate) fn validate_metadata(metadata: &Metadata, config: &EngineConfig) -> Result<(), EngineError> {
    if metadata.len() > config.max_metadata_entries {
        return Err(EngineError::LimitExceeded("too many metadata entries"));
    }
    for (key, value) in metadata {
        if key.is_empty() {
            return Err(EngineError::InvalidInput("metadata key must not be empty"));
        }
        if key.len() > config.max_metadata_value_len || value.len() > config.max_metadata_value_len {
            return Err(EngineError::LimitExceeded("metadata entry too long"));
        }
    }
    Ok(())
}

/// Resolve a page request to `(offset, limit)`.
pub(crate) fn page_bounds(page: &Page, config: &EngineConfig) -> Result<(usize, usize), EngineError> {
    let limit = page.limit.unwrap_or(config.default_page_size);
    if limit == 0 {
        return Err(EngineError::InvalidInput("limit must be at least 1"));
    }
    if limit > config.max_page_size {
        return Err(EngineError::LimitExceeded("page size"));
    }
    Ok((page.offset, limit))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(intervals: &[(Ms, Ms, bool)]) -> ResourceState {
        let mut rs = ResourceState::new(Ulid::new(), None, None, Capacity::Unlimited);
        for &(start, end, is_booking) in intervals {
            rs.insert_interval(Interval {
                id: Ulid::new(),
                span: Span::new(start, end),
                kind: if is_booking {
                    IntervalKind::Booking {
                        status: String::new(),
                        metadata: Metadata::new(),
                    }
                } else {
                    IntervalKind::Unavailability
                },
            });
        }
        rs
    }

    #[test]
    fn counts_only_requested_kind() {
        let rs = resource(&[(0, 100, true), (50, 150, true), (60, 70, false)]);
        let q = Span::new(60, 65);
        assert_eq!(count_overlapping(&rs, RecordKind::Booking, &q, &[]), 2);
        assert_eq!(count_overlapping(&rs, RecordKind::Unavailability, &q, &[]), 1);
    }

    #[test]
    fn excluded_ids_are_skipped() {
        let rs = resource(&[(0, 100, true), (50, 150, true)]);
        let first = rs.intervals[0].id;
        let q = Span::new(0, 200);
        assert_eq!(count_overlapping(&rs, RecordKind::Booking, &q, &[first]), 1);
        assert_eq!(count_overlapping(&rs, RecordKind::Booking, &q, &[Ulid::new()]), 2);
    }

    #[test]
    fn boundary_contact_is_counted() {
        let rs = resource(&[(100, 200, true)]);
        assert_eq!(count_overlapping(&rs, RecordKind::Booking, &Span::new(200, 300), &[]), 1);
        assert_eq!(count_overlapping(&rs, RecordKind::Booking, &Span::new(0, 100), &[]), 1);
        assert_eq!(count_overlapping(&rs, RecordKind::Booking, &Span::new(201, 300), &[]), 0);
    }

    #[test]
    fn span_validation() {
        let config = EngineConfig::default();
        assert!(validate_span(&Span::new(10, 10), &config).is_ok());
        assert!(matches!(
            validate_span(&Span::new(11, 10), &config),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            validate_span(&Span::new(-1, 10), &config),
            Err(EngineError::LimitExceeded(_))
        ));
        let too_wide = Span::new(0, config.max_span_duration_ms + 1);
        assert!(matches!(
            validate_span(&too_wide, &config),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn query_window_is_bounded() {
        let config = EngineConfig::default();
        assert!(validate_query_window(&Span::new(0, 1000), &config).is_ok());
        assert!(matches!(
            validate_query_window(&Span::new(Ms::MIN, Ms::MAX), &config),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            validate_query_window(&Span::new(-1, 10), &config),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            validate_query_window(&Span::new(10, 9), &config),
            Err(EngineError::InvalidInput(_))
        ));
    }

    fn slot(day: &str, start: &str, end: &str) -> SlotInput {
        SlotInput {
            day: day.into(),
            start: start.into(),
            end: end.into(),
            quantity: None,
        }
    }

    #[test]
    fn schedule_validation() {
        let config = EngineConfig::default();
        let schedule = validate_schedule(
            Some("UTC+01:00"),
            &[slot("tuesday", "13:00", "17:00"), slot("Mon", "09:00", "12:00"), slot("tuesday", "09:00", "13:00")],
            &config,
        )
        .unwrap();
        assert_eq!(schedule.utc_offset_minutes, 60);
        let days: Vec<Weekday> = schedule.slots.iter().map(|s| s.day).collect();
        assert_eq!(days, vec![Weekday::Mon, Weekday::Tue, Weekday::Tue]);
        assert_eq!(schedule.slots[1].start, NaiveTime::from_hms_opt(9, 0, 0).unwrap());

        assert_eq!(validate_schedule(None, &[], &config).unwrap(), Schedule::default());

        let bad: [(Option<&str>, Vec<SlotInput>); 6] = [
            (Some("Europe/London"), vec![]),
            (None, vec![slot("someday", "09:00", "10:00")]),
            (None, vec![slot("monday", "9am", "10:00")]),
            (None, vec![slot("monday", "10:00", "10:00")]),
            (None, vec![slot("monday", "09:00", "11:00"), slot("monday", "10:59", "12:00")]),
            (
                None,
                vec![SlotInput {
                    quantity: Some(0),
                    ..slot("monday", "09:00", "10:00")
                }],
            ),
        ];
        for (tz, slots) in bad {
            assert!(
                matches!(validate_schedule(tz, &slots, &config), Err(EngineError::InvalidInput(_))),
                "{tz:?} {slots:?}"
            );
        }

        let crowded: Vec<SlotInput> = (0..=config.max_slots_per_resource)
            .map(|_| slot("monday", "09:00", "10:00"))
            .collect();
        assert!(matches!(
            validate_schedule(None, &crowded, &config),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn zero_capacity_rejected() {
        assert!(matches!(validate_capacity(Some(0)), Err(EngineError::InvalidInput(_))));
        assert_eq!(validate_capacity(None).unwrap(), Capacity::Unlimited);
    }

    #[test]
    fn paging_defaults_and_caps() {
        let config = EngineConfig::default();
        assert_eq!(page_bounds(&Page::default(), &config).unwrap(), (0, 10));
        let page = Page { offset: 20, limit: Some(5) };
        assert_eq!(page_bounds(&page, &config).unwrap(), (20, 5));
        let huge = Page { offset: 0, limit: Some(config.max_page_size + 1) };
        assert!(page_bounds(&huge, &config).is_err());
    }
}
