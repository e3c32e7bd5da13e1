use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime};

use crate::model::*;

// ── Free-window computation ───────────────────────────────────────
//
// Stored spans are closed. The sweep works on half-open `[start, end + 1)`
// spans so that adjacency and overlap fall out of plain comparisons; results
// are converted back to closed spans at the end.

fn half_open(span: &Span) -> Span {
    Span::new(span.start, span.end.saturating_add(1))
}

fn closed(span: &Span) -> Span {
    Span::new(span.start, span.end - 1)
}

/// Closed windows inside `query` that can each be booked as a whole: they lie
/// inside the resource's opening slots, touch no unavailability, and overlap
/// fewer bookings than the capacity. With capacity above one, two windows may
/// overlap each other. Windows whose closed duration is under `min_duration`
/// are dropped.
pub fn free_windows(resource: &ResourceState, query: &Span, min_duration: Option<Ms>) -> Vec<Span> {
    let window = half_open(query);

    let mut blocked: Vec<Span> = Vec::new();
    let mut bookings: Vec<Span> = Vec::new();
    for interval in resource.overlapping(*query) {
        match interval.kind {
            IntervalKind::Unavailability => blocked.push(half_open(&interval.span)),
            IntervalKind::Booking { .. } => bookings.push(half_open(&interval.span)),
        }
    }
    blocked.sort_by_key(|s| s.start);
    let open = subtract_intervals(&open_spans(&resource.schedule, &window), &merge_overlapping(&blocked));

    let windows = match resource.capacity {
        Capacity::Unlimited => open,
        Capacity::Limited(limit) => open
            .iter()
            .flat_map(|segment| admissible_windows(segment, &bookings, limit.get() as usize))
            .collect(),
    };

    windows
        .iter()
        .map(closed)
        .filter(|s| min_duration.is_none_or(|d| s.duration_ms() >= d))
        .collect()
}

/// Maximal half-open windows inside `segment` that overlap at most
/// `capacity - 1` of the half-open `bookings`, in start order.
///
/// Every maximal window starts at the segment start or where a booking
/// ends. From a left edge `l`, the window runs until the start of the
/// `capacity`-th booking (by start) among those still running after `l`.
fn admissible_windows(segment: &Span, bookings: &[Span], capacity: usize) -> Vec<Span> {
    let mut relevant: Vec<Span> = bookings
        .iter()
        .filter(|b| b.start < segment.end && segment.start < b.end)
        .copied()
        .collect();
    relevant.sort_by_key(|b| b.end);

    let mut left_edges: Vec<Ms> = vec![segment.start];
    left_edges.extend(
        relevant
            .iter()
            .map(|b| b.end)
            .filter(|&end| segment.start < end && end < segment.end),
    );
    left_edges.dedup();

    // Bookings still running after the current left edge, by start.
    let mut running: BTreeSet<(Ms, usize)> =
        relevant.iter().enumerate().map(|(i, b)| (b.start, i)).collect();
    let mut finished = 0;

    let mut result: Vec<Span> = Vec::new();
    for left in left_edges {
        while finished < relevant.len() && relevant[finished].end <= left {
            running.remove(&(relevant[finished].start, finished));
            finished += 1;
        }
        let right = running
            .iter()
            .nth(capacity - 1)
            .map_or(segment.end, |&(start, _)| start.min(segment.end));
        if right <= left {
            continue;
        }
        // Right edges never move left as the left edge advances; a window
        // sharing its right edge with the previous one lies inside it.
        if result.last().is_some_and(|prev| prev.end == right) {
            continue;
        }
        result.push(Span::new(left, right));
    }
    result
}

/// Half-open UTC spans inside `window` during which the schedule is open,
/// sorted and merged.
fn open_spans(schedule: &Schedule, window: &Span) -> Vec<Span> {
    if schedule.slots.is_empty() {
        return vec![*window];
    }
    let Some(offset) = FixedOffset::east_opt(schedule.utc_offset_minutes * 60) else {
        return Vec::new();
    };
    let local_date =
        |ms: Ms| DateTime::from_timestamp_millis(ms).map(|t| t.with_timezone(&offset).date_naive());
    let (Some(first), Some(last)) = (local_date(window.start), local_date(window.end)) else {
        return Vec::new();
    };

    let mut open = Vec::new();
    let mut day = first;
    while day <= last {
        for slot in schedule.slots.iter().filter(|s| s.day == day.weekday()) {
            let (Some(start), Some(end)) = (
                local_ms(day, slot.start, offset),
                local_ms(day, slot.end, offset),
            ) else {
                continue;
            };
            let span = Span::new(start.max(window.start), end.min(window.end));
            if span.start < span.end {
                open.push(span);
            }
        }
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    open.sort_by_key(|s| s.start);
    merge_overlapping(&open)
}

fn local_ms(day: NaiveDate, time: NaiveTime, offset: FixedOffset) -> Option<Ms> {
    day.and_time(time)
        .and_local_timezone(offset)
        .single()
        .map(|t| t.timestamp_millis())
}

/// Merge sorted half-open spans; touching spans are joined.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both sorted, half-open, and internally disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut cursor = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= cursor {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > cursor {
                result.push(Span::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
            j += 1;
        }

        if cursor < b.end {
            result.push(Span::new(cursor, b.end));
        }
    }

    result
}
