use std::collections::BTreeMap;
use std::num::NonZeroU32;

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Free-form key/value information attached to a booking.
pub type Metadata = BTreeMap<String, String>;

/// Closed interval `[start, end]`. Both bounds are inclusive, so two spans
/// that touch at a single millisecond overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    /// Zero-length spans are allowed; callers validate `start <= end`.
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end.saturating_sub(self.start)
    }

    /// Four-clause overlap test. Every clause is needed: together they are
    /// what makes boundary contact count as a conflict.
    pub fn overlaps(&self, other: &Span) -> bool {
        // other starts during self
        (self.start <= other.start && other.start <= self.end)
            // other ends during self
            || (self.start <= other.end && other.end <= self.end)
            // self entirely inside other
            || (other.start <= self.start && self.end <= other.end)
            // other entirely inside self
            || (self.start <= other.start && other.end <= self.end)
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t <= self.end
    }
}

/// Admission policy of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capacity {
    /// Any number of bookings may overlap.
    Unlimited,
    /// At most `n` bookings may overlap any instant.
    Limited(NonZeroU32),
}

impl Capacity {
    /// `None` → unlimited. Returns `None` for `Some(0)`, which is not a valid limit.
    pub fn from_limit(limit: Option<u32>) -> Option<Self> {
        match limit {
            None => Some(Capacity::Unlimited),
            Some(n) => NonZeroU32::new(n).map(Capacity::Limited),
        }
    }

    pub fn limit(&self) -> Option<u32> {
        match self {
            Capacity::Unlimited => None,
            Capacity::Limited(n) => Some(n.get()),
        }
    }

    /// Whether one more booking fits next to `overlapping` existing ones.
    pub fn admits(&self, overlapping: usize) -> bool {
        match self {
            Capacity::Unlimited => true,
            Capacity::Limited(n) => overlapping < n.get() as usize,
        }
    }
}

/// A weekly opening period `[start, end)` in the resource's local time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub day: Weekday,
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// How many bookings the slot takes per day. `None` is no limit.
    pub quantity: Option<u32>,
}

/// When a resource can be booked. No slots means always open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    /// Minutes east of UTC.
    pub utc_offset_minutes: i32,
    pub slots: Vec<Slot>,
}

impl Schedule {
    /// `UTC+05:30`, `UTC-09:30`, `UTC±00:00` or bare `UTC`. Offsets run
    /// from -12:00 to +14:00.
    pub fn parse_timezone(tz: &str) -> Option<i32> {
        let rest = tz.strip_prefix("UTC")?;
        if rest.is_empty() {
            return Some(0);
        }
        let (sign, hhmm) = if let Some(hhmm) = rest.strip_prefix('+') {
            (1, hhmm)
        } else if let Some(hhmm) = rest.strip_prefix('-') {
            (-1, hhmm)
        } else {
            (1, rest.strip_prefix('±')?)
        };
        let (hh, mm) = hhmm.split_once(':')?;
        if hh.len() != 2 || mm.len() != 2 {
            return None;
        }
        let (hh, mm): (i32, i32) = (hh.parse().ok()?, mm.parse().ok()?);
        if mm >= 60 {
            return None;
        }
        let minutes = sign * (hh * 60 + mm);
        (-12 * 60..=14 * 60).contains(&minutes).then_some(minutes)
    }

    pub fn timezone_label(&self) -> String {
        let sign = if self.utc_offset_minutes < 0 { '-' } else { '+' };
        let abs = self.utc_offset_minutes.abs();
        format!("UTC{sign}{:02}:{:02}", abs / 60, abs % 60)
    }

    /// Slots in the form clients write them.
    pub fn slot_inputs(&self) -> Vec<SlotInput> {
        self.slots
            .iter()
            .map(|s| SlotInput {
                day: weekday_name(s.day).to_string(),
                start: s.start.format("%H:%M").to_string(),
                end: s.end.format("%H:%M").to_string(),
                quantity: s.quantity,
            })
            .collect()
    }
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// Opening hours as written by clients. Validated by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleInput {
    /// `None` is UTC.
    pub timezone: Option<String>,
    pub slots: Vec<SlotInput>,
}

/// A slot as written by clients, e.g.
/// `{"day": "monday", "start": "09:00", "end": "17:00", "quantity": 2}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInput {
    pub day: String,
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub quantity: Option<u32>,
}

/// The kind of record a conflict query runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Booking,
    Unavailability,
}

impl RecordKind {
    pub fn matches(&self, kind: &IntervalKind) -> bool {
        matches!(
            (self, kind),
            (RecordKind::Booking, IntervalKind::Booking { .. })
                | (RecordKind::Unavailability, IntervalKind::Unavailability)
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            RecordKind::Booking => "booking",
            RecordKind::Unavailability => "unavailability",
        }
    }
}

/// What an interval on a resource represents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntervalKind {
    Booking { status: String, metadata: Metadata },
    /// Blackout window: the resource cannot be booked.
    Unavailability,
}

/// A single record on a resource. Bookings and unavailabilities are both intervals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub id: Ulid,
    pub span: Span,
    pub kind: IntervalKind,
}

impl Interval {
    pub fn is_booking(&self) -> bool {
        matches!(self.kind, IntervalKind::Booking { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: Option<String>,
    pub description: Option<String>,
    pub capacity: Capacity,
    pub schedule: Schedule,
    /// Set under the write lock when the resource is deleted, so transactions
    /// that were queued on the lock see it as gone.
    pub deleted: bool,
    /// All records (bookings + unavailabilities), sorted by `span.start`.
    pub intervals: Vec<Interval>,
}

impl ResourceState {
    pub fn new(id: Ulid, name: Option<String>, description: Option<String>, capacity: Capacity) -> Self {
        Self {
            id,
            name,
            description,
            capacity,
            schedule: Schedule::default(),
            deleted: false,
            intervals: Vec::new(),
        }
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert_interval(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    /// Remove interval by id.
    pub fn remove_interval(&mut self, id: Ulid) -> Option<Interval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    pub fn interval(&self, id: Ulid) -> Option<&Interval> {
        self.intervals.iter().find(|i| i.id == id)
    }

    /// Records whose span overlaps the query window.
    /// Binary search skips everything starting after `query.end`.
    pub fn overlapping(&self, query: Span) -> impl Iterator<Item = &Interval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start <= query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.overlaps(&query))
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            capacity: self.capacity.limit(),
            schedule: self.schedule.clone(),
        }
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        name: Option<String>,
        description: Option<String>,
        capacity: Option<u32>,
        schedule: Schedule,
    },
    ResourceUpdated {
        id: Ulid,
        name: Option<String>,
        description: Option<String>,
        capacity: Option<u32>,
        schedule: Schedule,
    },
    ResourceDeleted {
        id: Ulid,
    },
    BookingCreated {
        id: Ulid,
        resource_id: Ulid,
        span: Span,
        status: String,
        metadata: Metadata,
    },
    BookingUpdated {
        id: Ulid,
        resource_id: Ulid,
        span: Span,
        status: String,
        metadata: Metadata,
    },
    BookingDeleted {
        id: Ulid,
        resource_id: Ulid,
    },
    UnavailabilityCreated {
        id: Ulid,
        resource_id: Ulid,
        span: Span,
    },
    /// `from_resource_id == resource_id` for in-place updates.
    UnavailabilityUpdated {
        id: Ulid,
        from_resource_id: Ulid,
        resource_id: Ulid,
        span: Span,
    },
    UnavailabilityDeleted {
        id: Ulid,
        resource_id: Ulid,
    },
}

impl Event {
    /// Resources whose state this event changes.
    pub fn resource_ids(&self) -> Vec<Ulid> {
        match self {
            Event::ResourceCreated { id, .. }
            | Event::ResourceUpdated { id, .. }
            | Event::ResourceDeleted { id } => vec![*id],
            Event::BookingCreated { resource_id, .. }
            | Event::BookingUpdated { resource_id, .. }
            | Event::BookingDeleted { resource_id, .. }
            | Event::UnavailabilityCreated { resource_id, .. }
            | Event::UnavailabilityDeleted { resource_id, .. } => vec![*resource_id],
            Event::UnavailabilityUpdated {
                from_resource_id,
                resource_id,
                ..
            } => {
                if from_resource_id == resource_id {
                    vec![*resource_id]
                } else {
                    vec![*from_resource_id, *resource_id]
                }
            }
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub description: Option<String>,
    pub capacity: Option<u32>,
    pub schedule: Schedule,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub status: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnavailabilityInfo {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub start: Ms,
    pub end: Ms,
}

// ── Update and filter types ──────────────────────────────────────

/// Fields to change on a resource. `None` leaves a field untouched;
/// `capacity: Some(None)` makes the resource unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceUpdate {
    pub name: Option<Option<String>>,
    pub description: Option<Option<String>>,
    pub capacity: Option<Option<u32>>,
    /// `Some(None)` resets to UTC.
    pub timezone: Option<Option<String>>,
    /// Replaces every slot; `Some(vec![])` makes the resource always open.
    pub slots: Option<Vec<SlotInput>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingUpdate {
    pub span: Option<Span>,
    pub status: Option<String>,
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnavailabilityUpdate {
    /// Move the window to another resource of the same organization.
    pub resource_id: Option<Ulid>,
    pub span: Option<Span>,
}

/// Offset/limit window over a result list. `limit: None` uses the configured default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceFilter {
    pub id: Option<Ulid>,
    pub name: Option<String>,
    pub page: Page,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub id: Option<Ulid>,
    pub resource_id: Option<Ulid>,
    pub status: Option<String>,
    /// Only bookings with `start >= start_after`.
    pub start_after: Option<Ms>,
    /// Only bookings with `end <= end_before`.
    pub end_before: Option<Ms>,
    pub page: Page,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnavailabilityFilter {
    pub id: Option<Ulid>,
    pub resource_id: Option<Ulid>,
    pub start_after: Option<Ms>,
    pub end_before: Option<Ms>,
    pub page: Page,
}
