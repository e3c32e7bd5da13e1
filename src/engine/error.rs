use ulid::Ulid;

/// Coarse classification of an [`EngineError`], used at the wire boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    /// Business rejection: try a different time.
    Conflict,
    Invalid,
    Cancelled,
    /// Storage failure: try again later.
    Internal,
}

#[derive(Debug)]
pub enum EngineError {
    ResourceNotFound(Ulid),
    BookingNotFound(Ulid),
    UnavailabilityNotFound(Ulid),
    AlreadyExists(Ulid),
    /// Admitting the booking would exceed the resource's capacity.
    BookingConflict {
        resource_id: Ulid,
        overlapping: usize,
    },
    /// The candidate window overlaps an unavailability window.
    UnavailabilityConflict {
        resource_id: Ulid,
        overlapping: usize,
    },
    HasDependents(Ulid),
    InvalidInput(&'static str),
    LimitExceeded(&'static str),
    Cancelled,
    TimedOut,
    WalError(String),
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::ResourceNotFound(_)
            | EngineError::BookingNotFound(_)
            | EngineError::UnavailabilityNotFound(_) => ErrorKind::NotFound,
            EngineError::AlreadyExists(_)
            | EngineError::BookingConflict { .. }
            | EngineError::UnavailabilityConflict { .. }
            | EngineError::HasDependents(_) => ErrorKind::Conflict,
            EngineError::InvalidInput(_) | EngineError::LimitExceeded(_) => ErrorKind::Invalid,
            EngineError::Cancelled | EngineError::TimedOut => ErrorKind::Cancelled,
            EngineError::WalError(_) | EngineError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::ResourceNotFound(id) => write!(f, "resource not found: {id}"),
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::UnavailabilityNotFound(id) => {
                write!(f, "unavailability not found: {id}")
            }
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::BookingConflict {
                resource_id,
                overlapping,
            } => write!(
                f,
                "booking conflict on resource {resource_id}: {overlapping} overlapping booking(s), maximum bookings reached"
            ),
            EngineError::UnavailabilityConflict {
                resource_id,
                overlapping,
            } => write!(
                f,
                "unavailability conflict on resource {resource_id}: overlaps {overlapping} unavailability window(s)"
            ),
            EngineError::HasDependents(id) => {
                write!(f, "cannot delete resource {id}: has bookings or unavailabilities")
            }
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Cancelled => write!(f, "transaction cancelled"),
            EngineError::TimedOut => write!(f, "transaction timed out"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
            EngineError::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
