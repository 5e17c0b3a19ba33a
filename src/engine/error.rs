use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed input: bad hour, date outside the booking horizon,
    /// hour outside the weekday's enabled set, invalid transition.
    /// Never retried.
    Validation(&'static str),
    /// Lost the race for a slot to the appointment with this id.
    /// Expected and non-fatal — re-resolve and pick another slot.
    SlotConflict(Ulid),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    /// Storage failure or lock-acquisition timeout. The calling layer
    /// retries with backoff; reads degrade toward unavailability.
    Unavailable(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation: {msg}"),
            EngineError::SlotConflict(id) => {
                write!(f, "slot already booked by appointment: {id}")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Unavailable(e) => write!(f, "backend unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
