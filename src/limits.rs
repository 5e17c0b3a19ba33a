use std::time::Duration;

/// Max fixers a single engine will onboard.
pub const MAX_FIXERS: usize = 100_000;

/// Max appointment records ever accumulated on one (date, hour) slot.
/// Cancelled records are retained for audit, so the history can grow.
pub const MAX_SLOT_HISTORY: usize = 64;

pub const MAX_NOTE_LEN: usize = 512;
pub const MAX_REASON_LEN: usize = 512;

/// Booking horizon: how far forward dates may be booked or aggregated.
pub const HORIZON_MONTHS: u32 = 6;

/// Calendar sanity bounds for incoming dates.
pub const MIN_VALID_YEAR: i32 = 2000;
pub const MAX_VALID_YEAR: i32 = 2100;

/// Read-path bound on fixer-state lock acquisition. On expiry the
/// resolver and aggregator degrade toward unavailability instead of
/// reporting a slot as bookable.
pub const LOCK_TIMEOUT: Duration = Duration::from_millis(2_000);

/// TTL backstop for cached resolver/aggregator results. Entries are
/// invalidated on every write; the TTL only covers missed invalidations.
pub const SLOT_CACHE_TTL: Duration = Duration::from_secs(5);
pub const MONTH_CACHE_TTL: Duration = Duration::from_secs(5);

/// Retention window for idempotency-key replays at the wire boundary.
pub const IDEMPOTENCY_TTL: Duration = Duration::from_secs(600);

/// Max bytes in one wire protocol line.
pub const MAX_WIRE_LINE_LEN: usize = 64 * 1024;
