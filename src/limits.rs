use crate::model::Ms;

pub const MAX_TENANTS: usize = 10_000;
pub const MAX_TENANT_SLUG_LEN: usize = 64;
pub const MAX_ITEMS_PER_TENANT: usize = 1_000;
pub const MAX_RESERVATIONS_PER_ITEM: usize = 200_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CONTACT_LEN: usize = 320;
pub const MAX_SLOTS: usize = 48;
pub const MAX_BLOCKED_DATES: usize = 3_660;
pub const MAX_QUANTITY: u32 = 1_000;
pub const MAX_STOCK: u32 = 1_000_000;
pub const MAX_ADVANCE_HOURS: u32 = 24 * 365;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// A single reservation never spans more than two days of wall-clock time.
pub const MAX_SPAN_DURATION_MS: Ms = 48 * 3_600_000;

/// How long a pending reservation holds stock before the customer must confirm.
pub const DEFAULT_HOLD_TTL_MS: Ms = 30 * 60_000;
/// Longest configurable hold, in seconds.
pub const MAX_HOLD_TTL_SECS: u64 = 24 * 3_600;

/// Pending holds that expired less than this long ago still block new
/// reservations (but never confirmations or availability reads).
pub const HOLD_EXPIRY_GRACE_MS: Ms = 60_000;

/// Upper bound on a single notification delivery attempt.
pub const DISPATCH_TIMEOUT_MS: u64 = 5_000;

/// Longest accepted command line on the TCP front end.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Attempts at drawing a booking code that is not already in use.
pub const MAX_BOOKING_CODE_ATTEMPTS: usize = 8;
