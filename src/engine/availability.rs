use ulid::Ulid;

use crate::limits::HOLD_EXPIRY_GRACE_MS;
use crate::model::*;

/// How pending holds near their expiry are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldPolicy {
    /// A hold counts strictly until its expiry instant. Used by reads and
    /// by confirmation.
    Live,
    /// A hold keeps counting for `HOLD_EXPIRY_GRACE_MS` past expiry, so a
    /// customer confirming right at the deadline is not undercut by a new
    /// reservation. Used when creating reservations.
    Conservative,
}

/// Whether `r` consumes stock at instant `now`.
pub fn counts_toward_capacity(r: &Reservation, policy: HoldPolicy, now: Ms) -> bool {
    match &r.status {
        ReservationStatus::Confirmed => true,
        ReservationStatus::PendingConfirm { expires_at, .. } => match policy {
            HoldPolicy::Live => *expires_at > now,
            HoldPolicy::Conservative => *expires_at > now - HOLD_EXPIRY_GRACE_MS,
        },
        ReservationStatus::Cancelled
        | ReservationStatus::Completed
        | ReservationStatus::NoShow
        | ReservationStatus::Paid => false,
    }
}

/// Summed quantity of counted reservations overlapping `span`.
///
/// This is a plain sum, not a peak: two reservations that overlap the query
/// but not each other both count.
pub fn reserved_quantity(
    state: &ItemState,
    span: &Span,
    policy: HoldPolicy,
    now: Ms,
    exclude: Option<Ulid>,
) -> u64 {
    state
        .overlapping(span)
        .filter(|r| Some(r.id) != exclude)
        .filter(|r| counts_toward_capacity(r, policy, now))
        .map(|r| r.quantity as u64)
        .sum()
}

/// `sellable - reserved`, floored at zero.
pub fn remaining_capacity(item: &InventoryItem, reserved: u64) -> u32 {
    (item.sellable() as u64).saturating_sub(reserved) as u32
}

/// Price quote: hourly cost × started hours × quantity.
pub(crate) fn quote_cents(item: &InventoryItem, span: &Span, quantity: u32) -> Option<u64> {
    let hourly = item.hourly_cost_cents?;
    let hours = (span.duration_ms() as u64).div_ceil(3_600_000);
    Some(hourly.saturating_mul(hours).saturating_mul(quantity as u64))
}
