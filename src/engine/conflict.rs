use ulid::Ulid;

use crate::model::*;

use super::EngineError;
use super::availability::{HoldPolicy, remaining_capacity, reserved_quantity};

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Fail with `CapacityExceeded` unless `quantity` more units fit on `span`.
/// Returns what was available before this request.
pub(crate) fn check_capacity(
    state: &ItemState,
    span: &Span,
    quantity: u32,
    policy: HoldPolicy,
    now: Ms,
    exclude: Option<Ulid>,
) -> Result<u32, EngineError> {
    let reserved = reserved_quantity(state, span, policy, now, exclude);
    let available = remaining_capacity(&state.item, reserved);
    if available < quantity {
        return Err(EngineError::CapacityExceeded {
            available,
            requested: quantity,
        });
    }
    Ok(available)
}
