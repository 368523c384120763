use std::collections::HashSet;

use crate::engine::EngineError;
use crate::limits::*;
use crate::model::{SlotDefinition, TenantSettings};

/// Reserved id of the synthesized slot spanning all configured slots.
pub const FULL_DAY_SLOT_ID: &str = "full-day";

/// Effective slot list for any date: the configured slots in order, plus a
/// trailing full-day slot when enabled and at least one slot exists.
pub fn resolve_slots(settings: &TenantSettings) -> Vec<SlotDefinition> {
    let full_day = if settings.full_day_enabled {
        full_day_slot(&settings.slots)
    } else {
        None
    };
    settings.slots.iter().cloned().chain(full_day).collect()
}

/// `[min(start), max(end)]` over `slots`, or `None` for an empty list.
pub fn full_day_slot(slots: &[SlotDefinition]) -> Option<SlotDefinition> {
    let start = slots.iter().map(|s| s.start).min()?;
    let end = slots.iter().map(|s| s.end).max()?;
    Some(SlotDefinition {
        id: FULL_DAY_SLOT_ID.to_string(),
        label: format!("Full Day ({start} - {end})"),
        start,
        end,
    })
}

/// Look a slot up by id in the resolved list (so `full-day` is found too).
pub fn find_slot(settings: &TenantSettings, slot_id: &str) -> Option<SlotDefinition> {
    resolve_slots(settings).into_iter().find(|s| s.id == slot_id)
}

/// Reject settings that would make slot math meaningless.
pub fn validate_settings(settings: &TenantSettings) -> Result<(), EngineError> {
    if settings.slots.len() > MAX_SLOTS {
        return Err(EngineError::LimitExceeded("too many slots"));
    }
    if settings.blocked_dates.len() > MAX_BLOCKED_DATES {
        return Err(EngineError::LimitExceeded("too many blocked dates"));
    }
    if settings.min_advance_hours > MAX_ADVANCE_HOURS {
        return Err(EngineError::Validation(
            "min_advance_hours is larger than a year".into(),
        ));
    }
    let mut seen = HashSet::new();
    for slot in &settings.slots {
        if slot.id.is_empty() {
            return Err(EngineError::Validation("slot id must not be empty".into()));
        }
        if slot.id == FULL_DAY_SLOT_ID {
            return Err(EngineError::Validation(format!(
                "slot id {FULL_DAY_SLOT_ID:?} is reserved"
            )));
        }
        if slot.id.len() > MAX_NAME_LEN || slot.label.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("slot id or label too long"));
        }
        if !seen.insert(slot.id.as_str()) {
            return Err(EngineError::Validation(format!("duplicate slot id {:?}", slot.id)));
        }
        if slot.start >= slot.end {
            return Err(EngineError::Validation(format!(
                "slot {:?} must start before it ends ({} - {})",
                slot.id, slot.start, slot.end
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(id: &str, start: &str, end: &str) -> SlotDefinition {
        SlotDefinition {
            id: id.into(),
            label: id.to_uppercase(),
            start: start.parse().unwrap(),
            end: end.parse().unwrap(),
        }
    }

    fn settings(slots: Vec<SlotDefinition>, full_day_enabled: bool) -> TenantSettings {
        TenantSettings {
            slots,
            full_day_enabled,
            ..Default::default()
        }
    }

    #[test]
    fn full_day_spans_all_slots() {
        let s = settings(
            vec![slot("am", "09:00", "12:00"), slot("pm", "14:00", "18:00")],
            true,
        );
        let resolved = resolve_slots(&s);
        assert_eq!(resolved.len(), 3);
        let last = resolved.last().unwrap();
        assert_eq!(last.id, FULL_DAY_SLOT_ID);
        assert_eq!(last.start.to_string(), "09:00");
        assert_eq!(last.end.to_string(), "18:00");
        assert_eq!(last.label, "Full Day (09:00 - 18:00)");
    }

    #[test]
    fn full_day_disabled_leaves_list_alone() {
        let s = settings(
            vec![slot("am", "09:00", "12:00"), slot("pm", "14:00", "18:00")],
            false,
        );
        let resolved = resolve_slots(&s);
        assert_eq!(resolved, s.slots);
    }

    #[test]
    fn empty_list_never_gets_full_day() {
        assert!(resolve_slots(&settings(vec![], true)).is_empty());
        assert!(resolve_slots(&settings(vec![], false)).is_empty());
    }

    #[test]
    fn full_day_uses_extremes_not_first_and_last() {
        // Insertion order is not time order.
        let s = settings(
            vec![
                slot("late", "17:00", "20:00"),
                slot("early", "07:30", "10:00"),
                slot("mid", "11:00", "13:00"),
            ],
            true,
        );
        let resolved = resolve_slots(&s);
        assert_eq!(resolved[0].id, "late");
        assert_eq!(resolved[1].id, "early");
        let fd = &resolved[3];
        assert_eq!(fd.start.to_string(), "07:30");
        assert_eq!(fd.end.to_string(), "20:00");
    }

    #[test]
    fn find_slot_sees_full_day() {
        let s = settings(vec![slot("am", "09:00", "12:00")], true);
        assert!(find_slot(&s, FULL_DAY_SLOT_ID).is_some());
        assert!(find_slot(&s, "am").is_some());
        assert!(find_slot(&s, "pm").is_none());
    }

    #[test]
    fn validate_rejects_reserved_and_duplicate_ids() {
        let reserved = settings(vec![slot(FULL_DAY_SLOT_ID, "09:00", "12:00")], false);
        assert!(matches!(validate_settings(&reserved), Err(EngineError::Validation(_))));

        let dup = settings(
            vec![slot("am", "09:00", "12:00"), slot("am", "13:00", "14:00")],
            false,
        );
        assert!(matches!(validate_settings(&dup), Err(EngineError::Validation(_))));
    }

    #[test]
    fn validate_rejects_inverted_slot() {
        let s = settings(vec![slot("night", "22:00", "06:00")], false);
        assert!(matches!(validate_settings(&s), Err(EngineError::Validation(_))));
    }

    #[test]
    fn validate_accepts_sane_settings() {
        let s = settings(
            vec![slot("am", "09:00", "12:00"), slot("pm", "14:00", "18:00")],
            true,
        );
        assert!(validate_settings(&s).is_ok());
    }
}
