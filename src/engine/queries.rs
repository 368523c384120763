use std::collections::BTreeMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar::{local_span, parse_timezone};
use crate::model::*;
use crate::slots::{find_slot, resolve_slots};

use super::availability::{HoldPolicy, remaining_capacity, reserved_quantity};
use super::conflict::now_ms;
use super::{Engine, EngineError};

impl Engine {
    /// Remaining units per item for a local wall-clock interval on `date`.
    /// Never cached: every call reads the current rows.
    pub async fn compute_availability(
        &self,
        date: NaiveDate,
        start: SlotTime,
        end: SlotTime,
    ) -> Result<BTreeMap<Ulid, u32>, EngineError> {
        self.compute_availability_at(date, start, end, now_ms()).await
    }

    pub async fn compute_availability_at(
        &self,
        date: NaiveDate,
        start: SlotTime,
        end: SlotTime,
        now: Ms,
    ) -> Result<BTreeMap<Ulid, u32>, EngineError> {
        let profile = self.require_profile().await?;
        let tz = parse_timezone(&profile.timezone)?;
        let span = local_span(date, start, end, tz)?;
        Ok(self.availability_for_span(&span, now).await)
    }

    pub async fn availability_for_slot(
        &self,
        date: NaiveDate,
        slot_id: &str,
    ) -> Result<BTreeMap<Ulid, u32>, EngineError> {
        self.availability_for_slot_at(date, slot_id, now_ms()).await
    }

    pub async fn availability_for_slot_at(
        &self,
        date: NaiveDate,
        slot_id: &str,
        now: Ms,
    ) -> Result<BTreeMap<Ulid, u32>, EngineError> {
        let profile = self.require_profile().await?;
        let slot = find_slot(&profile.settings, slot_id)
            .ok_or_else(|| EngineError::Validation(format!("unknown slot {slot_id:?}")))?;
        let tz = parse_timezone(&profile.timezone)?;
        let span = local_span(date, slot.start, slot.end, tz)?;
        Ok(self.availability_for_span(&span, now).await)
    }

    pub(crate) async fn availability_for_span(&self, span: &Span, now: Ms) -> BTreeMap<Ulid, u32> {
        let mut out = BTreeMap::new();
        for id in self.store.item_ids() {
            let Some(shared) = self.store.get_item(&id) else {
                continue;
            };
            let guard = shared.read().await;
            let reserved = reserved_quantity(&guard, span, HoldPolicy::Live, now, None);
            out.insert(id, remaining_capacity(&guard.item, reserved));
        }
        out
    }

    pub async fn profile(&self) -> Option<TenantProfile> {
        self.profile.read().await.clone()
    }

    /// Effective slot list, full-day slot included when enabled.
    pub async fn resolved_slots(&self) -> Result<Vec<SlotDefinition>, EngineError> {
        let profile = self.require_profile().await?;
        Ok(resolve_slots(&profile.settings))
    }

    pub async fn list_items(&self) -> Vec<InventoryItem> {
        let mut ids = self.store.item_ids();
        ids.sort();
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(shared) = self.store.get_item(&id) {
                items.push(shared.read().await.item.clone());
            }
        }
        items
    }

    pub async fn fetch_item(&self, id: Ulid) -> Result<InventoryItem, EngineError> {
        let shared = self.shared_item(&id)?;
        let guard = shared.read().await;
        Ok(guard.item.clone())
    }

    /// Every reservation on the item, in start order, whatever its status.
    pub async fn reservations_for_item(&self, item_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        let shared = self.shared_item(&item_id)?;
        let guard = shared.read().await;
        Ok(guard.reservations.clone())
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let item_id = self
            .store
            .item_for_reservation(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let shared = self.shared_item(&item_id)?;
        let guard = shared.read().await;
        guard
            .reservation(id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))
    }

    /// Look up a confirmed reservation by the code shown to the customer.
    pub async fn reservation_by_code(&self, code: &str) -> Result<Reservation, EngineError> {
        let id = self
            .store
            .reservation_for_code(&code.to_ascii_uppercase())
            .ok_or_else(|| EngineError::BookingCodeNotFound(code.to_string()))?;
        self.get_reservation(id).await
    }
}
