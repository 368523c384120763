use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::SharedItemState;

/// Per-tenant in-memory state: one lockable `ItemState` per item plus the
/// lookup indexes that cross item boundaries.
pub struct InMemoryStore {
    items: DashMap<Ulid, SharedItemState>,
    reservation_to_item: DashMap<Ulid, Ulid>,
    /// Every token ever issued, consumed ones included.
    tokens: DashMap<String, Ulid>,
    issued_tokens: DashMap<Ulid, String>,
    booking_codes: DashMap<String, Ulid>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            items: DashMap::new(),
            reservation_to_item: DashMap::new(),
            tokens: DashMap::new(),
            issued_tokens: DashMap::new(),
            booking_codes: DashMap::new(),
        }
    }

    // ── Items ────────────────────────────────────────────────

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn contains_item(&self, id: &Ulid) -> bool {
        self.items.contains_key(id)
    }

    pub fn get_item(&self, id: &Ulid) -> Option<SharedItemState> {
        self.items.get(id).map(|e| e.value().clone())
    }

    pub fn insert_item(&self, state: ItemState) {
        self.items.insert(state.item.id, Arc::new(RwLock::new(state)));
    }

    /// Drop the item and every index entry pointing into it. The caller
    /// holds the item's lock, so no reservation can be added concurrently.
    pub fn remove_item(&self, state: &ItemState) {
        for r in &state.reservations {
            self.reservation_to_item.remove(&r.id);
            if let Some((_, token)) = self.issued_tokens.remove(&r.id) {
                self.tokens.remove(&token);
            }
            if let Some(code) = &r.booking_code {
                self.booking_codes.remove(code);
            }
        }
        self.items.remove(&state.item.id);
    }

    pub fn item_ids(&self) -> Vec<Ulid> {
        self.items.iter().map(|e| *e.key()).collect()
    }

    // ── Reservation indexes ──────────────────────────────────

    pub fn item_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_item.get(reservation_id).map(|e| *e.value())
    }

    pub fn reservation_for_token(&self, token: &str) -> Option<Ulid> {
        self.tokens.get(token).map(|e| *e.value())
    }

    pub fn issued_token(&self, reservation_id: &Ulid) -> Option<String> {
        self.issued_tokens.get(reservation_id).map(|e| e.value().clone())
    }

    pub fn reservation_for_code(&self, code: &str) -> Option<Ulid> {
        self.booking_codes.get(code).map(|e| *e.value())
    }

    /// Claim `code` for `reservation_id`. False if another reservation
    /// already holds it.
    pub fn reserve_booking_code(&self, code: &str, reservation_id: Ulid) -> bool {
        match self.booking_codes.entry(code.to_string()) {
            Entry::Occupied(o) => *o.get() == reservation_id,
            Entry::Vacant(v) => {
                v.insert(reservation_id);
                true
            }
        }
    }

    /// Give back a claimed code whose confirmation never reached the log.
    pub fn release_booking_code(&self, code: &str, reservation_id: Ulid) {
        self.booking_codes
            .remove_if(code, |_, owner| *owner == reservation_id);
    }

    // ── Event application ────────────────────────────────────

    /// Apply an item-scoped event (caller holds the item's write lock).
    /// Item creation/deletion and tenant configuration happen at map level.
    pub fn apply_event(&self, state: &mut ItemState, event: &Event) {
        match event {
            Event::ReservationPlaced { reservation, token } => {
                self.reservation_to_item
                    .insert(reservation.id, reservation.item_id);
                self.tokens.insert(token.clone(), reservation.id);
                self.issued_tokens.insert(reservation.id, token.clone());
                if let Some(code) = &reservation.booking_code {
                    self.booking_codes.insert(code.clone(), reservation.id);
                }
                state.insert_reservation(reservation.clone());
            }
            Event::ReservationConfirmed {
                id,
                booking_code,
                accepted_at,
                ..
            } => {
                if let Some(r) = state.reservation_mut(*id) {
                    r.status = ReservationStatus::Confirmed;
                    r.booking_code = Some(booking_code.clone());
                    r.terms_accepted_at = Some(*accepted_at);
                    self.booking_codes.insert(booking_code.clone(), *id);
                }
            }
            Event::ReservationStatusChanged { id, status, .. } => {
                if let Some(r) = state.reservation_mut(*id) {
                    r.status = status.as_status();
                }
            }
            Event::PaymentRecorded {
                id, amount_cents, ..
            } => {
                if let Some(r) = state.reservation_mut(*id) {
                    r.paid_cents = r.paid_cents.saturating_add(*amount_cents);
                }
            }
            Event::ItemUpdated { item } => {
                state.item = item.clone();
            }
            Event::TenantConfigured { .. } | Event::ItemCreated { .. } | Event::ItemDeleted { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn booking_code_claimed_once() {
        let store = InMemoryStore::new();
        let (first, second) = (Ulid::new(), Ulid::new());

        assert!(store.reserve_booking_code("KM7P-Q2XR", first));
        assert!(!store.reserve_booking_code("KM7P-Q2XR", second));
        assert!(store.reserve_booking_code("KM7P-Q2XR", first));
        assert_eq!(store.reservation_for_code("KM7P-Q2XR"), Some(first));

        // Only the owner can release it.
        store.release_booking_code("KM7P-Q2XR", second);
        assert_eq!(store.reservation_for_code("KM7P-Q2XR"), Some(first));
        store.release_booking_code("KM7P-Q2XR", first);
        assert!(store.reserve_booking_code("KM7P-Q2XR", second));
    }
}
