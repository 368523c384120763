use ulid::Ulid;

use crate::audit::{Actor, AuditEvent};
use crate::calendar::parse_timezone;
use crate::dispatch::deliver;
use crate::limits::*;
use crate::model::*;
use crate::slots::validate_settings;

use super::availability::{HoldPolicy, counts_toward_capacity};
use super::conflict::now_ms;
use super::{Engine, EngineError, WalCommand};

use tokio::sync::oneshot;

pub(crate) fn validate_profile(profile: &TenantProfile) -> Result<(), EngineError> {
    if profile.slug.is_empty() || profile.slug.len() > MAX_TENANT_SLUG_LEN {
        return Err(EngineError::Validation("tenant slug must be 1-64 characters".into()));
    }
    if !profile
        .slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(EngineError::Validation(format!(
            "tenant slug {:?} may only contain a-z, 0-9, '-' and '_'",
            profile.slug
        )));
    }
    if profile.name.trim().is_empty() {
        return Err(EngineError::Validation("tenant name is required".into()));
    }
    if profile.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("tenant name too long"));
    }
    if let Some(email) = &profile.admin_email
        && (email.len() > MAX_CONTACT_LEN || !email.contains('@'))
    {
        return Err(EngineError::Validation(format!("invalid admin email {email:?}")));
    }
    parse_timezone(&profile.timezone)?;
    validate_settings(&profile.settings)
}

fn validate_item(item: &InventoryItem) -> Result<(), EngineError> {
    if item.name.trim().is_empty() {
        return Err(EngineError::Validation("item name is required".into()));
    }
    if item.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("item name too long"));
    }
    if item.total_stock > MAX_STOCK {
        return Err(EngineError::LimitExceeded("stock too large"));
    }
    if item.broken_count > item.total_stock {
        return Err(EngineError::Validation(format!(
            "broken count {} exceeds total stock {}",
            item.broken_count, item.total_stock
        )));
    }
    Ok(())
}

impl Engine {
    // ── Tenant ───────────────────────────────────────────────

    /// Set (or replace) the tenant profile.
    pub async fn configure(&self, profile: TenantProfile) -> Result<(), EngineError> {
        validate_profile(&profile)?;
        let mut current = self.profile.write().await;
        let event = Event::TenantConfigured {
            profile: profile.clone(),
        };
        self.persist(&event).await?;
        *current = Some(profile);
        Ok(())
    }

    pub async fn update_settings(&self, settings: TenantSettings) -> Result<TenantProfile, EngineError> {
        validate_settings(&settings)?;
        let mut current = self.profile.write().await;
        let mut profile = current
            .clone()
            .ok_or_else(|| EngineError::TenantNotFound(self.name().to_string()))?;
        profile.settings = settings;

        let event = Event::TenantConfigured {
            profile: profile.clone(),
        };
        self.persist(&event).await?;
        *current = Some(profile.clone());
        drop(current);

        self.ctx.audit.record(AuditEvent::new(
            "tenant.settings_updated",
            Actor::Admin,
            &profile.slug,
            None,
        ));
        Ok(profile)
    }

    // ── Inventory ────────────────────────────────────────────

    pub async fn create_item(&self, item: InventoryItem) -> Result<(), EngineError> {
        validate_item(&item)?;
        let profile = self.profile.read().await;
        if self.store.item_count() >= MAX_ITEMS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many items"));
        }
        if self.store.contains_item(&item.id) {
            return Err(EngineError::AlreadyExists(item.id.to_string()));
        }

        let event = Event::ItemCreated { item: item.clone() };
        self.persist(&event).await?;
        let id = item.id;
        self.store.insert_item(ItemState::new(item));
        drop(profile);

        self.ctx
            .audit
            .record(AuditEvent::new("item.created", Actor::Admin, self.name(), Some(id)));
        Ok(())
    }

    /// Replace an item's name, counts and cost. Shrinking stock below what
    /// is already reserved is allowed; availability floors at zero.
    pub async fn update_item(&self, item: InventoryItem) -> Result<(), EngineError> {
        validate_item(&item)?;
        let shared = self.shared_item(&item.id)?;
        let mut guard = shared.write().await;
        if !self.store.contains_item(&item.id) {
            return Err(EngineError::ItemNotFound(item.id));
        }
        let id = item.id;
        let event = Event::ItemUpdated { item };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        self.ctx
            .audit
            .record(AuditEvent::new("item.updated", Actor::Admin, self.name(), Some(id)));
        Ok(())
    }

    /// Remove an item. Refused while it still has confirmed reservations or
    /// unexpired holds.
    pub async fn delete_item(&self, id: Ulid) -> Result<(), EngineError> {
        let _profile = self.profile.read().await;
        let shared = self.shared_item(&id)?;
        let guard = shared.write().await;
        if !self.store.contains_item(&id) {
            return Err(EngineError::ItemNotFound(id));
        }
        let now = now_ms();
        if guard
            .reservations
            .iter()
            .any(|r| counts_toward_capacity(r, HoldPolicy::Live, now))
        {
            return Err(EngineError::ItemInUse(id));
        }

        self.persist(&Event::ItemDeleted { id }).await?;
        self.store.remove_item(&guard);
        drop(guard);

        self.ctx
            .audit
            .record(AuditEvent::new("item.deleted", Actor::Admin, self.name(), Some(id)));
        Ok(())
    }

    // ── Reservation administration ───────────────────────────

    /// Administrative move to a terminal state. Cancelling frees the units
    /// immediately.
    pub async fn transition_reservation(
        &self,
        id: Ulid,
        next: TerminalStatus,
    ) -> Result<Reservation, EngineError> {
        let mut guard = self.lock_reservation_item(id).await?;
        let current = guard
            .reservation(id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        if !current.status.can_transition_to(next) {
            return Err(EngineError::InvalidState {
                id,
                status: current.status.label(),
            });
        }
        let event = Event::ReservationStatusChanged {
            id,
            item_id: current.item_id,
            status: next,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let updated = guard
            .reservation(id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))?;
        drop(guard);

        tracing::info!(tenant = %self.name(), reservation = %id, status = next.label(), "reservation status changed");
        self.ctx.audit.record(AuditEvent::new(
            match next {
                TerminalStatus::Cancelled => "reservation.cancelled",
                TerminalStatus::Completed => "reservation.completed",
                TerminalStatus::NoShow => "reservation.no_show",
                TerminalStatus::Paid => "reservation.paid",
            },
            Actor::Admin,
            self.name(),
            Some(id),
        ));
        Ok(updated)
    }

    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.transition_reservation(id, TerminalStatus::Cancelled).await
    }

    /// Add to the paid amount. Only reservations that went through
    /// confirmation can take money.
    pub async fn record_payment(&self, id: Ulid, amount_cents: u64) -> Result<Reservation, EngineError> {
        if amount_cents == 0 {
            return Err(EngineError::Validation("payment amount must be positive".into()));
        }
        let mut guard = self.lock_reservation_item(id).await?;
        let current = guard
            .reservation(id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        match &current.status {
            ReservationStatus::Confirmed | ReservationStatus::Completed | ReservationStatus::Paid => {}
            other => {
                return Err(EngineError::InvalidState {
                    id,
                    status: other.label(),
                });
            }
        }
        let event = Event::PaymentRecorded {
            id,
            item_id: current.item_id,
            amount_cents,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let updated = guard
            .reservation(id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))?;
        drop(guard);

        self.ctx
            .audit
            .record(AuditEvent::new("reservation.payment_recorded", Actor::Admin, self.name(), Some(id)));
        Ok(updated)
    }

    /// Send the confirmation link again for a hold that is still live.
    pub async fn resend_confirmation_link(&self, id: Ulid) -> Result<bool, EngineError> {
        self.resend_confirmation_link_at(id, now_ms()).await
    }

    pub async fn resend_confirmation_link_at(&self, id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let profile = self.require_profile().await?;
        let item_id = self
            .store
            .item_for_reservation(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let shared = self.shared_item(&item_id)?;
        let (email, token) = {
            let guard = shared.read().await;
            let r = guard
                .reservation(id)
                .ok_or(EngineError::ReservationNotFound(id))?;
            match &r.status {
                ReservationStatus::PendingConfirm { token, expires_at } => {
                    if *expires_at <= now {
                        return Err(EngineError::Expired {
                            expired_at: *expires_at,
                        });
                    }
                    (r.customer.email.clone(), token.clone())
                }
                other => {
                    return Err(EngineError::InvalidState {
                        id,
                        status: other.label(),
                    });
                }
            }
        };

        let sent = deliver(
            "confirmation_link",
            self.ctx
                .notifier
                .send_confirmation_link(&email, &profile.slug, &token),
        )
        .await;
        self.ctx.audit.record(AuditEvent::new(
            "reservation.link_resent",
            Actor::Customer,
            &profile.slug,
            Some(id),
        ));
        Ok(sent)
    }

    // ── Compaction ───────────────────────────────────────────

    /// Rewrite the WAL with only the events needed to rebuild current state.
    /// Issued tokens are kept for every reservation so a repeated confirm
    /// stays idempotent after a restart.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Holding the profile lock keeps items from being added or removed;
        // holding every item's read lock keeps reservation writes out.
        let profile = self.profile.write().await;
        self.ensure_open()?;
        let mut events = Vec::new();
        if let Some(p) = profile.as_ref() {
            events.push(Event::TenantConfigured { profile: p.clone() });
        }

        let mut ids = self.store.item_ids();
        ids.sort();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(shared) = self.store.get_item(&id) {
                guards.push(shared.read_owned().await);
            }
        }
        for guard in &guards {
            events.push(Event::ItemCreated {
                item: guard.item.clone(),
            });
            for r in &guard.reservations {
                let token = match &r.status {
                    ReservationStatus::PendingConfirm { token, .. } => token.clone(),
                    _ => self.store.issued_token(&r.id).unwrap_or_default(),
                };
                events.push(Event::ReservationPlaced {
                    reservation: r.clone(),
                    token,
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| self.wal_failure(e))?;
        drop(guards);
        drop(profile);

        tracing::info!(tenant = %self.name(), events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
