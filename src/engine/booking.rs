//! Customer-facing write path: placing a pending hold and confirming it.
//!
//! Both transactions run check → WAL append → apply under the item's write
//! lock, so two requests racing for the last unit serialize on that lock and
//! the loser sees the winner's row. Notifications go out after the lock is
//! released.

use chrono::NaiveDate;
use ulid::Ulid;

use crate::audit::{Actor, AuditEvent};
use crate::calendar::{local_span, parse_timezone};
use crate::codes::{new_booking_code, new_confirmation_token};
use crate::dispatch::deliver;
use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::slots::find_slot;

use super::availability::{HoldPolicy, quote_cents};
use super::conflict::{check_capacity, now_ms};
use super::{Engine, EngineError};

const HOUR_MS: Ms = 3_600_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub item_id: Ulid,
    pub date: NaiveDate,
    pub slot_id: String,
    pub quantity: u32,
    pub customer: CustomerContact,
}

#[derive(Debug, Clone)]
pub struct PlacedReservation {
    pub reservation: Reservation,
    /// False when the confirmation link could not be sent. The hold stands
    /// and the customer can ask for the link again.
    pub link_dispatched: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed(Reservation),
    /// The token was already used. Nothing changed and nothing was sent.
    AlreadyConfirmed(Reservation),
}

impl Confirmation {
    pub fn reservation(&self) -> &Reservation {
        match self {
            Confirmation::Confirmed(r) | Confirmation::AlreadyConfirmed(r) => r,
        }
    }

    pub fn already_confirmed(&self) -> bool {
        matches!(self, Confirmation::AlreadyConfirmed(_))
    }
}

fn validate_request(req: &ReservationRequest) -> Result<(), EngineError> {
    if req.quantity == 0 {
        return Err(EngineError::Validation("quantity must be at least 1".into()));
    }
    if req.quantity > MAX_QUANTITY {
        return Err(EngineError::LimitExceeded("quantity too large"));
    }
    let c = &req.customer;
    if c.name.trim().is_empty() {
        return Err(EngineError::Validation("customer name is required".into()));
    }
    if c.email.trim().is_empty() {
        return Err(EngineError::Validation("customer email is required".into()));
    }
    if !c.email.contains('@') {
        return Err(EngineError::Validation(format!("invalid email {:?}", c.email)));
    }
    if c.name.len() > MAX_NAME_LEN
        || c.email.len() > MAX_CONTACT_LEN
        || c.phone.as_ref().is_some_and(|p| p.len() > MAX_CONTACT_LEN)
    {
        return Err(EngineError::LimitExceeded("contact field too long"));
    }
    Ok(())
}

impl Engine {
    /// Place a pending hold for the requested slot.
    pub async fn create_pending_reservation(
        &self,
        req: ReservationRequest,
    ) -> Result<PlacedReservation, EngineError> {
        self.place_reservation_at(req, now_ms()).await
    }

    pub async fn place_reservation_at(
        &self,
        req: ReservationRequest,
        now: Ms,
    ) -> Result<PlacedReservation, EngineError> {
        validate_request(&req)?;
        let profile = self.require_profile().await?;
        let settings = &profile.settings;

        let slot = find_slot(settings, &req.slot_id)
            .ok_or_else(|| EngineError::Validation(format!("unknown slot {:?}", req.slot_id)))?;
        if settings.is_blocked(req.date) {
            return Err(EngineError::Validation(format!(
                "{} is not open for reservations",
                req.date
            )));
        }
        let tz = parse_timezone(&profile.timezone)?;
        let span = local_span(req.date, slot.start, slot.end, tz)?;
        let earliest = now + settings.min_advance_hours as Ms * HOUR_MS;
        if span.start < earliest {
            return Err(EngineError::Validation(format!(
                "reservations must start at least {} hours from now",
                settings.min_advance_hours
            )));
        }

        let shared = self.shared_item(&req.item_id)?;
        let mut guard = shared.write().await;
        if !self.store.contains_item(&req.item_id) {
            return Err(EngineError::ItemNotFound(req.item_id));
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_ITEM {
            return Err(EngineError::LimitExceeded("too many reservations on item"));
        }

        if let Err(e) = check_capacity(&guard, &span, req.quantity, HoldPolicy::Conservative, now, None) {
            metrics::counter!(observability::CAPACITY_REJECTIONS_TOTAL, "stage" => "create")
                .increment(1);
            return Err(e);
        }

        let token = new_confirmation_token();
        let reservation = Reservation {
            id: Ulid::new(),
            item_id: req.item_id,
            span,
            date: req.date,
            slot_id: slot.id,
            quantity: req.quantity,
            customer: req.customer,
            status: ReservationStatus::PendingConfirm {
                token: token.clone(),
                expires_at: now + self.ctx.hold_ttl_ms,
            },
            created_at: now,
            booking_code: None,
            terms_accepted_at: None,
            quoted_cents: quote_cents(&guard.item, &span, req.quantity),
            paid_cents: 0,
        };
        let event = Event::ReservationPlaced {
            reservation: reservation.clone(),
            token: token.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        metrics::counter!(observability::RESERVATIONS_CREATED_TOTAL).increment(1);
        tracing::info!(
            tenant = %profile.slug,
            item = %reservation.item_id,
            reservation = %reservation.id,
            quantity = reservation.quantity,
            "pending reservation placed"
        );

        let link_dispatched = deliver(
            "confirmation_link",
            self.ctx.notifier.send_confirmation_link(
                &reservation.customer.email,
                &profile.slug,
                &token,
            ),
        )
        .await;
        self.ctx.audit.record(AuditEvent::new(
            "reservation.created",
            Actor::Customer,
            &profile.slug,
            Some(reservation.id),
        ));

        Ok(PlacedReservation {
            reservation,
            link_dispatched,
        })
    }

    /// Turn a pending hold into a confirmed reservation.
    pub async fn confirm_reservation(
        &self,
        token: &str,
        accepted_terms: bool,
    ) -> Result<Confirmation, EngineError> {
        self.confirm_reservation_at(token, accepted_terms, now_ms()).await
    }

    pub async fn confirm_reservation_at(
        &self,
        token: &str,
        accepted_terms: bool,
        now: Ms,
    ) -> Result<Confirmation, EngineError> {
        if !accepted_terms {
            return Err(EngineError::Validation("the rental terms must be accepted".into()));
        }
        let profile = self.require_profile().await?;
        let id = self
            .store
            .reservation_for_token(token)
            .ok_or(EngineError::TokenNotFound)?;

        let mut guard = self.lock_reservation_item(id).await?;
        let current = guard
            .reservation(id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))?;

        let expires_at = match &current.status {
            ReservationStatus::Confirmed => {
                metrics::counter!(observability::CONFIRMATIONS_TOTAL, "outcome" => "already_confirmed")
                    .increment(1);
                return Ok(Confirmation::AlreadyConfirmed(current));
            }
            ReservationStatus::PendingConfirm { expires_at, .. } => *expires_at,
            other => {
                return Err(EngineError::InvalidState {
                    id,
                    status: other.label(),
                });
            }
        };

        // Capacity first: a hold that lost its units reports that, even if
        // it has also expired.
        if let Err(e) = check_capacity(
            &guard,
            &current.span,
            current.quantity,
            HoldPolicy::Live,
            now,
            Some(id),
        ) {
            metrics::counter!(observability::CAPACITY_REJECTIONS_TOTAL, "stage" => "confirm")
                .increment(1);
            metrics::counter!(observability::CONFIRMATIONS_TOTAL, "outcome" => "capacity_exceeded")
                .increment(1);
            return Err(e);
        }
        if expires_at <= now {
            metrics::counter!(observability::CONFIRMATIONS_TOTAL, "outcome" => "expired")
                .increment(1);
            return Err(EngineError::Expired {
                expired_at: expires_at,
            });
        }

        let booking_code = self.unique_booking_code(id)?;
        let event = Event::ReservationConfirmed {
            id,
            item_id: current.item_id,
            booking_code: booking_code.clone(),
            accepted_at: now,
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            self.store.release_booking_code(&booking_code, id);
            return Err(e);
        }
        let confirmed = guard
            .reservation(id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))?;
        drop(guard);

        metrics::counter!(observability::CONFIRMATIONS_TOTAL, "outcome" => "confirmed").increment(1);
        tracing::info!(
            tenant = %profile.slug,
            reservation = %id,
            code = confirmed.booking_code.as_deref().unwrap_or_default(),
            "reservation confirmed"
        );

        deliver(
            "booking_recap",
            self.ctx
                .notifier
                .send_booking_recap(&confirmed.customer.email, &confirmed),
        )
        .await;
        if let Some(admin) = profile.admin_email.as_deref() {
            deliver(
                "admin_notification",
                self.ctx.notifier.send_admin_notification(admin, &confirmed),
            )
            .await;
        }
        self.ctx.audit.record(AuditEvent::new(
            "reservation.confirmed",
            Actor::Customer,
            &profile.slug,
            Some(id),
        ));

        Ok(Confirmation::Confirmed(confirmed))
    }

    /// Draw a code and claim it in the index before the event is logged, so
    /// two confirmations on different items never share one.
    fn unique_booking_code(&self, reservation_id: Ulid) -> Result<String, EngineError> {
        for _ in 0..MAX_BOOKING_CODE_ATTEMPTS {
            let code = new_booking_code();
            if self.store.reserve_booking_code(&code, reservation_id) {
                return Ok(code);
            }
        }
        Err(EngineError::LimitExceeded("booking code space exhausted"))
    }
}
