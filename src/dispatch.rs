//! Outbound customer/admin notifications.
//!
//! Delivery is never part of a capacity decision: the engine calls these
//! after its locks are released, and a failure only produces a warning.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::limits::DISPATCH_TIMEOUT_MS;
use crate::model::Reservation;
use crate::observability;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("timed out after {0} ms")]
    Timeout(u64),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Email the single-use confirmation link for a pending hold.
    async fn send_confirmation_link(
        &self,
        address: &str,
        tenant_slug: &str,
        token: &str,
    ) -> Result<(), DispatchError>;

    async fn send_booking_recap(
        &self,
        address: &str,
        reservation: &Reservation,
    ) -> Result<(), DispatchError>;

    async fn send_admin_notification(
        &self,
        admin_address: &str,
        reservation: &Reservation,
    ) -> Result<(), DispatchError>;
}

/// Writes every notification to the log instead of sending it.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_confirmation_link(
        &self,
        address: &str,
        tenant_slug: &str,
        _token: &str,
    ) -> Result<(), DispatchError> {
        tracing::info!(to = address, tenant = tenant_slug, "confirmation link");
        Ok(())
    }

    async fn send_booking_recap(
        &self,
        address: &str,
        reservation: &Reservation,
    ) -> Result<(), DispatchError> {
        tracing::info!(
            to = address,
            reservation = %reservation.id,
            code = reservation.booking_code.as_deref().unwrap_or("-"),
            "booking recap"
        );
        Ok(())
    }

    async fn send_admin_notification(
        &self,
        admin_address: &str,
        reservation: &Reservation,
    ) -> Result<(), DispatchError> {
        tracing::info!(to = admin_address, reservation = %reservation.id, "admin notification");
        Ok(())
    }
}

/// Run one delivery with a deadline. Returns whether it went out.
pub async fn deliver<F>(kind: &'static str, send: F) -> bool
where
    F: Future<Output = Result<(), DispatchError>>,
{
    let result = match tokio::time::timeout(Duration::from_millis(DISPATCH_TIMEOUT_MS), send).await
    {
        Ok(r) => r,
        Err(_) => Err(DispatchError::Timeout(DISPATCH_TIMEOUT_MS)),
    };
    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(kind, "notification not delivered: {e}");
            metrics::counter!(observability::DISPATCH_FAILURES_TOTAL, "kind" => kind).increment(1);
            false
        }
    }
}
