use thiserror::Error;
use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("tenant not found: {0}")]
    TenantNotFound(String),
    #[error("item not found: {0}")]
    ItemNotFound(Ulid),
    #[error("reservation not found: {0}")]
    ReservationNotFound(Ulid),
    #[error("no reservation for that confirmation token")]
    TokenNotFound,
    #[error("no reservation with booking code {0}")]
    BookingCodeNotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("capacity exceeded: {available} available, {requested} requested")]
    CapacityExceeded { available: u32, requested: u32 },
    #[error("hold expired at {expired_at}")]
    Expired { expired_at: Ms },
    #[error("reservation {id} is {status}")]
    InvalidState { id: Ulid, status: &'static str },
    #[error("item {0} still has live reservations")]
    ItemInUse(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Stable machine-readable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::TenantNotFound(_)
            | EngineError::ItemNotFound(_)
            | EngineError::ReservationNotFound(_)
            | EngineError::TokenNotFound
            | EngineError::BookingCodeNotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Validation(_) => "validation_error",
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::Expired { .. } => "expired",
            EngineError::InvalidState { .. } | EngineError::ItemInUse(_) => "invalid_state",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "storage_error",
        }
    }

    /// Message safe to show an end user. Storage failures are not described.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::CapacityExceeded { available, .. } => format!(
                "Not enough units left for this slot ({available} available). \
                 Another customer may have taken them while you waited."
            ),
            EngineError::Expired { .. } => {
                "This confirmation link has expired. Please make a new reservation.".into()
            }
            EngineError::TokenNotFound => "This confirmation link is not valid.".into(),
            EngineError::InvalidState { status, .. } => {
                format!("This reservation can no longer be changed (it is {status}).")
            }
            EngineError::WalError(_) => {
                "The request could not be saved. Please try again.".into()
            }
            other => other.to_string(),
        }
    }
}
