use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

/// Error taxonomy for the event-propagation core.
///
/// Business-rule failures (validation, state conflicts, balance violations)
/// are surfaced synchronously to the caller and roll back the enclosing
/// transaction. Infrastructure failures are retried by the outbox relay or
/// by consumer redelivery and never reach an end user directly.
#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid state: order is {current}, cannot {attempted}")]
    StateConflict { current: String, attempted: String },

    #[error("Insufficient stock for {sku}: available {available}, requested {requested}")]
    InsufficientStock {
        sku: String,
        available: i32,
        requested: i32,
    },

    #[error("Overpayment: attempted {attempted}, outstanding balance {outstanding}")]
    Overpayment {
        attempted: Decimal,
        outstanding: Decimal,
    },

    #[error("Over-return: requested {requested}, net delivered {available}")]
    OverReturn { requested: i32, available: i32 },

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    #[error("Event bus error: {0}")]
    EventBusError(String),

    #[error("Poison message: {0}")]
    PoisonMessage(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl ServiceError {
    /// True when retrying the same call without operator intervention can
    /// succeed (transient infrastructure failures).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServiceError::DatabaseError(_)
                | ServiceError::EventBusError(_)
                | ServiceError::ConcurrentModification(_)
        )
    }
}
