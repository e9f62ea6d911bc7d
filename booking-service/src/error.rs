use shared::BookingStatus;
use thiserror::Error;
use uuid::Uuid;

use crate::slot_client::SlotApiError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("booking {0} not found")]
    BookingNotFound(Uuid),

    #[error("could not allocate a unique booking number")]
    BookingNumberExhausted,
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

/// Everything `create`/`cancel` can hand back to a caller.
#[derive(Debug, Error)]
pub enum BookingError {
    /// Malformed intent, rejected before any I/O.
    #[error("invalid booking request: {0}")]
    Validation(String),

    #[error("bookings are currently disabled")]
    BookingsDisabled,

    #[error("no capacity left for the requested window ({available} available)")]
    CapacityExceeded { available: i64 },

    #[error("booking {0} not found")]
    NotFound(String),

    #[error("booking cannot be cancelled in status {status}")]
    NotCancellable { status: BookingStatus },

    #[error("slot service call failed: {0}")]
    External(#[from] SlotApiError),

    /// Fatal for the current request; retrying the whole call is safe.
    #[error("store write failed: {0}")]
    Store(#[from] StoreError),
}

impl BookingError {
    /// Admission/validation rejections are final and actionable by the caller.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            BookingError::Validation(_)
                | BookingError::BookingsDisabled
                | BookingError::CapacityExceeded { .. }
        )
    }
}
