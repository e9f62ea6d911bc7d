//! Typed access to the durable store.
//!
//! Every method that changes whether a booking counts toward capacity also moves
//! `reservation_stats.active_count` inside the same transaction, and only when
//! its status guard actually matched a row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::*;
use uuid::Uuid;

use crate::error::StoreError;

#[cfg(test)]
pub mod memory;
pub mod postgres;

pub use postgres::PgStore;

#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// Inserted as `pending_external`.
    Claimed(Booking),
    /// The idempotency key already had a booking.
    Existing(Booking),
    /// Booking number collision; pick another and retry.
    NumberTaken,
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn get_booking(&self, id: Uuid) -> Result<Option<Booking>, StoreError>;

    async fn find_by_idempotency_key(
        &self,
        source: BookingSource,
        payment_reference: &str,
    ) -> Result<Option<Booking>, StoreError>;

    async fn find_by_external_number(
        &self,
        external_number: &str,
    ) -> Result<Option<Booking>, StoreError>;

    async fn claim_booking(&self, booking: NewBooking) -> Result<ClaimOutcome, StoreError>;

    /// `from → confirmed` plus `active_count + 1`. `None` when the guard missed.
    async fn confirm_booking(
        &self,
        id: Uuid,
        from: BookingStatus,
        external_number: &str,
        audit: &ExternalAudit,
    ) -> Result<Option<Booking>, StoreError>;

    /// `from → external_failed`; the counter is left alone.
    async fn mark_external_failed(
        &self,
        id: Uuid,
        from: BookingStatus,
        audit: &ExternalAudit,
    ) -> Result<Option<Booking>, StoreError>;

    async fn record_reconcile_failure(
        &self,
        id: Uuid,
        audit: &ExternalAudit,
        next_reconcile_at: DateTime<Utc>,
    ) -> Result<Option<Booking>, StoreError>;

    /// `confirmed → cancelled` plus `active_count - 1`.
    async fn cancel_booking(
        &self,
        id: Uuid,
        audit: &ExternalAudit,
    ) -> Result<Option<Booking>, StoreError>;

    async fn record_external_audit(&self, id: Uuid, audit: &ExternalAudit) -> Result<(), StoreError>;

    async fn count_overlapping_active(
        &self,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    /// Scans for the true number of active bookings. Not for the hot path.
    async fn count_active(&self, now: DateTime<Utc>) -> Result<i64, StoreError>;

    /// Confirmed bookings whose window already ended but were not swept yet.
    async fn count_ended_confirmed(&self, now: DateTime<Utc>) -> Result<i64, StoreError>;

    /// Flips ended confirmed bookings to `expired` and decrements the counter by
    /// exactly the number flipped.
    async fn expire_ended(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Paid claims stuck in `pending_external` since before `created_before`.
    async fn abandon_stale_claims(
        &self,
        created_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn reconciliation_candidates(
        &self,
        now: DateTime<Utc>,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<Booking>, StoreError>;

    async fn exhausted_reconciliations(&self, max_attempts: i32) -> Result<Vec<Booking>, StoreError>;

    async fn reservation_stats(&self) -> Result<ReservationStats, StoreError>;

    async fn reservation_settings(&self) -> Result<ReservationSettings, StoreError>;

    async fn update_settings(
        &self,
        settings: &ReservationSettings,
    ) -> Result<ReservationSettings, StoreError>;
}

/// Result of one delivery attempt, applied to the task and the booking's
/// notification audit together.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptOutcome {
    pub task_id: Uuid,
    pub booking_id: Uuid,
    pub attempts: i32,
    pub status: TaskStatus,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub notification_status: NotificationStatus,
    pub finished_at: DateTime<Utc>,
}

#[async_trait]
pub trait NotificationQueue: Send + Sync {
    async fn enqueue(&self, task: NotificationTask) -> Result<(), StoreError>;

    /// Moves due `pending` tasks to `processing`. A task is returned only to the
    /// caller whose guarded update won.
    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<NotificationTask>, StoreError>;

    async fn finish_attempt(&self, outcome: &AttemptOutcome) -> Result<(), StoreError>;

    /// Returns tasks stuck in `processing` since before `stale_before` to `pending`.
    async fn requeue_stale(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn failed_tasks(&self) -> Result<Vec<NotificationTask>, StoreError>;

    async fn replay(&self, task_id: Uuid, now: DateTime<Utc>) -> Result<Option<NotificationTask>, StoreError>;
}
