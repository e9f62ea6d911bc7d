//! In-process store with the same guarded-transition semantics as [`PgStore`].
//!
//! [`PgStore`]: super::PgStore

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::*;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{AttemptOutcome, BookingStore, ClaimOutcome, NotificationQueue};
use crate::error::StoreError;

#[derive(Default)]
struct State {
    bookings: HashMap<Uuid, Booking>,
    stats: ReservationStats,
    settings: ReservationSettings,
    tasks: Vec<NotificationTask>,
    fail_writes: bool,
    fail_enqueue: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_capacity: i64) -> Self {
        let store = Self::new();
        store.lock().settings.max_capacity = max_capacity;
        store
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Makes booking status writes fail, as if the database went away.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn fail_enqueue(&self, fail: bool) {
        self.lock().fail_enqueue = fail;
    }

    pub fn insert(&self, booking: Booking) {
        let mut state = self.lock();
        if booking.status == BookingStatus::Confirmed {
            state.stats.active_count += 1;
        }
        state.bookings.insert(booking.id, booking);
    }

    pub fn bookings(&self) -> Vec<Booking> {
        let mut bookings: Vec<_> = self.lock().bookings.values().cloned().collect();
        bookings.sort_by_key(|b| b.created_at);
        bookings
    }

    pub fn booking(&self, id: Uuid) -> Option<Booking> {
        self.lock().bookings.get(&id).cloned()
    }

    pub fn tasks(&self) -> Vec<NotificationTask> {
        self.lock().tasks.clone()
    }

    pub fn set_task_due(&self, task_id: Uuid, at: DateTime<Utc>) {
        if let Some(task) = self.lock().tasks.iter_mut().find(|t| t.id == task_id) {
            task.next_retry_at = at;
        }
    }

    pub fn active_count(&self) -> i64 {
        self.lock().stats.active_count
    }
}

fn write_guard(state: &State) -> Result<(), StoreError> {
    if state.fail_writes {
        return Err(StoreError::Pool("store unavailable".to_string()));
    }
    Ok(())
}

/// Applies `update` when the booking exists in status `from`.
fn transition(
    state: &mut State,
    id: Uuid,
    from: BookingStatus,
    update: impl FnOnce(&mut Booking),
) -> Result<Option<Booking>, StoreError> {
    write_guard(state)?;
    match state.bookings.get_mut(&id) {
        Some(booking) if booking.status == from => {
            update(booking);
            booking.updated_at = Utc::now();
            Ok(Some(booking.clone()))
        }
        _ => Ok(None),
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn get_booking(&self, id: Uuid) -> Result<Option<Booking>, StoreError> {
        Ok(self.lock().bookings.get(&id).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        source: BookingSource,
        payment_reference: &str,
    ) -> Result<Option<Booking>, StoreError> {
        Ok(self
            .lock()
            .bookings
            .values()
            .find(|b| b.source == source && b.payment_reference.as_deref() == Some(payment_reference))
            .cloned())
    }

    async fn find_by_external_number(
        &self,
        external_number: &str,
    ) -> Result<Option<Booking>, StoreError> {
        Ok(self
            .lock()
            .bookings
            .values()
            .find(|b| b.external_booking_number.as_deref() == Some(external_number))
            .cloned())
    }

    async fn claim_booking(&self, booking: NewBooking) -> Result<ClaimOutcome, StoreError> {
        let mut state = self.lock();
        write_guard(&state)?;

        if let Some(reference) = booking.payment.payment_reference.as_deref() {
            let existing = state.bookings.values().find(|b| {
                b.source == booking.payment.source && b.payment_reference.as_deref() == Some(reference)
            });
            if let Some(existing) = existing {
                return Ok(ClaimOutcome::Existing(existing.clone()));
            }
        }

        if state
            .bookings
            .values()
            .any(|b| b.booking_number == booking.booking_number)
        {
            return Ok(ClaimOutcome::NumberTaken);
        }

        let booking = booking.into_booking(Utc::now());
        state.bookings.insert(booking.id, booking.clone());
        Ok(ClaimOutcome::Claimed(booking))
    }

    async fn confirm_booking(
        &self,
        id: Uuid,
        from: BookingStatus,
        external_number: &str,
        audit: &ExternalAudit,
    ) -> Result<Option<Booking>, StoreError> {
        let mut state = self.lock();
        let confirmed = transition(&mut state, id, from, |b| {
            b.status = BookingStatus::Confirmed;
            b.external_booking_number = Some(external_number.to_string());
            b.next_reconcile_at = None;
            b.audit = audit.clone();
        })?;
        if confirmed.is_some() {
            state.stats.active_count += 1;
        }
        Ok(confirmed)
    }

    async fn mark_external_failed(
        &self,
        id: Uuid,
        from: BookingStatus,
        audit: &ExternalAudit,
    ) -> Result<Option<Booking>, StoreError> {
        let mut state = self.lock();
        transition(&mut state, id, from, |b| {
            b.status = BookingStatus::ExternalFailed;
            b.next_reconcile_at = Some(Utc::now());
            b.audit = audit.clone();
        })
    }

    async fn record_reconcile_failure(
        &self,
        id: Uuid,
        audit: &ExternalAudit,
        next_reconcile_at: DateTime<Utc>,
    ) -> Result<Option<Booking>, StoreError> {
        let mut state = self.lock();
        transition(&mut state, id, BookingStatus::ExternalFailed, |b| {
            b.reconcile_attempts += 1;
            b.next_reconcile_at = Some(next_reconcile_at);
            b.audit = audit.clone();
        })
    }

    async fn cancel_booking(
        &self,
        id: Uuid,
        audit: &ExternalAudit,
    ) -> Result<Option<Booking>, StoreError> {
        let mut state = self.lock();
        let cancelled = transition(&mut state, id, BookingStatus::Confirmed, |b| {
            b.status = BookingStatus::Cancelled;
            b.audit = audit.clone();
        })?;
        if cancelled.is_some() {
            state.stats.active_count -= 1;
        }
        Ok(cancelled)
    }

    async fn record_external_audit(&self, id: Uuid, audit: &ExternalAudit) -> Result<(), StoreError> {
        let mut state = self.lock();
        write_guard(&state)?;
        let booking = state
            .bookings
            .get_mut(&id)
            .ok_or(StoreError::BookingNotFound(id))?;
        booking.audit = audit.clone();
        Ok(())
    }

    async fn count_overlapping_active(
        &self,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        Ok(self
            .lock()
            .bookings
            .values()
            .filter(|b| b.is_active(now) && b.overlaps(start_at, end_at))
            .count() as i64)
    }

    async fn count_active(&self, now: DateTime<Utc>) -> Result<i64, StoreError> {
        Ok(self
            .lock()
            .bookings
            .values()
            .filter(|b| b.is_active(now))
            .count() as i64)
    }

    async fn count_ended_confirmed(&self, now: DateTime<Utc>) -> Result<i64, StoreError> {
        Ok(self
            .lock()
            .bookings
            .values()
            .filter(|b| b.status == BookingStatus::Confirmed && b.end_at <= now)
            .count() as i64)
    }

    async fn expire_ended(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.lock();
        write_guard(&state)?;
        let mut swept = 0;
        for booking in state.bookings.values_mut() {
            if booking.status == BookingStatus::Confirmed && booking.end_at <= now {
                booking.status = BookingStatus::Expired;
                booking.updated_at = now;
                swept += 1;
            }
        }
        state.stats.active_count -= swept;
        Ok(swept as u64)
    }

    async fn abandon_stale_claims(
        &self,
        created_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock();
        write_guard(&state)?;
        let mut moved = 0;
        for booking in state.bookings.values_mut() {
            if booking.status == BookingStatus::PendingExternal
                && booking.payment_status == PaymentStatus::Paid
                && booking.created_at < created_before
            {
                booking.status = BookingStatus::ExternalFailed;
                booking.audit.error_code = Some("abandoned".to_string());
                booking.next_reconcile_at = Some(now);
                booking.updated_at = now;
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn reconciliation_candidates(
        &self,
        now: DateTime<Utc>,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<Booking>, StoreError> {
        let mut candidates: Vec<_> = self
            .lock()
            .bookings
            .values()
            .filter(|b| {
                b.status == BookingStatus::ExternalFailed
                    && b.payment_status == PaymentStatus::Paid
                    && b.reconcile_attempts < max_attempts
                    && b.next_reconcile_at.map_or(true, |at| at <= now)
            })
            .cloned()
            .collect();
        candidates.sort_by_key(|b| b.created_at);
        candidates.truncate(limit.max(0) as usize);
        Ok(candidates)
    }

    async fn exhausted_reconciliations(&self, max_attempts: i32) -> Result<Vec<Booking>, StoreError> {
        Ok(self
            .lock()
            .bookings
            .values()
            .filter(|b| {
                b.status == BookingStatus::ExternalFailed
                    && b.payment_status == PaymentStatus::Paid
                    && b.reconcile_attempts >= max_attempts
            })
            .cloned()
            .collect())
    }

    async fn reservation_stats(&self) -> Result<ReservationStats, StoreError> {
        Ok(self.lock().stats)
    }

    async fn reservation_settings(&self) -> Result<ReservationSettings, StoreError> {
        Ok(self.lock().settings.clone())
    }

    async fn update_settings(
        &self,
        settings: &ReservationSettings,
    ) -> Result<ReservationSettings, StoreError> {
        let mut state = self.lock();
        write_guard(&state)?;
        state.settings = settings.clone();
        Ok(state.settings.clone())
    }
}

#[async_trait]
impl NotificationQueue for MemoryStore {
    async fn enqueue(&self, task: NotificationTask) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.fail_enqueue {
            return Err(StoreError::Pool("queue unavailable".to_string()));
        }
        state.tasks.push(task);
        Ok(())
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<NotificationTask>, StoreError> {
        let mut state = self.lock();
        let mut claimed = Vec::new();
        for task in state.tasks.iter_mut() {
            if claimed.len() as i64 >= limit {
                break;
            }
            if task.status == TaskStatus::Pending && task.next_retry_at <= now {
                task.status = TaskStatus::Processing;
                task.updated_at = now;
                claimed.push(task.clone());
            }
        }
        Ok(claimed)
    }

    async fn finish_attempt(&self, outcome: &AttemptOutcome) -> Result<(), StoreError> {
        let mut state = self.lock();
        let Some(task) = state
            .tasks
            .iter_mut()
            .find(|t| t.id == outcome.task_id && t.status == TaskStatus::Processing)
        else {
            return Ok(());
        };
        task.attempts = outcome.attempts;
        task.status = outcome.status;
        task.next_retry_at = outcome.next_retry_at;
        task.last_error = outcome.last_error.clone();
        task.updated_at = outcome.finished_at;

        if let Some(booking) = state.bookings.get_mut(&outcome.booking_id) {
            booking.notification_status = outcome.notification_status;
            booking.notification_attempts = outcome.attempts;
            if outcome.notification_status == NotificationStatus::Sent {
                booking.notification_sent_at = Some(outcome.finished_at);
            }
        }
        Ok(())
    }

    async fn requeue_stale(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut requeued = 0;
        for task in self.lock().tasks.iter_mut() {
            if task.status == TaskStatus::Processing && task.updated_at < stale_before {
                task.status = TaskStatus::Pending;
                task.updated_at = now;
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn failed_tasks(&self) -> Result<Vec<NotificationTask>, StoreError> {
        Ok(self
            .lock()
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .cloned()
            .collect())
    }

    async fn replay(&self, task_id: Uuid, now: DateTime<Utc>) -> Result<Option<NotificationTask>, StoreError> {
        let mut state = self.lock();
        let task = state
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id && t.status == TaskStatus::Failed);
        Ok(task.map(|task| {
            task.status = TaskStatus::Pending;
            task.attempts = 0;
            task.next_retry_at = now;
            task.last_error = None;
            task.updated_at = now;
            task.clone()
        }))
    }
}
