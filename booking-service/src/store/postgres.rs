use async_trait::async_trait;
use bb8::PooledConnection;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::pooled_connection::{bb8::Pool, AsyncDieselConnectionManager};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use shared::*;
use uuid::Uuid;

use super::{AttemptOutcome, BookingStore, ClaimOutcome, NotificationQueue};
use crate::error::StoreError;
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;
type Conn<'a> = PooledConnection<'a, AsyncDieselConnectionManager<AsyncPgConnection>>;

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<Conn<'_>, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }
}

fn into_booking(row: DbBooking) -> Result<Booking, StoreError> {
    Ok(Booking::try_from(row)?)
}

fn into_bookings(rows: Vec<DbBooking>) -> Result<Vec<Booking>, StoreError> {
    rows.into_iter().map(into_booking).collect()
}

fn into_tasks(rows: Vec<DbNotificationTask>) -> Result<Vec<NotificationTask>, StoreError> {
    rows.into_iter()
        .map(|row| NotificationTask::try_from(row).map_err(StoreError::from))
        .collect()
}

/// Atomic `active_count = active_count + delta` on the singleton row.
async fn adjust_active_count(
    conn: &mut AsyncPgConnection,
    delta: i64,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    diesel::update(reservation_stats::table.find(SINGLETON_ID))
        .set((
            reservation_stats::active_count.eq(reservation_stats::active_count + delta),
            reservation_stats::updated_at.eq(now),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

#[async_trait]
impl BookingStore for PgStore {
    async fn get_booking(&self, id: Uuid) -> Result<Option<Booking>, StoreError> {
        let mut conn = self.conn().await?;
        let row = bookings::table
            .find(id)
            .select(DbBooking::as_select())
            .first::<DbBooking>(&mut conn)
            .await
            .optional()?;
        row.map(into_booking).transpose()
    }

    async fn find_by_idempotency_key(
        &self,
        source: BookingSource,
        payment_reference: &str,
    ) -> Result<Option<Booking>, StoreError> {
        let mut conn = self.conn().await?;
        let row = bookings::table
            .filter(bookings::source.eq(source.as_str()))
            .filter(bookings::payment_reference.eq(payment_reference))
            .select(DbBooking::as_select())
            .first::<DbBooking>(&mut conn)
            .await
            .optional()?;
        row.map(into_booking).transpose()
    }

    async fn find_by_external_number(
        &self,
        external_number: &str,
    ) -> Result<Option<Booking>, StoreError> {
        let mut conn = self.conn().await?;
        let row = bookings::table
            .filter(bookings::external_booking_number.eq(external_number))
            .order(bookings::created_at.desc())
            .select(DbBooking::as_select())
            .first::<DbBooking>(&mut conn)
            .await
            .optional()?;
        row.map(into_booking).transpose()
    }

    async fn claim_booking(&self, booking: NewBooking) -> Result<ClaimOutcome, StoreError> {
        let source = booking.payment.source;
        let reference = booking.payment.payment_reference.clone();
        let new_booking = NewDbBooking::from(booking);

        let inserted = {
            let mut conn = self.conn().await?;
            diesel::insert_into(bookings::table)
                .values(&new_booking)
                .on_conflict_do_nothing()
                .returning(DbBooking::as_returning())
                .get_result::<DbBooking>(&mut conn)
                .await
                .optional()?
        };

        if let Some(row) = inserted {
            return Ok(ClaimOutcome::Claimed(into_booking(row)?));
        }

        if let Some(reference) = reference {
            if let Some(existing) = self.find_by_idempotency_key(source, &reference).await? {
                return Ok(ClaimOutcome::Existing(existing));
            }
        }

        Ok(ClaimOutcome::NumberTaken)
    }

    async fn confirm_booking(
        &self,
        id: Uuid,
        from: BookingStatus,
        external_number: &str,
        audit: &ExternalAudit,
    ) -> Result<Option<Booking>, StoreError> {
        let mut conn = self.conn().await?;
        let audit = ExternalAuditChangeset::from(audit);
        let external_number = external_number.to_string();
        let from = from.as_str();
        let now = Utc::now();

        let row = conn
            .transaction::<_, StoreError, _>(|conn| {
                Box::pin(async move {
                    let updated = diesel::update(
                        bookings::table
                            .filter(bookings::id.eq(id))
                            .filter(bookings::status.eq(from)),
                    )
                    .set((
                        bookings::status.eq(BookingStatus::Confirmed.as_str()),
                        bookings::external_booking_number.eq(Some(external_number)),
                        bookings::next_reconcile_at.eq(None::<DateTime<Utc>>),
                        bookings::updated_at.eq(now),
                        audit,
                    ))
                    .returning(DbBooking::as_returning())
                    .get_result::<DbBooking>(conn)
                    .await
                    .optional()?;

                    if updated.is_some() {
                        adjust_active_count(conn, 1, now).await?;
                    }

                    Ok(updated)
                })
            })
            .await?;

        row.map(into_booking).transpose()
    }

    async fn mark_external_failed(
        &self,
        id: Uuid,
        from: BookingStatus,
        audit: &ExternalAudit,
    ) -> Result<Option<Booking>, StoreError> {
        let mut conn = self.conn().await?;
        let now = Utc::now();
        let row = diesel::update(
            bookings::table
                .filter(bookings::id.eq(id))
                .filter(bookings::status.eq(from.as_str())),
        )
        .set((
            bookings::status.eq(BookingStatus::ExternalFailed.as_str()),
            bookings::next_reconcile_at.eq(Some(now)),
            bookings::updated_at.eq(now),
            ExternalAuditChangeset::from(audit),
        ))
        .returning(DbBooking::as_returning())
        .get_result::<DbBooking>(&mut conn)
        .await
        .optional()?;

        row.map(into_booking).transpose()
    }

    async fn record_reconcile_failure(
        &self,
        id: Uuid,
        audit: &ExternalAudit,
        next_reconcile_at: DateTime<Utc>,
    ) -> Result<Option<Booking>, StoreError> {
        let mut conn = self.conn().await?;
        let row = diesel::update(
            bookings::table
                .filter(bookings::id.eq(id))
                .filter(bookings::status.eq(BookingStatus::ExternalFailed.as_str())),
        )
        .set((
            bookings::reconcile_attempts.eq(bookings::reconcile_attempts + 1),
            bookings::next_reconcile_at.eq(Some(next_reconcile_at)),
            bookings::updated_at.eq(Utc::now()),
            ExternalAuditChangeset::from(audit),
        ))
        .returning(DbBooking::as_returning())
        .get_result::<DbBooking>(&mut conn)
        .await
        .optional()?;

        row.map(into_booking).transpose()
    }

    async fn cancel_booking(
        &self,
        id: Uuid,
        audit: &ExternalAudit,
    ) -> Result<Option<Booking>, StoreError> {
        let mut conn = self.conn().await?;
        let audit = ExternalAuditChangeset::from(audit);
        let now = Utc::now();

        let row = conn
            .transaction::<_, StoreError, _>(|conn| {
                Box::pin(async move {
                    let updated = diesel::update(
                        bookings::table
                            .filter(bookings::id.eq(id))
                            .filter(bookings::status.eq(BookingStatus::Confirmed.as_str())),
                    )
                    .set((
                        bookings::status.eq(BookingStatus::Cancelled.as_str()),
                        bookings::updated_at.eq(now),
                        audit,
                    ))
                    .returning(DbBooking::as_returning())
                    .get_result::<DbBooking>(conn)
                    .await
                    .optional()?;

                    if updated.is_some() {
                        adjust_active_count(conn, -1, now).await?;
                    }

                    Ok(updated)
                })
            })
            .await?;

        row.map(into_booking).transpose()
    }

    async fn record_external_audit(&self, id: Uuid, audit: &ExternalAudit) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        diesel::update(bookings::table.find(id))
            .set((
                bookings::updated_at.eq(Utc::now()),
                ExternalAuditChangeset::from(audit),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn count_overlapping_active(
        &self,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let mut conn = self.conn().await?;
        let count = bookings::table
            .filter(bookings::status.eq(BookingStatus::Confirmed.as_str()))
            .filter(bookings::start_at.lt(end_at))
            .filter(bookings::end_at.gt(start_at))
            .filter(bookings::end_at.gt(now))
            .count()
            .get_result::<i64>(&mut conn)
            .await?;
        Ok(count)
    }

    async fn count_active(&self, now: DateTime<Utc>) -> Result<i64, StoreError> {
        let mut conn = self.conn().await?;
        let count = bookings::table
            .filter(bookings::status.eq(BookingStatus::Confirmed.as_str()))
            .filter(bookings::end_at.gt(now))
            .count()
            .get_result::<i64>(&mut conn)
            .await?;
        Ok(count)
    }

    async fn count_ended_confirmed(&self, now: DateTime<Utc>) -> Result<i64, StoreError> {
        let mut conn = self.conn().await?;
        let count = bookings::table
            .filter(bookings::status.eq(BookingStatus::Confirmed.as_str()))
            .filter(bookings::end_at.le(now))
            .count()
            .get_result::<i64>(&mut conn)
            .await?;
        Ok(count)
    }

    async fn expire_ended(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut conn = self.conn().await?;
        let swept = conn
            .transaction::<_, StoreError, _>(|conn| {
                Box::pin(async move {
                    let swept = diesel::update(
                        bookings::table
                            .filter(bookings::status.eq(BookingStatus::Confirmed.as_str()))
                            .filter(bookings::end_at.le(now)),
                    )
                    .set((
                        bookings::status.eq(BookingStatus::Expired.as_str()),
                        bookings::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;

                    if swept > 0 {
                        adjust_active_count(conn, -(swept as i64), now).await?;
                    }

                    Ok(swept as u64)
                })
            })
            .await?;
        Ok(swept)
    }

    async fn abandon_stale_claims(
        &self,
        created_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut conn = self.conn().await?;
        let moved = diesel::update(
            bookings::table
                .filter(bookings::status.eq(BookingStatus::PendingExternal.as_str()))
                .filter(bookings::payment_status.eq(PaymentStatus::Paid.as_str()))
                .filter(bookings::created_at.lt(created_before)),
        )
        .set((
            bookings::status.eq(BookingStatus::ExternalFailed.as_str()),
            bookings::last_error_code.eq(Some("abandoned")),
            bookings::next_reconcile_at.eq(Some(now)),
            bookings::updated_at.eq(now),
        ))
        .execute(&mut conn)
        .await?;
        Ok(moved as u64)
    }

    async fn reconciliation_candidates(
        &self,
        now: DateTime<Utc>,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<Booking>, StoreError> {
        let mut conn = self.conn().await?;
        let rows = bookings::table
            .filter(bookings::status.eq(BookingStatus::ExternalFailed.as_str()))
            .filter(bookings::payment_status.eq(PaymentStatus::Paid.as_str()))
            .filter(bookings::reconcile_attempts.lt(max_attempts))
            .filter(
                bookings::next_reconcile_at
                    .is_null()
                    .or(bookings::next_reconcile_at.le(now)),
            )
            .order(bookings::created_at.asc())
            .limit(limit)
            .select(DbBooking::as_select())
            .load::<DbBooking>(&mut conn)
            .await?;
        into_bookings(rows)
    }

    async fn exhausted_reconciliations(&self, max_attempts: i32) -> Result<Vec<Booking>, StoreError> {
        let mut conn = self.conn().await?;
        let rows = bookings::table
            .filter(bookings::status.eq(BookingStatus::ExternalFailed.as_str()))
            .filter(bookings::payment_status.eq(PaymentStatus::Paid.as_str()))
            .filter(bookings::reconcile_attempts.ge(max_attempts))
            .order(bookings::updated_at.desc())
            .select(DbBooking::as_select())
            .load::<DbBooking>(&mut conn)
            .await?;
        into_bookings(rows)
    }

    async fn reservation_stats(&self) -> Result<ReservationStats, StoreError> {
        let mut conn = self.conn().await?;
        let active_count = reservation_stats::table
            .find(SINGLETON_ID)
            .select(reservation_stats::active_count)
            .first::<i64>(&mut conn)
            .await?;
        Ok(ReservationStats { active_count })
    }

    async fn reservation_settings(&self) -> Result<ReservationSettings, StoreError> {
        let mut conn = self.conn().await?;
        let row = reservation_settings::table
            .find(SINGLETON_ID)
            .select(DbReservationSettings::as_select())
            .first::<DbReservationSettings>(&mut conn)
            .await?;
        Ok(row.into())
    }

    async fn update_settings(
        &self,
        settings: &ReservationSettings,
    ) -> Result<ReservationSettings, StoreError> {
        let mut conn = self.conn().await?;
        let row = diesel::update(reservation_settings::table.find(SINGLETON_ID))
            .set((
                reservation_settings::max_capacity.eq(settings.max_capacity),
                reservation_settings::bookings_enabled.eq(settings.bookings_enabled),
                reservation_settings::updated_at.eq(Utc::now()),
            ))
            .returning(DbReservationSettings::as_returning())
            .get_result::<DbReservationSettings>(&mut conn)
            .await?;
        Ok(row.into())
    }
}

#[async_trait]
impl NotificationQueue for PgStore {
    async fn enqueue(&self, task: NotificationTask) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        diesel::insert_into(notification_queue::table)
            .values(&DbNotificationTask::from(task))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<NotificationTask>, StoreError> {
        let mut conn = self.conn().await?;
        let due = notification_queue::table
            .filter(notification_queue::status.eq(TaskStatus::Pending.as_str()))
            .filter(notification_queue::next_retry_at.le(now))
            .order(notification_queue::next_retry_at.asc())
            .limit(limit)
            .select(notification_queue::id)
            .load::<Uuid>(&mut conn)
            .await?;

        let mut claimed = Vec::with_capacity(due.len());
        for task_id in due {
            let row = diesel::update(
                notification_queue::table
                    .filter(notification_queue::id.eq(task_id))
                    .filter(notification_queue::status.eq(TaskStatus::Pending.as_str())),
            )
            .set((
                notification_queue::status.eq(TaskStatus::Processing.as_str()),
                notification_queue::updated_at.eq(now),
            ))
            .returning(DbNotificationTask::as_returning())
            .get_result::<DbNotificationTask>(&mut conn)
            .await
            .optional()?;

            if let Some(row) = row {
                claimed.push(NotificationTask::try_from(row)?);
            }
        }

        Ok(claimed)
    }

    async fn finish_attempt(&self, outcome: &AttemptOutcome) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let outcome = outcome.clone();

        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                let updated = diesel::update(
                    notification_queue::table
                        .filter(notification_queue::id.eq(outcome.task_id))
                        .filter(notification_queue::status.eq(TaskStatus::Processing.as_str())),
                )
                .set((
                    notification_queue::attempts.eq(outcome.attempts),
                    notification_queue::status.eq(outcome.status.as_str()),
                    notification_queue::next_retry_at.eq(outcome.next_retry_at),
                    notification_queue::last_error.eq(outcome.last_error.clone()),
                    notification_queue::updated_at.eq(outcome.finished_at),
                ))
                .execute(conn)
                .await?;
                if updated == 0 {
                    // Lease was requeued; a newer attempt owns the audit.
                    return Ok(());
                }

                let booking = bookings::table.find(outcome.booking_id);
                if outcome.notification_status == NotificationStatus::Sent {
                    diesel::update(booking)
                        .set((
                            bookings::notification_status.eq(outcome.notification_status.as_str()),
                            bookings::notification_attempts.eq(outcome.attempts),
                            bookings::notification_sent_at.eq(Some(outcome.finished_at)),
                        ))
                        .execute(conn)
                        .await?;
                } else {
                    diesel::update(booking)
                        .set((
                            bookings::notification_status.eq(outcome.notification_status.as_str()),
                            bookings::notification_attempts.eq(outcome.attempts),
                        ))
                        .execute(conn)
                        .await?;
                }

                Ok(())
            })
        })
        .await
    }

    async fn requeue_stale(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut conn = self.conn().await?;
        let requeued = diesel::update(
            notification_queue::table
                .filter(notification_queue::status.eq(TaskStatus::Processing.as_str()))
                .filter(notification_queue::updated_at.lt(stale_before)),
        )
        .set((
            notification_queue::status.eq(TaskStatus::Pending.as_str()),
            notification_queue::updated_at.eq(now),
        ))
        .execute(&mut conn)
        .await?;
        Ok(requeued as u64)
    }

    async fn failed_tasks(&self) -> Result<Vec<NotificationTask>, StoreError> {
        let mut conn = self.conn().await?;
        let rows = notification_queue::table
            .filter(notification_queue::status.eq(TaskStatus::Failed.as_str()))
            .order(notification_queue::updated_at.desc())
            .select(DbNotificationTask::as_select())
            .load::<DbNotificationTask>(&mut conn)
            .await?;
        into_tasks(rows)
    }

    async fn replay(&self, task_id: Uuid, now: DateTime<Utc>) -> Result<Option<NotificationTask>, StoreError> {
        let mut conn = self.conn().await?;
        let row = diesel::update(
            notification_queue::table
                .filter(notification_queue::id.eq(task_id))
                .filter(notification_queue::status.eq(TaskStatus::Failed.as_str())),
        )
        .set((
            notification_queue::status.eq(TaskStatus::Pending.as_str()),
            notification_queue::attempts.eq(0),
            notification_queue::next_retry_at.eq(now),
            notification_queue::last_error.eq(None::<String>),
            notification_queue::updated_at.eq(now),
        ))
        .returning(DbNotificationTask::as_returning())
        .get_result::<DbNotificationTask>(&mut conn)
        .await
        .optional()?;

        row.map(|row| NotificationTask::try_from(row).map_err(StoreError::from))
            .transpose()
    }
}
