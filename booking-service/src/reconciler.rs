//! Background convergence for everything the request path leaves behind:
//! paid bookings the slot service never confirmed, claims orphaned by a crash,
//! ended bookings still counted as active, and counter drift.

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::retry::RetryPolicy;
use shared::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};

use crate::error::StoreError;
use crate::notifications::NotificationHandoff;
use crate::slot_client::{SlotApi, SlotRequest};
use crate::store::BookingStore;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    pub max_attempts: u32,
    pub batch_size: i64,
    /// `pending_external` claims older than this are treated as abandoned.
    pub stale_claim_after: chrono::Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            max_attempts: 5,
            batch_size: 25,
            stale_claim_after: chrono::Duration::seconds(90),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub abandoned: u64,
    pub confirmed: usize,
    pub still_failing: usize,
    pub exhausted: usize,
    pub expired: u64,
    /// Counter value minus the scanned number of active bookings.
    pub counter_drift: i64,
}

pub struct Reconciler {
    store: Arc<dyn BookingStore>,
    slot_api: Arc<dyn SlotApi>,
    notifications: NotificationHandoff,
    policy: RetryPolicy,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn BookingStore>,
        slot_api: Arc<dyn SlotApi>,
        notifications: NotificationHandoff,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            slot_api,
            notifications,
            policy: RetryPolicy::reconciliation(config.max_attempts),
            config,
        }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.config.interval);

        loop {
            interval.tick().await;

            match self.run_once().await {
                Ok(report) if report != ReconcileReport::default() => {
                    info!(?report, "Reconciliation pass finished");
                }
                Ok(_) => {}
                Err(e) => error!("Error during reconciliation pass: {}", e),
            }
        }
    }

    pub async fn run_once(&self) -> Result<ReconcileReport, StoreError> {
        let now = Utc::now();
        let mut report = ReconcileReport {
            abandoned: self.abandon_stale_claims(now).await?,
            ..ReconcileReport::default()
        };

        self.retry_failed(now, &mut report).await?;
        report.expired = self.sweep_expired(now).await?;
        report.counter_drift = self.audit_counter(now).await?;

        Ok(report)
    }

    async fn abandon_stale_claims(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let abandoned = self
            .store
            .abandon_stale_claims(now - self.config.stale_claim_after, now)
            .await?;
        if abandoned > 0 {
            warn!("Parked {} abandoned claims for reconciliation", abandoned);
        }
        Ok(abandoned)
    }

    async fn retry_failed(&self, now: DateTime<Utc>, report: &mut ReconcileReport) -> Result<(), StoreError> {
        let candidates = self
            .store
            .reconciliation_candidates(now, self.max_attempts(), self.config.batch_size)
            .await?;

        for booking in candidates {
            let exchange = self.slot_api.submit(&SlotRequest::submit_for(&booking)).await;
            let called_at = Utc::now();
            let audit = exchange.audit(called_at);

            match exchange.result {
                Ok(receipt) => {
                    let confirmed = self
                        .store
                        .confirm_booking(
                            booking.id,
                            BookingStatus::ExternalFailed,
                            &receipt.external_number,
                            &audit,
                        )
                        .await?;
                    if let Some(confirmed) = confirmed {
                        info!(
                            booking_id = %confirmed.id,
                            "Reconciled booking {} after {} failed attempts",
                            receipt.external_number, booking.reconcile_attempts
                        );
                        self.notifications.enqueue(&confirmed).await;
                        report.confirmed += 1;
                    }
                }
                Err(e) => {
                    let attempts = booking.reconcile_attempts + 1;
                    let next_at = self.policy.next_attempt_at(called_at, attempts as u32);
                    self.store
                        .record_reconcile_failure(booking.id, &audit, next_at)
                        .await?;

                    if self.policy.is_exhausted(attempts as u32) {
                        error!(
                            booking_id = %booking.id,
                            payment_reference = booking.payment_reference.as_deref().unwrap_or(""),
                            "Booking {} still unconfirmed after {} attempts, needs manual intervention: {}",
                            booking.booking_number, attempts, e
                        );
                        report.exhausted += 1;
                    } else {
                        warn!(
                            booking_id = %booking.id,
                            "Reconciliation of {} failed (attempt {}), next try at {}: {}",
                            booking.booking_number, attempts, next_at, e
                        );
                        report.still_failing += 1;
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let expired = self.store.expire_ended(now).await?;
        if expired > 0 {
            info!("Expired {} ended bookings", expired);
        }
        Ok(expired)
    }

    /// Compares the counter against a scan. Only reports; never rewrites.
    pub async fn audit_counter(&self, now: DateTime<Utc>) -> Result<i64, StoreError> {
        let stats = self.store.reservation_stats().await?;
        let actual = self.store.count_active(now).await?;
        let drift = stats.active_count - actual;
        if drift != 0 {
            warn!(
                counter = stats.active_count,
                actual, "Active booking counter drifted by {}", drift
            );
        }
        Ok(drift)
    }

    /// Paid bookings the reconciler gave up on.
    pub async fn persistent_failures(&self) -> Result<Vec<Booking>, StoreError> {
        self.store.exhausted_reconciliations(self.max_attempts()).await
    }

    fn max_attempts(&self) -> i32 {
        self.config.max_attempts.min(i32::MAX as u32) as i32
    }
}
