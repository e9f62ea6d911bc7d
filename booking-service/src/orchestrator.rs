//! Drives a booking from intent to a terminal outcome.
//!
//! A create runs validate → idempotency lookup → admission → claim → slot
//! service call → confirm (or park as `external_failed`) → notification
//! hand-off. The claim is a durable `pending_external` row inserted under the
//! idempotency key before the external call, so concurrent duplicates meet at
//! the unique index instead of both reaching the slot service.

use chrono::{DateTime, Duration, Utc};
use num_traits::Signed;
use rand::Rng;
use shared::*;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::admission::AdmissionController;
use crate::error::{BookingError, StoreError};
use crate::notifications::NotificationHandoff;
use crate::slot_client::{SlotApi, SlotRequest};
use crate::store::{BookingStore, ClaimOutcome};

const BOOKING_NUMBER_ATTEMPTS: usize = 10;

pub struct BookingOrchestrator {
    store: Arc<dyn BookingStore>,
    slot_api: Arc<dyn SlotApi>,
    admission: AdmissionController,
    notifications: NotificationHandoff,
}

impl BookingOrchestrator {
    pub fn new(
        store: Arc<dyn BookingStore>,
        slot_api: Arc<dyn SlotApi>,
        notifications: NotificationHandoff,
    ) -> Self {
        Self {
            admission: AdmissionController::new(store.clone()),
            store,
            slot_api,
            notifications,
        }
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub async fn create(
        &self,
        intent: BookingIntent,
        payment: PaymentContext,
    ) -> Result<BookingResult, BookingError> {
        let intent = validate(intent, Utc::now())?;

        if let Some(reference) = payment.payment_reference.as_deref() {
            if let Some(existing) = self
                .store
                .find_by_idempotency_key(payment.source, reference)
                .await?
            {
                info!(
                    "Duplicate request for {} reference {}, replaying booking {}",
                    payment.source, reference, existing.booking_number
                );
                return Ok(BookingResult::replayed(existing));
            }
        }

        self.admission
            .admit(intent.start_at, intent.end_at, Utc::now())
            .await?;

        let booking = match self.claim(intent, payment).await? {
            Claim::New(booking) => booking,
            Claim::Existing(existing) => {
                info!(
                    "Lost idempotency race, replaying booking {}",
                    existing.booking_number
                );
                return Ok(BookingResult::replayed(existing));
            }
        };

        info!(
            booking_id = %booking.id,
            source = %booking.source,
            "Claimed booking {} for {} ({} - {})",
            booking.booking_number, booking.license_plate, booking.start_at, booking.end_at
        );

        let exchange = self.slot_api.submit(&SlotRequest::submit_for(&booking)).await;
        let audit = exchange.audit(Utc::now());

        match exchange.result {
            Ok(receipt) => {
                let confirmed = match self
                    .store
                    .confirm_booking(
                        booking.id,
                        BookingStatus::PendingExternal,
                        &receipt.external_number,
                        &audit,
                    )
                    .await?
                {
                    Some(confirmed) => confirmed,
                    // The claim outlived the abandon threshold and was parked
                    // while we waited; the slot is ours, so take it back.
                    None => match self
                        .store
                        .confirm_booking(
                            booking.id,
                            BookingStatus::ExternalFailed,
                            &receipt.external_number,
                            &audit,
                        )
                        .await?
                    {
                        Some(confirmed) => confirmed,
                        None => return self.settled_elsewhere(booking.id).await,
                    },
                };

                info!(
                    booking_id = %confirmed.id,
                    "Booking {} confirmed by slot service",
                    receipt.external_number
                );
                self.notifications.enqueue(&confirmed).await;
                Ok(BookingResult::confirmed(confirmed))
            }
            Err(e) => {
                warn!(
                    booking_id = %booking.id,
                    error_code = %e.audit_code(),
                    "Slot service call failed for booking {}: {}",
                    booking.booking_number, e
                );
                let parked = match self
                    .store
                    .mark_external_failed(booking.id, BookingStatus::PendingExternal, &audit)
                    .await?
                {
                    Some(parked) => parked,
                    None => self
                        .store
                        .get_booking(booking.id)
                        .await?
                        .ok_or(StoreError::BookingNotFound(booking.id))?,
                };

                if parked.payment_status == PaymentStatus::Paid {
                    error!(
                        booking_id = %parked.id,
                        "Payment captured but booking {} is not confirmed, left for reconciliation",
                        parked.booking_number
                    );
                }
                Ok(BookingResult::pending(parked))
            }
        }
    }

    /// Cancels a confirmed booking at the slot service, then locally. A failed
    /// or timed-out remote cancel leaves the booking confirmed.
    pub async fn cancel(&self, external_number: &str) -> Result<Booking, BookingError> {
        let booking = self
            .store
            .find_by_external_number(external_number)
            .await?
            .ok_or_else(|| BookingError::NotFound(external_number.to_string()))?;

        if booking.status != BookingStatus::Confirmed {
            return Err(BookingError::NotCancellable {
                status: booking.status,
            });
        }

        let exchange = self.slot_api.cancel(&SlotRequest::cancel_for(&booking)).await;
        let audit = exchange.audit(Utc::now());

        if let Err(e) = exchange.result {
            warn!(
                booking_id = %booking.id,
                "Slot service refused to cancel booking {}: {}", external_number, e
            );
            if let Err(store_err) = self.store.record_external_audit(booking.id, &audit).await {
                error!("Failed to record cancel audit for {}: {}", booking.id, store_err);
            }
            return Err(BookingError::External(e));
        }

        match self.store.cancel_booking(booking.id, &audit).await? {
            Some(cancelled) => {
                info!(booking_id = %cancelled.id, "Booking {} cancelled", external_number);
                Ok(cancelled)
            }
            None => {
                let current = self
                    .store
                    .get_booking(booking.id)
                    .await?
                    .ok_or(StoreError::BookingNotFound(booking.id))?;
                warn!(
                    "Booking {} changed to {} while cancelling",
                    external_number, current.status
                );
                Err(BookingError::NotCancellable {
                    status: current.status,
                })
            }
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<Booking, BookingError> {
        self.store
            .get_booking(id)
            .await?
            .ok_or_else(|| BookingError::NotFound(id.to_string()))
    }

    /// The reconciler resubmitted a parked claim and confirmed it before this
    /// request came back. Its confirmation already queued the notification.
    async fn settled_elsewhere(&self, id: Uuid) -> Result<BookingResult, BookingError> {
        let current = self
            .store
            .get_booking(id)
            .await?
            .ok_or(StoreError::BookingNotFound(id))?;

        match current.status {
            BookingStatus::Confirmed => {
                info!(
                    booking_id = %current.id,
                    "Booking {} was already confirmed by reconciliation",
                    current.booking_number
                );
                Ok(BookingResult::confirmed(current))
            }
            status => {
                warn!(
                    booking_id = %current.id,
                    "Booking {} moved to {} while the slot service answered",
                    current.booking_number, status
                );
                Ok(BookingResult::pending(current))
            }
        }
    }

    async fn claim(&self, intent: BookingIntent, payment: PaymentContext) -> Result<Claim, BookingError> {
        for _ in 0..BOOKING_NUMBER_ATTEMPTS {
            let new_booking = NewBooking {
                id: Uuid::new_v4(),
                booking_number: generate_booking_number(),
                intent: intent.clone(),
                payment: payment.clone(),
            };

            match self.store.claim_booking(new_booking).await? {
                ClaimOutcome::Claimed(booking) => return Ok(Claim::New(booking)),
                ClaimOutcome::Existing(booking) => return Ok(Claim::Existing(booking)),
                ClaimOutcome::NumberTaken => debug!("Booking number collision, drawing another"),
            }
        }

        Err(StoreError::BookingNumberExhausted.into())
    }
}

enum Claim {
    New(Booking),
    Existing(Booking),
}

/// Six digits, no leading zero.
fn generate_booking_number() -> String {
    rand::thread_rng().gen_range(100_000..=999_999).to_string()
}

fn validate(intent: BookingIntent, now: DateTime<Utc>) -> Result<BookingIntent, BookingError> {
    if intent.end_at <= intent.start_at {
        return Err(BookingError::Validation(
            "end_at must be after start_at".to_string(),
        ));
    }
    if intent.end_at - intent.start_at < Duration::minutes(1) {
        return Err(BookingError::Validation(
            "booking must last at least one minute".to_string(),
        ));
    }
    if intent.end_at <= now {
        return Err(BookingError::Validation(
            "booking window has already ended".to_string(),
        ));
    }

    let license_plate = normalize_license_plate(&intent.license_plate);
    if license_plate.is_empty() {
        return Err(BookingError::Validation("license plate is required".to_string()));
    }

    let client_name = intent.client_name.trim().to_string();
    if client_name.is_empty() {
        return Err(BookingError::Validation("client name is required".to_string()));
    }

    if intent.amount.is_negative() {
        return Err(BookingError::Validation("amount cannot be negative".to_string()));
    }

    Ok(BookingIntent {
        license_plate,
        client_name,
        client_email: non_blank(intent.client_email),
        client_phone: non_blank(intent.client_phone),
        ..intent
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
