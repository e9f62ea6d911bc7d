//! Test doubles for the slot service and the notification sink, plus fixtures.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use shared::*;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{Barrier, Semaphore};
use uuid::Uuid;

use crate::notifications::{NotificationError, NotificationSink};
use crate::slot_client::{SlotApi, SlotApiError, SlotExchange, SlotReceipt, SlotRequest};

/// Scripted slot service. Answers from the queue first, then from the standing
/// failure if one is set, otherwise accepts.
#[derive(Default)]
pub struct FakeSlotApi {
    scripted: Mutex<VecDeque<Result<(), SlotApiError>>>,
    standing_failure: Mutex<Option<SlotApiError>>,
    submits: Mutex<Vec<SlotRequest>>,
    cancels: Mutex<Vec<SlotRequest>>,
    barrier: Option<Arc<Barrier>>,
    gate: Option<Arc<Semaphore>>,
}

impl FakeSlotApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: SlotApiError) -> Self {
        let api = Self::new();
        api.set_failure(Some(error));
        api
    }

    /// Every submit waits until `parties` submits are in flight together.
    pub fn with_barrier(parties: usize) -> Self {
        Self {
            barrier: Some(Arc::new(Barrier::new(parties))),
            ..Self::default()
        }
    }

    /// Submits block until [`FakeSlotApi::release`] hands out a permit.
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        }
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn set_failure(&self, error: Option<SlotApiError>) {
        *self.standing_failure.lock().unwrap() = error;
    }

    pub fn push_result(&self, result: Result<(), SlotApiError>) {
        self.scripted.lock().unwrap().push_back(result);
    }

    pub fn submits(&self) -> Vec<SlotRequest> {
        self.submits.lock().unwrap().clone()
    }

    pub fn cancels(&self) -> Vec<SlotRequest> {
        self.cancels.lock().unwrap().clone()
    }

    fn next_result(&self) -> Result<(), SlotApiError> {
        if let Some(result) = self.scripted.lock().unwrap().pop_front() {
            return result;
        }
        match self.standing_failure.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn answer(&self, request: &SlotRequest, operation: &str) -> SlotExchange {
        let request_body = format!(
            "<BookingSubmitRequest><OperationType>{}</OperationType><BookingNumber>{}</BookingNumber></BookingSubmitRequest>",
            operation, request.booking_number
        );
        match self.next_result() {
            Ok(()) => SlotExchange {
                request_body,
                raw_response: Some("<R><ErrorCode>1</ErrorCode></R>".to_string()),
                result: Ok(SlotReceipt {
                    external_number: request.booking_number.clone(),
                    message: "OK".to_string(),
                }),
            },
            Err(error) => SlotExchange {
                request_body,
                raw_response: None,
                result: Err(error),
            },
        }
    }
}

#[async_trait]
impl SlotApi for FakeSlotApi {
    async fn submit(&self, request: &SlotRequest) -> SlotExchange {
        self.submits.lock().unwrap().push(request.clone());
        if let Some(barrier) = &self.barrier {
            barrier.wait().await;
        }
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.answer(request, "N")
    }

    async fn cancel(&self, request: &SlotRequest) -> SlotExchange {
        self.cancels.lock().unwrap().push(request.clone());
        self.answer(request, "D")
    }
}

#[derive(Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<BookingNotification>>,
    failures_left: Mutex<u32>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_times(times: u32) -> Self {
        let sink = Self::new();
        *sink.failures_left.lock().unwrap() = times;
        sink
    }

    pub fn delivered(&self) -> Vec<BookingNotification> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, notification: &BookingNotification) -> Result<(), NotificationError> {
        let mut failures_left = self.failures_left.lock().unwrap();
        if *failures_left > 0 {
            *failures_left -= 1;
            return Err(NotificationError::Delivery("broker unavailable".to_string()));
        }
        self.delivered.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

pub fn intent(start_at: DateTime<Utc>, end_at: DateTime<Utc>) -> BookingIntent {
    BookingIntent {
        start_at,
        end_at,
        license_plate: "ab 12 cd".to_string(),
        client_name: "Jordan Client".to_string(),
        client_email: Some("client@example.com".to_string()),
        client_phone: None,
        amount: BigDecimal::from(25),
    }
}

/// A booking as it would look after the given lifecycle, for seeding stores.
pub fn booking(
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    status: BookingStatus,
    payment: PaymentContext,
) -> Booking {
    let number = format!("{:06}", rand::random::<u32>() % 900_000 + 100_000);
    let mut booking = NewBooking {
        id: Uuid::new_v4(),
        booking_number: number.clone(),
        intent: intent(start_at, end_at),
        payment,
    }
    .into_booking(Utc::now());
    booking.status = status;
    if status == BookingStatus::Confirmed {
        booking.external_booking_number = Some(number);
    }
    if status == BookingStatus::ExternalFailed {
        booking.next_reconcile_at = Some(Utc::now() - Duration::seconds(1));
    }
    booking
}

/// Start of a day well in the future, so windows stay active during a test.
pub fn day(offset: i64) -> DateTime<Utc> {
    let base = Utc::now() + Duration::days(7);
    base + Duration::days(offset)
}
