use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod retry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Confirmed,
    PendingExternal,
    ExternalFailed,
    Cancelled,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Paid,
    Pending,
    Refunded,
    #[serde(rename = "n/a")]
    NotApplicable,
}

/// Where a booking request came from. Part of the idempotency key, so the same
/// reference string arriving through two channels never collides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingSource {
    Webhook,
    Manual,
    PayOnSite,
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    NotSent,
    Sent,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(anyhow::anyhow!(
                        "unknown {} value: {}",
                        stringify!($ty),
                        other
                    )),
                }
            }
        }
    };
}

string_enum!(BookingStatus {
    Confirmed => "confirmed",
    PendingExternal => "pending_external",
    ExternalFailed => "external_failed",
    Cancelled => "cancelled",
    Expired => "expired",
});

string_enum!(PaymentStatus {
    Paid => "paid",
    Pending => "pending",
    Refunded => "refunded",
    NotApplicable => "n/a",
});

string_enum!(BookingSource {
    Webhook => "webhook",
    Manual => "manual",
    PayOnSite => "pay_on_site",
    Test => "test",
});

string_enum!(NotificationStatus {
    NotSent => "not_sent",
    Sent => "sent",
    Failed => "failed",
});

string_enum!(TaskStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

/// Request to book a slot, before any I/O has happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingIntent {
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub license_plate: String,
    pub client_name: String,
    pub client_email: Option<String>,
    pub client_phone: Option<String>,
    pub amount: BigDecimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentContext {
    pub source: BookingSource,
    pub payment_reference: Option<String>,
    pub payment_status: PaymentStatus,
}

impl PaymentContext {
    pub fn webhook(payment_reference: impl Into<String>) -> Self {
        Self {
            source: BookingSource::Webhook,
            payment_reference: Some(payment_reference.into()),
            payment_status: PaymentStatus::Paid,
        }
    }

    pub fn manual() -> Self {
        Self {
            source: BookingSource::Manual,
            payment_reference: None,
            payment_status: PaymentStatus::NotApplicable,
        }
    }

    pub fn pay_on_site() -> Self {
        Self {
            source: BookingSource::PayOnSite,
            payment_reference: None,
            payment_status: PaymentStatus::Pending,
        }
    }
}

/// Diagnostic trail of the last slot API exchange. Written, never read by logic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalAudit {
    pub request_payload: Option<String>,
    pub response: Option<String>,
    pub error_code: Option<String>,
    pub called_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub booking_number: String,
    pub external_booking_number: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub license_plate: String,
    pub client_name: String,
    pub client_email: Option<String>,
    pub client_phone: Option<String>,
    pub amount: BigDecimal,
    pub payment_reference: Option<String>,
    pub payment_status: PaymentStatus,
    pub status: BookingStatus,
    pub source: BookingSource,
    pub audit: ExternalAudit,
    pub reconcile_attempts: i32,
    pub next_reconcile_at: Option<DateTime<Utc>>,
    pub notification_status: NotificationStatus,
    pub notification_attempts: i32,
    pub notification_sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    /// Counts toward capacity iff confirmed and not yet ended.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status == BookingStatus::Confirmed && now < self.end_at
    }

    pub fn overlaps(&self, start_at: DateTime<Utc>, end_at: DateTime<Utc>) -> bool {
        self.start_at < end_at && self.end_at > start_at
    }
}

/// Fields the orchestrator fixes when it first claims a booking.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub id: Uuid,
    pub booking_number: String,
    pub intent: BookingIntent,
    pub payment: PaymentContext,
}

impl NewBooking {
    pub fn into_booking(self, now: DateTime<Utc>) -> Booking {
        Booking {
            id: self.id,
            booking_number: self.booking_number,
            external_booking_number: None,
            start_at: self.intent.start_at,
            end_at: self.intent.end_at,
            license_plate: self.intent.license_plate,
            client_name: self.intent.client_name,
            client_email: self.intent.client_email,
            client_phone: self.intent.client_phone,
            amount: self.intent.amount,
            payment_reference: self.payment.payment_reference,
            payment_status: self.payment.payment_status,
            status: BookingStatus::PendingExternal,
            source: self.payment.source,
            audit: ExternalAudit::default(),
            reconcile_attempts: 0,
            next_reconcile_at: None,
            notification_status: NotificationStatus::NotSent,
            notification_attempts: 0,
            notification_sent_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingReason {
    /// Payment was captured but the slot service has not confirmed yet.
    AwaitingExternalConfirmation,
    /// The slot service did not confirm and no payment was taken. Nothing
    /// retries these; the booking stays `external_failed` for an operator.
    ExternalRejected,
}

impl PendingReason {
    /// Why a booking that is not confirmed is still waiting, if it is.
    pub fn for_booking(booking: &Booking) -> Option<Self> {
        match booking.status {
            BookingStatus::PendingExternal => Some(Self::AwaitingExternalConfirmation),
            BookingStatus::ExternalFailed if booking.payment_status == PaymentStatus::Paid => {
                Some(Self::AwaitingExternalConfirmation)
            }
            BookingStatus::ExternalFailed => Some(Self::ExternalRejected),
            _ => None,
        }
    }
}

/// Outcome of a create call that got far enough to have a booking record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingResult {
    pub booking: Booking,
    pub success: bool,
    pub persisted: bool,
    pub duplicate: bool,
    pub pending_reason: Option<PendingReason>,
}

impl BookingResult {
    pub fn confirmed(booking: Booking) -> Self {
        Self {
            booking,
            success: true,
            persisted: true,
            duplicate: false,
            pending_reason: None,
        }
    }

    pub fn pending(booking: Booking) -> Self {
        Self {
            success: false,
            persisted: true,
            duplicate: false,
            pending_reason: PendingReason::for_booking(&booking),
            booking,
        }
    }

    /// Replays an earlier outcome for a repeated idempotency key.
    pub fn replayed(booking: Booking) -> Self {
        let confirmed = booking.status == BookingStatus::Confirmed;
        Self {
            success: confirmed,
            persisted: true,
            duplicate: true,
            pending_reason: PendingReason::for_booking(&booking),
            booking,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationStats {
    pub active_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationSettings {
    /// Zero means unlimited.
    pub max_capacity: i64,
    pub bookings_enabled: bool,
}

impl Default for ReservationSettings {
    fn default() -> Self {
        Self {
            max_capacity: 0,
            bookings_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationTask {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub attempts: i32,
    pub max_attempts: i32,
    pub status: TaskStatus,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationTask {
    pub fn new(booking_id: Uuid, max_attempts: i32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            booking_id,
            attempts: 0,
            max_attempts,
            status: TaskStatus::Pending,
            next_retry_at: now,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Message handed to the mailer once a booking is confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingNotification {
    pub booking_id: Uuid,
    pub booking_number: String,
    pub recipient_email: Option<String>,
    pub recipient_phone: Option<String>,
    pub access_token: String,
    pub message: String,
}

/// Upper-cases and strips whitespace so "ab 12 cd" and "AB12CD" are one vehicle.
pub fn normalize_license_plate(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn license_plates_are_normalized() {
        assert_eq!(normalize_license_plate(" ab-12 cd "), "AB-12CD");
        assert_eq!(normalize_license_plate("xyz"), "XYZ");
    }

    #[test]
    fn status_strings_round_trip_through_storage_names() {
        assert_eq!(BookingStatus::ExternalFailed.as_str(), "external_failed");
        assert_eq!(
            "pending_external".parse::<BookingStatus>().unwrap(),
            BookingStatus::PendingExternal
        );
        assert_eq!("n/a".parse::<PaymentStatus>().unwrap(), PaymentStatus::NotApplicable);
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn payment_status_serializes_with_slash() {
        let json = serde_json::to_string(&PaymentStatus::NotApplicable).unwrap();
        assert_eq!(json, "\"n/a\"");
    }

    #[test]
    fn activity_requires_confirmed_and_future_end() {
        let now = Utc::now();
        let mut booking = NewBooking {
            id: Uuid::new_v4(),
            booking_number: "123456".into(),
            intent: BookingIntent {
                start_at: now - Duration::hours(1),
                end_at: now + Duration::hours(1),
                license_plate: "AB12CD".into(),
                client_name: "Client".into(),
                client_email: None,
                client_phone: None,
                amount: BigDecimal::from(10),
            },
            payment: PaymentContext::manual(),
        }
        .into_booking(now);

        assert!(!booking.is_active(now));
        booking.status = BookingStatus::Confirmed;
        assert!(booking.is_active(now));
        assert!(!booking.is_active(now + Duration::hours(1)));
    }

    #[test]
    fn unpaid_external_failure_is_not_awaiting_confirmation() {
        let now = Utc::now();
        let claim = |payment: PaymentContext| {
            NewBooking {
                id: Uuid::new_v4(),
                booking_number: "654321".into(),
                intent: BookingIntent {
                    start_at: now + Duration::days(1),
                    end_at: now + Duration::days(2),
                    license_plate: "AB12CD".into(),
                    client_name: "Client".into(),
                    client_email: None,
                    client_phone: None,
                    amount: BigDecimal::from(10),
                },
                payment,
            }
            .into_booking(now)
        };

        let mut paid = claim(PaymentContext::webhook("pi_1"));
        assert_eq!(
            BookingResult::pending(paid.clone()).pending_reason,
            Some(PendingReason::AwaitingExternalConfirmation)
        );
        paid.status = BookingStatus::ExternalFailed;
        assert_eq!(
            BookingResult::pending(paid).pending_reason,
            Some(PendingReason::AwaitingExternalConfirmation)
        );

        let mut on_site = claim(PaymentContext::pay_on_site());
        on_site.status = BookingStatus::ExternalFailed;
        assert_eq!(
            BookingResult::pending(on_site.clone()).pending_reason,
            Some(PendingReason::ExternalRejected)
        );
        assert_eq!(
            BookingResult::replayed(on_site).pending_reason,
            Some(PendingReason::ExternalRejected)
        );
    }

    #[test]
    fn overlap_is_half_open() {
        let now = Utc::now();
        let booking = NewBooking {
            id: Uuid::new_v4(),
            booking_number: "123456".into(),
            intent: BookingIntent {
                start_at: now,
                end_at: now + Duration::days(1),
                license_plate: "AB12CD".into(),
                client_name: "Client".into(),
                client_email: None,
                client_phone: None,
                amount: BigDecimal::from(10),
            },
            payment: PaymentContext::manual(),
        }
        .into_booking(now);

        assert!(booking.overlaps(now + Duration::hours(8), now + Duration::days(2)));
        assert!(!booking.overlaps(now + Duration::days(1), now + Duration::days(2)));
        assert!(!booking.overlaps(now - Duration::days(1), now));
    }

    #[test]
    fn replayed_result_reports_duplicate() {
        let now = Utc::now();
        let mut booking = NewBooking {
            id: Uuid::new_v4(),
            booking_number: "654321".into(),
            intent: BookingIntent {
                start_at: now,
                end_at: now + Duration::hours(2),
                license_plate: "AB12CD".into(),
                client_name: "Client".into(),
                client_email: None,
                client_phone: None,
                amount: BigDecimal::from(10),
            },
            payment: PaymentContext::webhook("pi_1"),
        }
        .into_booking(now);
        booking.status = BookingStatus::ExternalFailed;

        let result = BookingResult::replayed(booking);
        assert!(result.duplicate);
        assert!(!result.success);
        assert_eq!(
            result.pending_reason,
            Some(PendingReason::AwaitingExternalConfirmation)
        );
    }
}
