use chrono::{DateTime, Utc};
use diesel::prelude::*;
use shared::*;
use uuid::Uuid;

/// Primary key of the single stats/settings rows.
pub const SINGLETON_ID: i32 = 1;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::bookings)]
pub struct DbBooking {
    pub id: Uuid,
    pub booking_number: String,
    pub external_booking_number: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub license_plate: String,
    pub client_name: String,
    pub client_email: Option<String>,
    pub client_phone: Option<String>,
    pub amount: bigdecimal::BigDecimal,
    pub payment_reference: Option<String>,
    pub payment_status: String,
    pub status: String,
    pub source: String,
    pub last_request_payload: Option<String>,
    pub last_response: Option<String>,
    pub last_error_code: Option<String>,
    pub last_external_call_at: Option<DateTime<Utc>>,
    pub reconcile_attempts: i32,
    pub next_reconcile_at: Option<DateTime<Utc>>,
    pub notification_status: String,
    pub notification_attempts: i32,
    pub notification_sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::bookings)]
pub struct NewDbBooking {
    pub id: Uuid,
    pub booking_number: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub license_plate: String,
    pub client_name: String,
    pub client_email: Option<String>,
    pub client_phone: Option<String>,
    pub amount: bigdecimal::BigDecimal,
    pub payment_reference: Option<String>,
    pub payment_status: String,
    pub status: String,
    pub source: String,
    pub notification_status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Audit columns written after every slot API exchange.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = crate::schema::bookings, treat_none_as_null = true)]
pub struct ExternalAuditChangeset {
    pub last_request_payload: Option<String>,
    pub last_response: Option<String>,
    pub last_error_code: Option<String>,
    pub last_external_call_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::notification_queue)]
pub struct DbNotificationTask {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub attempts: i32,
    pub max_attempts: i32,
    pub status: String,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::reservation_settings)]
pub struct DbReservationSettings {
    pub id: i32,
    pub max_capacity: i64,
    pub bookings_enabled: bool,
    pub updated_at: DateTime<Utc>,
}

impl From<NewBooking> for NewDbBooking {
    fn from(new_booking: NewBooking) -> Self {
        let booking = new_booking.into_booking(Utc::now());
        Self {
            id: booking.id,
            booking_number: booking.booking_number,
            start_at: booking.start_at,
            end_at: booking.end_at,
            license_plate: booking.license_plate,
            client_name: booking.client_name,
            client_email: booking.client_email,
            client_phone: booking.client_phone,
            amount: booking.amount,
            payment_reference: booking.payment_reference,
            payment_status: booking.payment_status.to_string(),
            status: booking.status.to_string(),
            source: booking.source.to_string(),
            notification_status: booking.notification_status.to_string(),
            created_at: booking.created_at,
            updated_at: booking.updated_at,
        }
    }
}

impl From<&ExternalAudit> for ExternalAuditChangeset {
    fn from(audit: &ExternalAudit) -> Self {
        Self {
            last_request_payload: audit.request_payload.clone(),
            last_response: audit.response.clone(),
            last_error_code: audit.error_code.clone(),
            last_external_call_at: audit.called_at,
        }
    }
}

impl TryFrom<DbBooking> for Booking {
    type Error = anyhow::Error;

    fn try_from(db_booking: DbBooking) -> Result<Self, Self::Error> {
        Ok(Self {
            id: db_booking.id,
            booking_number: db_booking.booking_number,
            external_booking_number: db_booking.external_booking_number,
            start_at: db_booking.start_at,
            end_at: db_booking.end_at,
            license_plate: db_booking.license_plate,
            client_name: db_booking.client_name,
            client_email: db_booking.client_email,
            client_phone: db_booking.client_phone,
            amount: db_booking.amount,
            payment_reference: db_booking.payment_reference,
            payment_status: db_booking.payment_status.parse()?,
            status: db_booking.status.parse()?,
            source: db_booking.source.parse()?,
            audit: ExternalAudit {
                request_payload: db_booking.last_request_payload,
                response: db_booking.last_response,
                error_code: db_booking.last_error_code,
                called_at: db_booking.last_external_call_at,
            },
            reconcile_attempts: db_booking.reconcile_attempts,
            next_reconcile_at: db_booking.next_reconcile_at,
            notification_status: db_booking.notification_status.parse()?,
            notification_attempts: db_booking.notification_attempts,
            notification_sent_at: db_booking.notification_sent_at,
            created_at: db_booking.created_at,
            updated_at: db_booking.updated_at,
        })
    }
}

impl From<NotificationTask> for DbNotificationTask {
    fn from(task: NotificationTask) -> Self {
        Self {
            id: task.id,
            booking_id: task.booking_id,
            attempts: task.attempts,
            max_attempts: task.max_attempts,
            status: task.status.to_string(),
            next_retry_at: task.next_retry_at,
            last_error: task.last_error,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

impl TryFrom<DbNotificationTask> for NotificationTask {
    type Error = anyhow::Error;

    fn try_from(db_task: DbNotificationTask) -> Result<Self, Self::Error> {
        Ok(Self {
            id: db_task.id,
            booking_id: db_task.booking_id,
            attempts: db_task.attempts,
            max_attempts: db_task.max_attempts,
            status: db_task.status.parse()?,
            next_retry_at: db_task.next_retry_at,
            last_error: db_task.last_error,
            created_at: db_task.created_at,
            updated_at: db_task.updated_at,
        })
    }
}

impl From<DbReservationSettings> for ReservationSettings {
    fn from(row: DbReservationSettings) -> Self {
        Self {
            max_capacity: row.max_capacity,
            bookings_enabled: row.bookings_enabled,
        }
    }
}
