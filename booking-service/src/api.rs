use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post, put},
    Router,
};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::*;
use std::sync::Arc;
use uuid::Uuid;

use crate::admission::{GlobalCapacity, WindowCapacity};
use crate::error::BookingError;
use crate::orchestrator::BookingOrchestrator;
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::store::{BookingStore, NotificationQueue};

const PAYMENT_SUCCEEDED: &str = "payment.succeeded";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<BookingOrchestrator>,
    pub reconciler: Arc<Reconciler>,
    pub store: Arc<dyn BookingStore>,
    pub queue: Arc<dyn NotificationQueue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookingDetails {
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub license_plate: String,
    pub client_name: String,
    #[serde(default)]
    pub client_email: Option<String>,
    #[serde(default)]
    pub client_phone: Option<String>,
}

impl BookingDetails {
    fn into_intent(self, amount: BigDecimal) -> BookingIntent {
        BookingIntent {
            start_at: self.start_at,
            end_at: self.end_at,
            license_plate: self.license_plate,
            client_name: self.client_name,
            client_email: self.client_email,
            client_phone: self.client_phone,
            amount,
        }
    }
}

/// Payment provider callback. Booking details travel in `metadata`.
#[derive(Debug, Deserialize)]
pub struct PaymentWebhook {
    pub payment_reference: String,
    #[serde(default)]
    pub event_type: Option<String>,
    pub amount: BigDecimal,
    pub metadata: BookingDetails,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct WebhookResponse {
    pub received: bool,
    pub outcome: String,
    pub booking_number: Option<String>,
    pub booking_id: Option<Uuid>,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateBookingRequest {
    #[serde(flatten)]
    pub details: BookingDetails,
    #[serde(default)]
    pub amount: Option<BigDecimal>,
    #[serde(default)]
    pub source: Option<BookingSource>,
    #[serde(default)]
    pub payment_reference: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BookingResponse {
    pub booking: Booking,
    pub success: bool,
    pub duplicate: bool,
    pub pending_reason: Option<PendingReason>,
}

impl From<BookingResult> for BookingResponse {
    fn from(result: BookingResult) -> Self {
        Self {
            booking: result.booking,
            success: result.success,
            duplicate: result.duplicate,
            pending_reason: result.pending_reason,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub active_count: i64,
    pub scanned_active: i64,
    pub global: GlobalCapacity,
    pub settings: ReservationSettings,
}

#[derive(Debug, Deserialize)]
pub struct SettingsUpdate {
    #[serde(default)]
    pub max_capacity: Option<i64>,
    #[serde(default)]
    pub bookings_enabled: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/payment", post(payment_webhook))
        .route("/bookings", post(create_booking))
        .route("/bookings/:id", get(get_booking))
        .route("/bookings/external/:number", delete(cancel_booking))
        .route("/availability", get(availability))
        .route("/admin/stats", get(stats))
        .route("/admin/settings", put(update_settings))
        .route("/admin/reconcile", post(reconcile))
        .route("/admin/reconcile/failures", get(reconcile_failures))
        .route("/admin/notifications/failed", get(failed_notifications))
        .route("/admin/notifications/:id/replay", post(replay_notification))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

fn error_response(err: BookingError) -> ApiError {
    let status = match &err {
        BookingError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        BookingError::BookingsDisabled => StatusCode::SERVICE_UNAVAILABLE,
        BookingError::CapacityExceeded { .. } => StatusCode::CONFLICT,
        BookingError::NotFound(_) => StatusCode::NOT_FOUND,
        BookingError::NotCancellable { .. } => StatusCode::CONFLICT,
        BookingError::External(_) => StatusCode::BAD_GATEWAY,
        BookingError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("Request failed: {}", err);
    }
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

fn internal_error(err: impl std::fmt::Display) -> ApiError {
    tracing::error!("Request failed: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

/// Answers 200 once the payment is accounted for, so the provider stops
/// redelivering; the outcome is in the body and duplicate deliveries get the
/// same body as the first. A store failure answers 503 instead: nothing was
/// recorded, and the redelivery is safe under the payment reference.
pub async fn payment_webhook(
    State(state): State<AppState>,
    Json(webhook): Json<PaymentWebhook>,
) -> (StatusCode, Json<WebhookResponse>) {
    if let Some(event_type) = webhook.event_type.as_deref() {
        if event_type != PAYMENT_SUCCEEDED {
            tracing::info!("Ignoring {} webhook for {}", event_type, webhook.payment_reference);
            return (StatusCode::OK, Json(WebhookResponse {
                received: true,
                outcome: "ignored".to_string(),
                booking_number: None,
                booking_id: None,
                reason: Some(format!("unhandled event type {}", event_type)),
            }));
        }
    }

    let intent = webhook.metadata.into_intent(webhook.amount);
    let payment = PaymentContext::webhook(webhook.payment_reference.clone());

    let (status, response) = match state.orchestrator.create(intent, payment).await {
        Ok(result) => {
            let outcome = if result.success {
                "confirmed"
            } else {
                "pending_confirmation"
            };
            let response = WebhookResponse {
                received: true,
                outcome: outcome.to_string(),
                booking_number: Some(result.booking.booking_number),
                booking_id: Some(result.booking.id),
                reason: None,
            };
            (StatusCode::OK, response)
        }
        Err(e) => {
            let (status, outcome) = match e {
                BookingError::Store(_) => (StatusCode::SERVICE_UNAVAILABLE, "error"),
                _ if e.is_rejection() => (StatusCode::OK, "rejected"),
                _ => (StatusCode::OK, "error"),
            };
            if status.is_server_error() {
                tracing::error!(
                    "Webhook for {} could not be recorded, asking for redelivery: {}",
                    webhook.payment_reference, e
                );
            } else {
                tracing::warn!(
                    "Webhook for {} not booked ({}): {}",
                    webhook.payment_reference, outcome, e
                );
            }
            let response = WebhookResponse {
                received: !status.is_server_error(),
                outcome: outcome.to_string(),
                booking_number: None,
                booking_id: None,
                reason: Some(e.to_string()),
            };
            (status, response)
        }
    };

    (status, Json(response))
}

pub async fn create_booking(
    State(state): State<AppState>,
    Json(request): Json<CreateBookingRequest>,
) -> Result<(StatusCode, Json<BookingResponse>), ApiError> {
    let base = match request.source.unwrap_or(BookingSource::Manual) {
        BookingSource::Webhook => {
            return Err(error_response(BookingError::Validation(
                "webhook bookings must come through the payment webhook".to_string(),
            )))
        }
        BookingSource::Manual => PaymentContext::manual(),
        BookingSource::PayOnSite => PaymentContext::pay_on_site(),
        BookingSource::Test => PaymentContext {
            source: BookingSource::Test,
            payment_reference: None,
            payment_status: PaymentStatus::Paid,
        },
    };
    let payment = PaymentContext {
        payment_reference: request.payment_reference,
        ..base
    };
    let amount = request.amount.unwrap_or_else(|| BigDecimal::from(0));

    let result = state
        .orchestrator
        .create(request.details.into_intent(amount), payment)
        .await
        .map_err(error_response)?;

    let status = match result.pending_reason {
        _ if result.success => StatusCode::CREATED,
        // Unpaid and refused by the slot service: nothing will confirm it later.
        Some(PendingReason::ExternalRejected) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::ACCEPTED,
    };
    Ok((status, Json(result.into())))
}

pub async fn get_booking(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Booking>, ApiError> {
    state.orchestrator.get(id).await.map(Json).map_err(error_response)
}

pub async fn cancel_booking(
    State(state): State<AppState>,
    Path(number): Path<String>,
) -> Result<Json<Booking>, ApiError> {
    state
        .orchestrator
        .cancel(&number)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn availability(
    State(state): State<AppState>,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Json<WindowCapacity>, ApiError> {
    if query.end_at <= query.start_at {
        return Err(error_response(BookingError::Validation(
            "end_at must be after start_at".to_string(),
        )));
    }
    state
        .orchestrator
        .admission()
        .check_window_capacity(query.start_at, query.end_at, Utc::now())
        .await
        .map(Json)
        .map_err(internal_error)
}

pub async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let now = Utc::now();
    let counter = state.store.reservation_stats().await.map_err(internal_error)?;
    let scanned_active = state.store.count_active(now).await.map_err(internal_error)?;
    let settings = state
        .store
        .reservation_settings()
        .await
        .map_err(internal_error)?;
    let global = state
        .orchestrator
        .admission()
        .check_global_capacity(now)
        .await
        .map_err(internal_error)?;

    Ok(Json(StatsResponse {
        active_count: counter.active_count,
        scanned_active,
        global,
        settings,
    }))
}

pub async fn update_settings(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> Result<Json<ReservationSettings>, ApiError> {
    let mut settings = state
        .store
        .reservation_settings()
        .await
        .map_err(internal_error)?;
    if let Some(max_capacity) = update.max_capacity {
        if max_capacity < 0 {
            return Err(error_response(BookingError::Validation(
                "max_capacity cannot be negative".to_string(),
            )));
        }
        settings.max_capacity = max_capacity;
    }
    if let Some(enabled) = update.bookings_enabled {
        settings.bookings_enabled = enabled;
    }

    let saved = state
        .store
        .update_settings(&settings)
        .await
        .map_err(internal_error)?;
    tracing::info!(
        "Reservation settings updated: max_capacity={}, bookings_enabled={}",
        saved.max_capacity, saved.bookings_enabled
    );
    Ok(Json(saved))
}

pub async fn reconcile(State(state): State<AppState>) -> Result<Json<ReconcileReport>, ApiError> {
    state
        .reconciler
        .run_once()
        .await
        .map(Json)
        .map_err(internal_error)
}

pub async fn reconcile_failures(State(state): State<AppState>) -> Result<Json<Vec<Booking>>, ApiError> {
    state
        .reconciler
        .persistent_failures()
        .await
        .map(Json)
        .map_err(internal_error)
}

pub async fn failed_notifications(
    State(state): State<AppState>,
) -> Result<Json<Vec<NotificationTask>>, ApiError> {
    state.queue.failed_tasks().await.map(Json).map_err(internal_error)
}

pub async fn replay_notification(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<NotificationTask>, ApiError> {
    match state.queue.replay(id, Utc::now()).await.map_err(internal_error)? {
        Some(task) => Ok(Json(task)),
        None => Err(error_response(BookingError::NotFound(format!(
            "failed notification task {}",
            id
        )))),
    }
}

pub async fn health_check() -> &'static str {
    "OK"
}
