use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::ReservationSettings;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{BookingError, StoreError};
use crate::store::BookingStore;

/// Lot-wide occupancy gauge. Reported, never used to gate a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GlobalCapacity {
    pub allowed: bool,
    /// Counter value minus confirmed bookings that ended but were not swept.
    pub active: i64,
    /// `None` when capacity is unlimited.
    pub max: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowCapacity {
    pub allowed: bool,
    /// Free places during the window; `None` when capacity is unlimited.
    pub available: Option<i64>,
    pub overlapping: i64,
}

#[derive(Clone)]
pub struct AdmissionController {
    store: Arc<dyn BookingStore>,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn BookingStore>) -> Self {
        Self { store }
    }

    pub async fn check_global_capacity(&self, now: DateTime<Utc>) -> Result<GlobalCapacity, StoreError> {
        let settings = self.store.reservation_settings().await?;
        let stats = self.store.reservation_stats().await?;
        let stale = self.store.count_ended_confirmed(now).await?;
        let active = (stats.active_count - stale).max(0);

        if settings.max_capacity <= 0 {
            return Ok(GlobalCapacity {
                allowed: true,
                active,
                max: None,
            });
        }

        Ok(GlobalCapacity {
            allowed: active < settings.max_capacity,
            active,
            max: Some(settings.max_capacity),
        })
    }

    pub async fn check_window_capacity(
        &self,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<WindowCapacity, StoreError> {
        let settings = self.store.reservation_settings().await?;
        self.window_capacity(&settings, start_at, end_at, now).await
    }

    /// Gate run before any booking is claimed. Optimistic: nothing is held
    /// between this check and the confirm, so two concurrent requests for the
    /// last place can both pass.
    pub async fn admit(
        &self,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<WindowCapacity, BookingError> {
        let settings = self.store.reservation_settings().await?;
        if !settings.bookings_enabled {
            info!("Rejecting booking for {} - {}: bookings disabled", start_at, end_at);
            return Err(BookingError::BookingsDisabled);
        }

        let window = self.window_capacity(&settings, start_at, end_at, now).await?;
        if !window.allowed {
            info!(
                overlapping = window.overlapping,
                "Rejecting booking for {} - {}: window is full", start_at, end_at
            );
            return Err(BookingError::CapacityExceeded {
                available: window.available.unwrap_or(0),
            });
        }

        Ok(window)
    }

    async fn window_capacity(
        &self,
        settings: &ReservationSettings,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<WindowCapacity, StoreError> {
        let overlapping = self
            .store
            .count_overlapping_active(start_at, end_at, now)
            .await?;

        if settings.max_capacity <= 0 {
            return Ok(WindowCapacity {
                allowed: true,
                available: None,
                overlapping,
            });
        }

        let available = (settings.max_capacity - overlapping).max(0);
        debug!(overlapping, available, "Window capacity for {} - {}", start_at, end_at);
        Ok(WindowCapacity {
            allowed: available > 0,
            available: Some(available),
            overlapping,
        })
    }
}
