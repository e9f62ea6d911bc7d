//! Post-commit notification fan-out.
//!
//! Confirmations enqueue a durable task after the booking transaction commits;
//! [`NotificationWorker`] drains due tasks and hands them to a
//! [`NotificationSink`]. Delivery failures only ever touch the task and the
//! booking's notification audit, never its status.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use rdkafka::producer::{FutureProducer, FutureRecord};
use shared::retry::RetryPolicy;
use shared::*;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{AttemptOutcome, BookingStore, NotificationQueue};

const TOKEN_TIME_FORMAT: &str = "%Y%m%dT%H%M%SZ";

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("booking {0} no longer exists")]
    BookingMissing(Uuid),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("failed to encode notification: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &BookingNotification) -> Result<(), NotificationError>;
}

/// Publishes notifications as JSON for the mailer, keyed by booking id.
pub struct KafkaNotificationSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaNotificationSink {
    pub fn new(producer: FutureProducer, topic: String) -> Self {
        Self { producer, topic }
    }
}

#[async_trait]
impl NotificationSink for KafkaNotificationSink {
    async fn deliver(&self, notification: &BookingNotification) -> Result<(), NotificationError> {
        let json = serde_json::to_string(notification)?;
        let key = notification.booking_id.to_string();
        let record = FutureRecord::to(&self.topic).payload(&json).key(&key);

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| NotificationError::Delivery(e.to_string()))?;

        Ok(())
    }
}

/// Deterministic access credential for the gate. The same booking always
/// yields the same token, so a replayed notification never invalidates one
/// already delivered.
pub fn access_token(booking: &Booking) -> String {
    format!(
        "PARK|{}|{}|{}|{}",
        customer_number(booking),
        booking.license_plate,
        booking.start_at.format(TOKEN_TIME_FORMAT),
        booking.end_at.format(TOKEN_TIME_FORMAT),
    )
}

fn customer_number(booking: &Booking) -> &str {
    booking
        .external_booking_number
        .as_deref()
        .unwrap_or(&booking.booking_number)
}

pub fn build_notification(booking: &Booking) -> BookingNotification {
    BookingNotification {
        booking_id: booking.id,
        booking_number: customer_number(booking).to_string(),
        recipient_email: booking.client_email.clone(),
        recipient_phone: booking.client_phone.clone(),
        access_token: access_token(booking),
        message: format!(
            "Parking booking {} for {} is confirmed from {} to {}.",
            customer_number(booking),
            booking.license_plate,
            booking.start_at.format("%Y-%m-%d %H:%M UTC"),
            booking.end_at.format("%Y-%m-%d %H:%M UTC"),
        ),
    }
}

/// Enqueue side of the fan-out, shared by everything that confirms bookings.
#[derive(Clone)]
pub struct NotificationHandoff {
    queue: Arc<dyn NotificationQueue>,
    wakeup: Arc<Notify>,
    max_attempts: i32,
}

impl NotificationHandoff {
    pub fn new(queue: Arc<dyn NotificationQueue>, wakeup: Arc<Notify>, max_attempts: i32) -> Self {
        Self {
            queue,
            wakeup,
            max_attempts,
        }
    }

    /// Returns whether a task was queued. A failure is logged and swallowed:
    /// the booking is already committed and stays confirmed.
    pub async fn enqueue(&self, booking: &Booking) -> bool {
        let task = NotificationTask::new(booking.id, self.max_attempts, Utc::now());
        let task_id = task.id;
        match self.queue.enqueue(task).await {
            Ok(()) => {
                info!("Queued notification {} for booking {}", task_id, booking.id);
                self.wakeup.notify_one();
                true
            }
            Err(e) => {
                error!(
                    booking_id = %booking.id,
                    "Failed to queue notification, booking stays confirmed: {}", e
                );
                false
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub concurrency: usize,
    /// Tasks left in `processing` longer than this are handed out again.
    pub processing_lease: chrono::Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 20,
            concurrency: 4,
            processing_lease: chrono::Duration::minutes(10),
        }
    }
}

pub struct NotificationWorker {
    queue: Arc<dyn NotificationQueue>,
    store: Arc<dyn BookingStore>,
    sink: Arc<dyn NotificationSink>,
    policy: RetryPolicy,
    config: WorkerConfig,
    wakeup: Arc<Notify>,
}

impl NotificationWorker {
    pub fn new(
        queue: Arc<dyn NotificationQueue>,
        store: Arc<dyn BookingStore>,
        sink: Arc<dyn NotificationSink>,
        policy: RetryPolicy,
        config: WorkerConfig,
        wakeup: Arc<Notify>,
    ) -> Self {
        Self {
            queue,
            store,
            sink,
            policy,
            config,
            wakeup,
        }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.wakeup.notified() => {}
            }

            if let Err(e) = self.process_due().await {
                error!("Error processing notification queue: {}", e);
            }
        }
    }

    /// One drain pass. Returns how many tasks were attempted.
    pub async fn process_due(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let requeued = self
            .queue
            .requeue_stale(now - self.config.processing_lease, now)
            .await?;
        if requeued > 0 {
            warn!("Requeued {} notification tasks with an expired lease", requeued);
        }

        let tasks = self.queue.claim_due(now, self.config.batch_size).await?;
        let attempted = tasks.len();

        stream::iter(tasks)
            .map(|task| self.process(task))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect::<Vec<()>>()
            .await;

        Ok(attempted)
    }

    async fn process(&self, task: NotificationTask) {
        let result = self.deliver(&task).await;
        let finished_at = Utc::now();
        let attempts = task.attempts + 1;

        let outcome = match result {
            Ok(()) => {
                info!("Delivered notification for booking {}", task.booking_id);
                AttemptOutcome {
                    task_id: task.id,
                    booking_id: task.booking_id,
                    attempts,
                    status: TaskStatus::Completed,
                    next_retry_at: task.next_retry_at,
                    last_error: None,
                    notification_status: NotificationStatus::Sent,
                    finished_at,
                }
            }
            Err(e) if attempts >= task.max_attempts => {
                error!(
                    task_id = %task.id,
                    attempts,
                    "Giving up on notification for booking {}: {}", task.booking_id, e
                );
                AttemptOutcome {
                    task_id: task.id,
                    booking_id: task.booking_id,
                    attempts,
                    status: TaskStatus::Failed,
                    next_retry_at: task.next_retry_at,
                    last_error: Some(e.to_string()),
                    notification_status: NotificationStatus::Failed,
                    finished_at,
                }
            }
            Err(e) => {
                // Delay grows with the failures recorded before this one.
                let next_retry_at = self
                    .policy
                    .next_attempt_at(finished_at, task.attempts.max(0) as u32);
                warn!(
                    task_id = %task.id,
                    attempts,
                    "Notification for booking {} failed, retrying at {}: {}",
                    task.booking_id, next_retry_at, e
                );
                AttemptOutcome {
                    task_id: task.id,
                    booking_id: task.booking_id,
                    attempts,
                    status: TaskStatus::Pending,
                    next_retry_at,
                    last_error: Some(e.to_string()),
                    notification_status: NotificationStatus::NotSent,
                    finished_at,
                }
            }
        };

        if let Err(e) = self.queue.finish_attempt(&outcome).await {
            // Stays `processing`; the lease hands it out again.
            error!("Failed to record notification attempt {}: {}", task.id, e);
        }
    }

    async fn deliver(&self, task: &NotificationTask) -> Result<(), NotificationError> {
        let booking = self
            .store
            .get_booking(task.booking_id)
            .await?
            .ok_or(NotificationError::BookingMissing(task.booking_id))?;

        self.sink.deliver(&build_notification(&booking)).await
    }
}
