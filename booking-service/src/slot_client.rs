use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use shared::retry::{retry_with_backoff_if, RetryPolicy};
use shared::{Booking, ExternalAudit};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Response code the slot service uses for "accepted".
const SUCCESS_CODE: &str = "1";
const MAX_MESSAGE_LEN: usize = 512;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SlotApiError {
    /// Outcome unknown: the service may still have applied the operation.
    #[error("slot service did not answer within {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("slot service rejected the request ({code}): {message}")]
    ServiceRejected { code: String, message: String },

    #[error("malformed slot service response: {0}")]
    MalformedResponse(String),
}

impl SlotApiError {
    /// Short code stored in the booking's audit trail.
    pub fn audit_code(&self) -> String {
        match self {
            SlotApiError::Timeout(_) => "timeout".to_string(),
            SlotApiError::Transport(_) => "transport".to_string(),
            SlotApiError::ServiceRejected { code, .. } => code.clone(),
            SlotApiError::MalformedResponse(_) => "malformed".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    New,
    Delete,
}

impl Operation {
    fn code(self) -> &'static str {
        match self {
            Operation::New => "N",
            Operation::Delete => "D",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlotRequest {
    pub booking_number: String,
    pub license_plate: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

impl SlotRequest {
    pub fn submit_for(booking: &Booking) -> Self {
        Self {
            booking_number: booking.booking_number.clone(),
            license_plate: booking.license_plate.clone(),
            start_at: booking.start_at,
            end_at: booking.end_at,
        }
    }

    pub fn cancel_for(booking: &Booking) -> Self {
        Self {
            booking_number: booking
                .external_booking_number
                .clone()
                .unwrap_or_else(|| booking.booking_number.clone()),
            ..Self::submit_for(booking)
        }
    }

    /// Whole minutes, rounded up so the slot covers the full window.
    fn duration_minutes(&self) -> i64 {
        let seconds = (self.end_at - self.start_at).num_seconds();
        (seconds + 59).div_euclid(60)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlotReceipt {
    /// Number the service acknowledged; falls back to the one we sent.
    pub external_number: String,
    pub message: String,
}

/// One round trip, kept whole so callers can persist the audit trail.
#[derive(Debug, Clone)]
pub struct SlotExchange {
    pub request_body: String,
    pub raw_response: Option<String>,
    pub result: Result<SlotReceipt, SlotApiError>,
}

impl SlotExchange {
    pub fn audit(&self, called_at: DateTime<Utc>) -> ExternalAudit {
        ExternalAudit {
            request_payload: Some(self.request_body.clone()),
            response: self.raw_response.clone(),
            error_code: self.result.as_ref().err().map(SlotApiError::audit_code),
            called_at: Some(called_at),
        }
    }
}

#[async_trait]
pub trait SlotApi: Send + Sync {
    async fn submit(&self, request: &SlotRequest) -> SlotExchange;

    async fn cancel(&self, request: &SlotRequest) -> SlotExchange;
}

#[derive(Debug, Clone)]
pub struct SlotApiConfig {
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub facility_id: String,
    pub timeout: Duration,
    pub utc_offset: FixedOffset,
    pub transport_retry: RetryPolicy,
}

#[derive(Clone)]
pub struct HttpSlotClient {
    client: Client,
    config: SlotApiConfig,
}

struct HttpReply {
    status: u16,
    body: String,
}

impl HttpSlotClient {
    pub fn new(config: SlotApiConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    async fn exchange(&self, operation: Operation, request: &SlotRequest) -> SlotExchange {
        let request_body =
            match render_request(&self.config.facility_id, operation, request, self.config.utc_offset) {
                Ok(body) => body,
                Err(e) => {
                    return SlotExchange {
                        request_body: String::new(),
                        raw_response: None,
                        result: Err(e),
                    }
                }
            };

        // The timeout bounds the whole call, transport retries included.
        let started = Instant::now();
        let reply = tokio::time::timeout(
            self.config.timeout,
            retry_with_backoff_if(
                &self.config.transport_retry,
                |e: &SlotApiError| matches!(e, SlotApiError::Transport(_)),
                || self.post(request_body.clone()),
            ),
        )
        .await
        .unwrap_or(Err(SlotApiError::Timeout(self.config.timeout)));
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (raw_response, result) = match reply {
            Err(e) => (None, Err(e)),
            Ok(reply) if !(200..300).contains(&reply.status) => {
                let rejection = SlotApiError::ServiceRejected {
                    code: format!("HTTP_{}", reply.status),
                    message: truncate(&reply.body),
                };
                (Some(reply.body), Err(rejection))
            }
            Ok(reply) => {
                let parsed = parse_response(&reply.body, &request.booking_number);
                (Some(reply.body), parsed)
            }
        };

        match &result {
            Ok(receipt) => info!(
                booking_number = %request.booking_number,
                operation = operation.code(),
                external_number = %receipt.external_number,
                elapsed_ms,
                "slot service accepted request"
            ),
            Err(e) => warn!(
                booking_number = %request.booking_number,
                operation = operation.code(),
                elapsed_ms,
                error = %e,
                "slot service call failed"
            ),
        }

        SlotExchange {
            request_body,
            raw_response,
            result,
        }
    }

    async fn post(&self, body: String) -> Result<HttpReply, SlotApiError> {
        let timeout = self.config.timeout;
        let classify = |e: reqwest::Error| {
            if e.is_timeout() {
                SlotApiError::Timeout(timeout)
            } else {
                SlotApiError::Transport(e.to_string())
            }
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .header(CONTENT_TYPE, "text/xml; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(classify)?;
        Ok(HttpReply { status, body })
    }
}

#[async_trait]
impl SlotApi for HttpSlotClient {
    async fn submit(&self, request: &SlotRequest) -> SlotExchange {
        self.exchange(Operation::New, request).await
    }

    async fn cancel(&self, request: &SlotRequest) -> SlotExchange {
        self.exchange(Operation::Delete, request).await
    }
}

pub fn render_request(
    facility_id: &str,
    operation: Operation,
    request: &SlotRequest,
    utc_offset: FixedOffset,
) -> Result<String, SlotApiError> {
    let start_date = request
        .start_at
        .with_timezone(&utc_offset)
        .format("%Y/%m/%d %H:%M:%S")
        .to_string();
    let duration = request.duration_minutes().to_string();

    let encode = |e: quick_xml::Error| {
        SlotApiError::Transport(format!("failed to encode request: {e}"))
    };

    let mut writer = Writer::new(Vec::new());
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
        .map_err(encode)?;
    writer
        .write_event(Event::Start(BytesStart::new("BookingSubmitRequest")))
        .map_err(encode)?;
    write_field(&mut writer, "FacilityId", facility_id).map_err(encode)?;
    write_field(&mut writer, "OperationType", operation.code()).map_err(encode)?;
    write_field(&mut writer, "BookingNumber", &request.booking_number).map_err(encode)?;
    if operation == Operation::New {
        write_field(&mut writer, "LicensePlate", &request.license_plate).map_err(encode)?;
    }
    write_field(&mut writer, "StartDate", &start_date).map_err(encode)?;
    write_field(&mut writer, "Duration", &duration).map_err(encode)?;
    write_field(&mut writer, "AccessMode", "0").map_err(encode)?;
    writer
        .write_event(Event::End(BytesEnd::new("BookingSubmitRequest")))
        .map_err(encode)?;

    String::from_utf8(writer.into_inner())
        .map_err(|e| SlotApiError::Transport(format!("failed to encode request: {e}")))
}

fn write_field(writer: &mut Writer<Vec<u8>>, name: &str, value: &str) -> quick_xml::Result<()> {
    writer
        .create_element(name)
        .write_text_content(BytesText::new(value))?;
    Ok(())
}

/// Reads `<ErrorCode>`, `<Message>` and the optional `<BookingNumber>` out of a
/// response body, wherever they sit in the document.
pub fn parse_response(body: &str, sent_number: &str) -> Result<SlotReceipt, SlotApiError> {
    let mut reader = Reader::from_str(body);
    reader.trim_text(true);

    let mut current: Option<Vec<u8>> = None;
    let mut code = None;
    let mut message = None;
    let mut number = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => current = Some(element.name().as_ref().to_vec()),
            Ok(Event::End(_)) => current = None,
            Ok(Event::Text(text)) => {
                let value = text
                    .unescape()
                    .map_err(|e| SlotApiError::MalformedResponse(e.to_string()))?
                    .into_owned();
                match current.as_deref() {
                    Some(b"ErrorCode") => code = Some(value),
                    Some(b"Message") => message = Some(value),
                    Some(b"BookingNumber") => number = Some(value),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SlotApiError::MalformedResponse(e.to_string())),
            _ => {}
        }
    }

    let code = code
        .ok_or_else(|| SlotApiError::MalformedResponse("missing ErrorCode element".to_string()))?;
    let message = message.unwrap_or_default();

    if code.trim() != SUCCESS_CODE {
        return Err(SlotApiError::ServiceRejected {
            code: code.trim().to_string(),
            message,
        });
    }

    Ok(SlotReceipt {
        external_number: number
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| sent_number.to_string()),
        message,
    })
}

fn truncate(body: &str) -> String {
    body.chars().take(MAX_MESSAGE_LEN).collect()
}
