//! Scheduling collaborator: Cal.com client behind the [`Scheduler`] trait.
//!
//! The tool executor only ever sees the trait, so its dispatch logic
//! can be tested with a stub and the booking backend stays swappable.

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::CalendarConfig;

/// Booking details collected from the assistant's tool arguments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BookingRequest {
    pub selected_date: String,
    pub selected_time: String,
    pub timezone: String,
    pub name: String,
    pub email: String,
    pub description_of_meeting: String,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("missing required booking field: {0}")]
    MissingField(&'static str),
    #[error("scheduling backend is not configured")]
    NotConfigured,
    #[error("scheduling API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("scheduling request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("no booking id returned by the scheduling backend")]
    NoBookingId,
}

/// External scheduling collaborator contract.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Open `HH:MM` slots for a date and IANA timezone. Returns an
    /// empty list on any upstream error — never fails the caller.
    async fn available_slots(&self, date: &str, timezone: &str) -> Vec<String>;

    /// Create a booking and return its identifier. Fails with a
    /// descriptive error; the tool executor converts it into data.
    async fn create_booking(&self, request: &BookingRequest) -> Result<String, SchedulerError>;
}

/// Cal.com API v2 implementation.
pub struct CalComScheduler {
    client: Client,
    api_key: String,
    event_type_id: String,
    api_version: String,
    base_url: String,
}

impl CalComScheduler {
    pub fn from_config(config: &CalendarConfig, client: Client) -> Self {
        Self {
            client,
            api_key: config.api_key.clone(),
            event_type_id: config.event_type_id.clone(),
            api_version: config.api_version.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }

    fn configured(&self) -> bool {
        !self.api_key.is_empty() && !self.event_type_id.is_empty()
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SlotsResponse {
    #[serde(default)]
    data: Option<SlotsData>,
}

#[derive(Deserialize)]
struct SlotsData {
    #[serde(default)]
    slots: serde_json::Map<String, serde_json::Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateBookingRequest<'a> {
    event_type_id: i64,
    start: String,
    attendee: Attendee<'a>,
    booking_fields_responses: BookingFields<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Attendee<'a> {
    name: &'a str,
    email: &'a str,
    time_zone: &'a str,
    language: &'a str,
}

#[derive(Serialize)]
struct BookingFields<'a> {
    notes: &'a str,
}

/// Pull a time out of a slot entry, which Cal.com returns either as a
/// bare string or as `{"time": "..."}`.
fn slot_time(slot: &serde_json::Value) -> Option<&str> {
    slot.as_str()
        .or_else(|| slot.get("time").and_then(|t| t.as_str()))
}

/// Reformat an RFC 3339 slot timestamp as `HH:MM`. The API already
/// localizes slots to the requested timezone.
fn format_slot(raw: &str) -> Option<String> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.format("%H:%M").to_string())
}

#[async_trait]
impl Scheduler for CalComScheduler {
    async fn available_slots(&self, date: &str, timezone: &str) -> Vec<String> {
        if !self.configured() {
            error!("Calendar API key or event type id not configured");
            return Vec::new();
        }

        debug!(date, timezone, "Fetching availability");

        let url = format!("{}/slots/available", self.base_url);
        let result = self
            .client
            .get(&url)
            .query(&[
                ("startTime", format!("{date}T00:00:00")),
                ("endTime", format!("{date}T23:59:59")),
                ("eventTypeId", self.event_type_id.clone()),
                ("timeZone", timezone.to_string()),
            ])
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("cal-api-version", &self.api_version)
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "Availability request failed");
                return Vec::new();
            }
        };

        if !response.status().is_success() {
            error!(status = %response.status(), "Availability API error");
            return Vec::new();
        }

        let parsed: SlotsResponse = match response.json().await {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "Failed to parse availability response");
                return Vec::new();
            }
        };

        let slots = parsed
            .data
            .map(|d| d.slots)
            .unwrap_or_default()
            .remove(date)
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();

        let times: Vec<String> = slots
            .iter()
            .filter_map(|slot| slot_time(slot).and_then(format_slot))
            .collect();

        debug!(date, count = times.len(), "Found available slots");
        times
    }

    async fn create_booking(&self, request: &BookingRequest) -> Result<String, SchedulerError> {
        if !self.configured() {
            return Err(SchedulerError::NotConfigured);
        }
        if request.selected_date.is_empty() {
            return Err(SchedulerError::MissingField("selectedDate"));
        }
        if request.selected_time.is_empty() {
            return Err(SchedulerError::MissingField("selectedTime"));
        }
        if request.name.is_empty() {
            return Err(SchedulerError::MissingField("name"));
        }
        if request.email.is_empty() {
            return Err(SchedulerError::MissingField("email"));
        }

        let event_type_id: i64 = self
            .event_type_id
            .parse()
            .map_err(|_| SchedulerError::NotConfigured)?;

        let start = format!("{}T{}:00", request.selected_date, request.selected_time);

        let body = CreateBookingRequest {
            event_type_id,
            start,
            attendee: Attendee {
                name: &request.name,
                email: &request.email,
                time_zone: &request.timezone,
                language: "en",
            },
            booking_fields_responses: BookingFields {
                notes: &request.description_of_meeting,
            },
        };

        info!(
            date = %request.selected_date,
            time = %request.selected_time,
            "Creating booking"
        );

        let response = self
            .client
            .post(format!("{}/bookings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("cal-api-version", &self.api_version)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            error!(status = %status, message, "Booking failed");
            return Err(SchedulerError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let data: serde_json::Value = response.json().await?;

        let booking_id = ["id", "uid"]
            .iter()
            .find_map(|key| {
                data.get("data")
                    .and_then(|d| d.get(key))
                    .or_else(|| data.get(key))
                    .filter(|v| !v.is_null())
            })
            .map(|v| match v.as_str() {
                Some(s) => s.to_string(),
                None => v.to_string(),
            })
            .ok_or(SchedulerError::NoBookingId)?;

        info!(booking_id = %booking_id, "Booking created");
        Ok(booking_id)
    }
}
