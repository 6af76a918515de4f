//! Tool executor: the single point where side effects happen.
//!
//! Both the realtime path and the local-engine path hand their parsed
//! calls here, guaranteeing behavioral parity between backends. Every
//! outcome — including unknown tools, bad arguments, and booking
//! rejections — comes back as a JSON object the model can read;
//! nothing is thrown past this boundary.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::calendar::{BookingRequest, Scheduler};

pub struct ToolExecutor {
    scheduler: Arc<dyn Scheduler>,
}

impl ToolExecutor {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self { scheduler }
    }

    /// Execute a tool by name with raw JSON arguments.
    ///
    /// Always resolves to a well-formed JSON object. Safe to invoke
    /// concurrently from either backend path — no shared mutable state.
    pub async fn execute(&self, name: &str, arguments_json: &str) -> Value {
        let raw = if arguments_json.is_empty() {
            "{}"
        } else {
            arguments_json
        };

        let args: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                error!(tool = name, error = %e, raw, "Failed to parse tool arguments");
                return json!({
                    "error": "INVALID_TOOL_ARGUMENTS",
                    "message": "Could not parse tool arguments as JSON."
                });
            }
        };

        match name {
            "check_availability" => self.check_availability(&args).await,
            "book_meeting" => self.book_meeting(args).await,
            _ => {
                warn!(tool = name, "Unknown tool name");
                json!({
                    "error": "UNKNOWN_TOOL",
                    "message": format!("No handler implemented for tool: {name}")
                })
            }
        }
    }

    /// Missing or empty arguments yield an empty-slots answer rather
    /// than an error — the assistant still gets a well-formed object.
    async fn check_availability(&self, args: &Value) -> Value {
        let date = args.get("date").and_then(|v| v.as_str()).unwrap_or("");
        let timezone = args.get("timezone").and_then(|v| v.as_str()).unwrap_or("");

        if date.is_empty() || timezone.is_empty() {
            return json!({
                "date": date,
                "timezone": timezone,
                "availableSlots": []
            });
        }

        info!(date, timezone, "check_availability called");
        let slots = self.scheduler.available_slots(date, timezone).await;

        json!({
            "date": date,
            "timezone": timezone,
            "availableSlots": slots
        })
    }

    /// Booking failures are reported as data, never raised.
    async fn book_meeting(&self, args: Value) -> Value {
        let request: BookingRequest = match serde_json::from_value(args) {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "Failed to decode booking arguments");
                return json!({
                    "error": "INVALID_TOOL_ARGUMENTS",
                    "message": "Booking arguments did not match the expected shape."
                });
            }
        };

        info!(
            date = %request.selected_date,
            time = %request.selected_time,
            "book_meeting called"
        );

        match self.scheduler.create_booking(&request).await {
            Ok(meeting_id) => json!({
                "success": true,
                "meetingId": meeting_id
            }),
            Err(e) => {
                error!(error = %e, "book_meeting failed");
                json!({
                    "success": false,
                    "error": e.to_string()
                })
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::calendar::SchedulerError;

    /// Stub scheduler that counts invocations per operation.
    #[derive(Default)]
    pub(crate) struct CountingScheduler {
        pub slots_calls: AtomicUsize,
        pub booking_calls: AtomicUsize,
        pub fail_booking: bool,
    }

    #[async_trait]
    impl Scheduler for CountingScheduler {
        async fn available_slots(&self, _date: &str, _timezone: &str) -> Vec<String> {
            self.slots_calls.fetch_add(1, Ordering::SeqCst);
            vec!["09:00".into(), "14:30".into()]
        }

        async fn create_booking(
            &self,
            _request: &BookingRequest,
        ) -> Result<String, SchedulerError> {
            self.booking_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_booking {
                Err(SchedulerError::Api {
                    status: 409,
                    message: "slot taken".into(),
                })
            } else {
                Ok("booking-42".into())
            }
        }
    }

    fn executor() -> (ToolExecutor, Arc<CountingScheduler>) {
        let scheduler = Arc::new(CountingScheduler::default());
        (
            ToolExecutor::new(Arc::clone(&scheduler) as Arc<dyn Scheduler>),
            scheduler,
        )
    }

    #[tokio::test]
    async fn test_unknown_tool_shape() {
        let (exec, _) = executor();
        let result = exec.execute("unknown_tool", "{}").await;
        assert_eq!(result["error"], "UNKNOWN_TOOL");
        assert!(result["message"].is_string());

        // Same shape regardless of argument content.
        let result = exec.execute("unknown_tool", r#"{"anything": 1}"#).await;
        assert_eq!(result["error"], "UNKNOWN_TOOL");
    }

    #[tokio::test]
    async fn test_invalid_arguments_shape() {
        let (exec, _) = executor();
        let result = exec.execute("check_availability", "{not json").await;
        assert_eq!(result["error"], "INVALID_TOOL_ARGUMENTS");
    }

    #[tokio::test]
    async fn test_check_availability_missing_date_never_throws() {
        let (exec, scheduler) = executor();
        let result = exec
            .execute("check_availability", r#"{"timezone":"America/New_York"}"#)
            .await;
        assert_eq!(result["date"], "");
        assert_eq!(result["timezone"], "America/New_York");
        assert_eq!(result["availableSlots"], serde_json::json!([]));
        assert_eq!(scheduler.slots_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_check_availability_success() {
        let (exec, scheduler) = executor();
        let result = exec
            .execute(
                "check_availability",
                r#"{"date":"2025-01-15","timezone":"America/New_York"}"#,
            )
            .await;
        assert_eq!(result["date"], "2025-01-15");
        assert_eq!(
            result["availableSlots"],
            serde_json::json!(["09:00", "14:30"])
        );
        assert_eq!(scheduler.slots_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_book_meeting_success() {
        let (exec, scheduler) = executor();
        let args = r#"{
            "selectedDate": "2025-01-15",
            "selectedTime": "14:30",
            "timezone": "America/New_York",
            "name": "Jane Doe",
            "email": "jane@example.com",
            "descriptionOfMeeting": "Intro chat"
        }"#;
        let result = exec.execute("book_meeting", args).await;
        assert_eq!(result["success"], true);
        assert_eq!(result["meetingId"], "booking-42");
        assert_eq!(scheduler.booking_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_book_meeting_failure_is_data() {
        let scheduler = Arc::new(CountingScheduler {
            fail_booking: true,
            ..Default::default()
        });
        let exec = ToolExecutor::new(Arc::clone(&scheduler) as Arc<dyn Scheduler>);

        let result = exec
            .execute("book_meeting", r#"{"selectedDate":"2025-01-15"}"#)
            .await;
        assert_eq!(result["success"], false);
        assert!(result["error"].is_string());
    }

    #[tokio::test]
    async fn test_empty_arguments_treated_as_empty_object() {
        let (exec, _) = executor();
        let result = exec.execute("check_availability", "").await;
        assert_eq!(result["availableSlots"], serde_json::json!([]));
    }
}
