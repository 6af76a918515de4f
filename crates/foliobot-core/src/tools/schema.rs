//! JSON-schema tool definitions attached to the realtime session.

use serde_json::{json, Value};

pub fn check_availability_tool() -> Value {
    json!({
        "type": "function",
        "name": "check_availability",
        "description": "Check available meeting slots for a specific date and timezone.",
        "parameters": {
            "type": "object",
            "properties": {
                "date": {
                    "type": "string",
                    "description": "The date to check in YYYY-MM-DD format (e.g. '2025-12-03')."
                },
                "timezone": {
                    "type": "string",
                    "description": "IANA timezone identifier (e.g. 'America/New_York')."
                }
            },
            "required": ["date", "timezone"]
        }
    })
}

pub fn book_meeting_tool() -> Value {
    json!({
        "type": "function",
        "name": "book_meeting",
        "description": "Book a meeting on the calendar. IMPORTANT: Before calling this function, you must first ask the user for their name, email, and a description of the meeting (including purpose, attendees, and agenda). Only call this function once you have collected all required information: date, time, timezone, name, email, and description.",
        "parameters": {
            "type": "object",
            "properties": {
                "selectedDate": {
                    "type": "string",
                    "description": "The date for the meeting in YYYY-MM-DD format."
                },
                "selectedTime": {
                    "type": "string",
                    "description": "The start time in HH:MM 24-hour format in the user's timezone."
                },
                "timezone": {
                    "type": "string",
                    "description": "IANA timezone for the attendee, e.g. 'America/New_York'."
                },
                "name": {
                    "type": "string",
                    "description": "Name of the attendee to appear on the booking."
                },
                "email": {
                    "type": "string",
                    "description": "Email of the attendee for the calendar invite."
                },
                "descriptionOfMeeting": {
                    "type": "string",
                    "description": "A description of the meeting, including the purpose, the attendees, and the agenda."
                }
            },
            "required": [
                "selectedDate",
                "selectedTime",
                "timezone",
                "name",
                "email",
                "descriptionOfMeeting"
            ]
        }
    })
}

/// The tools attached to every realtime session.
pub fn realtime_tools() -> Vec<Value> {
    vec![check_availability_tool(), book_meeting_tool()]
}
