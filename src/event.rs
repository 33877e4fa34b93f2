//! Outbound messages: domain events and command responses.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Value, json};

use crate::dgt::ClockTime;
use crate::error::SystemErrorCode;
use crate::stats::StatusSnapshot;

/// Correlation ids are caller-supplied and capped.
pub const COMMAND_ID_MAX: usize = 31;
pub const ERROR_MESSAGE_MAX: usize = 127;

/// Priority 0 jumps to the front of the event queue.
pub const PRIORITY_URGENT: u8 = 0;
pub const PRIORITY_NORMAL: u8 = 1;

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn truncated(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    TimeUpdate,
    Button,
    ConnectionStatus,
    Error,
    SystemStatus,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::TimeUpdate => "timeUpdate",
            EventKind::Button => "buttonEvent",
            EventKind::ConnectionStatus => "connectionStatus",
            EventKind::Error => "error",
            EventKind::SystemStatus => "systemStatus",
        }
    }
}

/// One outbound event. Owned by the channel between send and receive,
/// then by the transport until it is serialized and dropped.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub priority: u8,
    pub timestamp: u64,
    pub data: Value,
}

impl Event {
    fn new(kind: EventKind, priority: u8, data: Value) -> Self {
        Self {
            kind,
            priority,
            timestamp: now_millis(),
            data,
        }
    }

    pub fn time_update(t: &ClockTime) -> Self {
        Self::new(
            EventKind::TimeUpdate,
            PRIORITY_NORMAL,
            json!({
                "leftHours": t.left_hours,
                "leftMinutes": t.left_minutes,
                "leftSeconds": t.left_seconds,
                "rightHours": t.right_hours,
                "rightMinutes": t.right_minutes,
                "rightSeconds": t.right_seconds,
            }),
        )
    }

    pub fn button(name: &str, code: u8, repeat_count: Option<u32>) -> Self {
        let mut data = json!({
            "button": name,
            "buttonCode": code,
            "isRepeat": repeat_count.is_some(),
        });
        if let Some(count) = repeat_count {
            data["repeatCount"] = json!(count);
        }
        Self::new(EventKind::Button, PRIORITY_URGENT, data)
    }

    pub fn connection_status(connected: bool, configured: bool) -> Self {
        Self::new(
            EventKind::ConnectionStatus,
            PRIORITY_URGENT,
            json!({ "connected": connected, "configured": configured }),
        )
    }

    pub fn error(code: SystemErrorCode, message: &str) -> Self {
        Self::new(
            EventKind::Error,
            PRIORITY_URGENT,
            json!({
                "errorCode": code.code(),
                "errorMessage": truncated(message, ERROR_MESSAGE_MAX),
            }),
        )
    }

    pub fn system_status(snapshot: &StatusSnapshot) -> Self {
        let data = serde_json::to_value(snapshot).unwrap_or(Value::Null);
        Self::new(EventKind::SystemStatus, PRIORITY_NORMAL, data)
    }

    /// Wire form pushed to the transport.
    pub fn to_json(&self) -> String {
        json!({
            "type": self.kind.as_str(),
            "timestamp": self.timestamp,
            "data": self.data,
        })
        .to_string()
    }
}

#[derive(Debug, Clone)]
pub struct ResponseError {
    pub code: SystemErrorCode,
    pub message: String,
}

/// Exactly one response per inbound command, at most once.
#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub id: String,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<ResponseError>,
    pub timestamp: u64,
}

impl CommandResponse {
    pub fn ok(id: &str, result: Value) -> Self {
        Self {
            id: truncated(id, COMMAND_ID_MAX),
            success: true,
            result: Some(result),
            error: None,
            timestamp: now_millis(),
        }
    }

    pub fn err(id: &str, code: SystemErrorCode, message: &str) -> Self {
        Self {
            id: truncated(id, COMMAND_ID_MAX),
            success: false,
            result: None,
            error: Some(ResponseError {
                code,
                message: truncated(message, ERROR_MESSAGE_MAX),
            }),
            timestamp: now_millis(),
        }
    }

    pub fn to_json(&self) -> String {
        let mut doc = json!({
            "type": "command_response",
            "id": self.id,
            "status": if self.success { "success" } else { "error" },
        });
        if let Some(result) = &self.result {
            doc["result"] = result.clone();
        }
        if let Some(err) = &self.error {
            doc["data"] = json!({
                "errorCode": err.code.code(),
                "errorMessage": err.message,
            });
        }
        doc.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_shape() {
        let t = ClockTime {
            left_hours: 1,
            left_minutes: 2,
            left_seconds: 3,
            right_hours: 4,
            right_minutes: 5,
            right_seconds: 6,
        };
        let event = Event::time_update(&t);
        assert_eq!(event.priority, PRIORITY_NORMAL);
        let doc: Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(doc["type"], "timeUpdate");
        assert_eq!(doc["data"]["rightSeconds"], 6);
    }

    #[test]
    fn button_repeat_payload() {
        let event = Event::button("plus", 0x08, Some(3));
        assert_eq!(event.priority, PRIORITY_URGENT);
        assert_eq!(event.data["isRepeat"], true);
        assert_eq!(event.data["repeatCount"], 3);

        let discrete = Event::button("back", 0x01, None);
        assert_eq!(discrete.data["isRepeat"], false);
        assert!(discrete.data.get("repeatCount").is_none());
    }

    #[test]
    fn response_is_result_xor_error() {
        let ok = CommandResponse::ok("cmd-1", json!({"status": "done"}));
        assert!(ok.result.is_some() && ok.error.is_none());

        let err = CommandResponse::err("cmd-2", SystemErrorCode::CommandTimeout, "no ack");
        assert!(err.result.is_none() && err.error.is_some());
        let doc: Value = serde_json::from_str(&err.to_json()).unwrap();
        assert_eq!(doc["status"], "error");
        assert_eq!(doc["data"]["errorCode"], 300);
    }

    #[test]
    fn id_and_message_are_capped() {
        let long_id = "x".repeat(64);
        let long_msg = "y".repeat(500);
        let resp = CommandResponse::err(&long_id, SystemErrorCode::Unknown, &long_msg);
        assert_eq!(resp.id.len(), COMMAND_ID_MAX);
        assert_eq!(resp.error.unwrap().message.len(), ERROR_MESSAGE_MAX);
    }
}
