//! Inbound command envelope and per-command parameter validation.
//!
//! Commands arrive as opaque JSON text: `{"id": "...", "command": "...",
//! "params": {...}}`. Parsing and range validation both happen here, so a
//! malformed command is rejected before the engine sees it and without
//! touching the bus.

use std::time::Instant;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::dgt::{self, RunMode};
use crate::error::SystemErrorCode;

/// Opaque command payload as handed over by the transport, pre-parse.
/// Consumed exactly once by the orchestrator.
#[derive(Debug)]
pub struct RawCommand {
    pub json: String,
    pub received_at: Instant,
}

impl RawCommand {
    pub fn new(json: String) -> Self {
        Self {
            json,
            received_at: Instant::now(),
        }
    }
}

/// Parse/validation failure. `id` carries whatever correlation id could
/// be recovered; without one the command is dropped silently.
#[derive(Debug, PartialEq)]
pub struct CommandParseError {
    pub id: Option<String>,
    pub code: SystemErrorCode,
    pub message: String,
}

#[derive(Debug, PartialEq)]
pub struct ClockCommand {
    pub id: String,
    pub op: CommandOp,
}

#[derive(Debug, PartialEq)]
pub enum CommandOp {
    SetTime {
        left_mode: RunMode,
        left_hours: u8,
        left_minutes: u8,
        left_seconds: u8,
        right_mode: RunMode,
        right_hours: u8,
        right_minutes: u8,
        right_seconds: u8,
    },
    DisplayText {
        text: String,
        beep: u8,
        left_dots: u8,
        right_dots: u8,
    },
    EndDisplay,
    Stop,
    Run {
        left_mode: RunMode,
        right_mode: RunMode,
    },
    GetTime,
    GetStatus,
}

impl CommandOp {
    /// Everything except a status query needs a live clock connection.
    pub fn needs_clock(&self) -> bool {
        !matches!(self, CommandOp::GetStatus)
    }

    pub fn name(&self) -> &'static str {
        match self {
            CommandOp::SetTime { .. } => "setTime",
            CommandOp::DisplayText { .. } => "displayText",
            CommandOp::EndDisplay => "endDisplay",
            CommandOp::Stop => "stop",
            CommandOp::Run { .. } => "run",
            CommandOp::GetTime => "getTime",
            CommandOp::GetStatus => "getStatus",
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    id: Option<String>,
    command: Option<String>,
    #[serde(default)]
    params: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetTimeParams {
    left_mode: u8,
    left_hours: u8,
    left_minutes: u8,
    left_seconds: u8,
    right_mode: u8,
    right_hours: u8,
    right_minutes: u8,
    right_seconds: u8,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DisplayTextParams {
    text: String,
    #[serde(default)]
    beep: u8,
    #[serde(default)]
    left_dots: u8,
    #[serde(default)]
    right_dots: u8,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunParams {
    left_mode: u8,
    right_mode: u8,
}

pub fn parse_raw(raw: &RawCommand) -> Result<ClockCommand, CommandParseError> {
    let envelope: Envelope = serde_json::from_str(&raw.json).map_err(|e| CommandParseError {
        id: None,
        code: SystemErrorCode::JsonParseError,
        message: e.to_string(),
    })?;

    let (id, name) = match (envelope.id, envelope.command) {
        (Some(id), Some(name)) => (id, name),
        (id, _) => {
            return Err(CommandParseError {
                id,
                code: SystemErrorCode::InvalidCommand,
                message: "missing 'id' or 'command' field".into(),
            });
        }
    };

    let op = match name.as_str() {
        "setTime" => {
            let p: SetTimeParams = parse_params(&id, envelope.params)?;
            let left_mode = parse_mode(&id, p.left_mode)?;
            let right_mode = parse_mode(&id, p.right_mode)?;
            validate(
                &id,
                dgt::validate_time_fields(
                    p.left_hours,
                    p.left_minutes,
                    p.left_seconds,
                    p.right_hours,
                    p.right_minutes,
                    p.right_seconds,
                ),
            )?;
            CommandOp::SetTime {
                left_mode,
                left_hours: p.left_hours,
                left_minutes: p.left_minutes,
                left_seconds: p.left_seconds,
                right_mode,
                right_hours: p.right_hours,
                right_minutes: p.right_minutes,
                right_seconds: p.right_seconds,
            }
        }
        "displayText" => {
            let p: DisplayTextParams = parse_params(&id, envelope.params)?;
            validate(
                &id,
                dgt::validate_display_params(&p.text, p.beep, p.left_dots, p.right_dots),
            )?;
            CommandOp::DisplayText {
                text: p.text,
                beep: p.beep,
                left_dots: p.left_dots,
                right_dots: p.right_dots,
            }
        }
        "endDisplay" => CommandOp::EndDisplay,
        "stop" => CommandOp::Stop,
        "run" => {
            let p: RunParams = parse_params(&id, envelope.params)?;
            CommandOp::Run {
                left_mode: parse_mode(&id, p.left_mode)?,
                right_mode: parse_mode(&id, p.right_mode)?,
            }
        }
        "getTime" => CommandOp::GetTime,
        "getStatus" => CommandOp::GetStatus,
        other => {
            return Err(CommandParseError {
                id: Some(id),
                code: SystemErrorCode::InvalidCommand,
                message: format!("unknown command '{other}'"),
            });
        }
    };

    Ok(ClockCommand { id, op })
}

fn parse_params<T: DeserializeOwned>(id: &str, params: Value) -> Result<T, CommandParseError> {
    serde_json::from_value(params).map_err(|e| CommandParseError {
        id: Some(id.to_string()),
        code: SystemErrorCode::InvalidParameters,
        message: e.to_string(),
    })
}

fn parse_mode(id: &str, mode: u8) -> Result<RunMode, CommandParseError> {
    RunMode::from_u8(mode).ok_or_else(|| CommandParseError {
        id: Some(id.to_string()),
        code: SystemErrorCode::InvalidParameters,
        message: "run mode must be 0-2".into(),
    })
}

fn validate(id: &str, check: Result<(), &'static str>) -> Result<(), CommandParseError> {
    check.map_err(|msg| CommandParseError {
        id: Some(id.to_string()),
        code: SystemErrorCode::InvalidParameters,
        message: msg.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<ClockCommand, CommandParseError> {
        parse_raw(&RawCommand::new(json.to_string()))
    }

    #[test]
    fn parses_set_time() {
        let cmd = parse(
            r#"{"id":"c1","command":"setTime","params":{"leftMode":0,"leftHours":1,"leftMinutes":30,"leftSeconds":0,"rightMode":1,"rightHours":1,"rightMinutes":30,"rightSeconds":0}}"#,
        )
        .unwrap();
        assert_eq!(cmd.id, "c1");
        match cmd.op {
            CommandOp::SetTime {
                left_mode,
                right_mode,
                left_minutes,
                ..
            } => {
                assert_eq!(left_mode, RunMode::Stop);
                assert_eq!(right_mode, RunMode::CountDown);
                assert_eq!(left_minutes, 30);
            }
            other => panic!("wrong op: {other:?}"),
        }
    }

    #[test]
    fn rejects_out_of_range_hours() {
        let err = parse(
            r#"{"id":"c2","command":"setTime","params":{"leftMode":0,"leftHours":10,"leftMinutes":0,"leftSeconds":0,"rightMode":0,"rightHours":0,"rightMinutes":0,"rightSeconds":0}}"#,
        )
        .unwrap_err();
        assert_eq!(err.id.as_deref(), Some("c2"));
        assert_eq!(err.code, SystemErrorCode::InvalidParameters);
    }

    #[test]
    fn rejects_missing_params() {
        let err = parse(r#"{"id":"c3","command":"run","params":{"leftMode":1}}"#).unwrap_err();
        assert_eq!(err.code, SystemErrorCode::InvalidParameters);
    }

    #[test]
    fn rejects_unknown_command_with_id() {
        let err = parse(r#"{"id":"c4","command":"selfDestruct"}"#).unwrap_err();
        assert_eq!(err.id.as_deref(), Some("c4"));
        assert_eq!(err.code, SystemErrorCode::InvalidCommand);
    }

    #[test]
    fn bad_json_recovers_no_id() {
        let err = parse("{nope").unwrap_err();
        assert_eq!(err.id, None);
        assert_eq!(err.code, SystemErrorCode::JsonParseError);
    }

    #[test]
    fn missing_command_field_keeps_id() {
        let err = parse(r#"{"id":"c5"}"#).unwrap_err();
        assert_eq!(err.id.as_deref(), Some("c5"));
        assert_eq!(err.code, SystemErrorCode::InvalidCommand);
    }

    #[test]
    fn display_text_defaults_and_limits() {
        let cmd = parse(r#"{"id":"c6","command":"displayText","params":{"text":"hello"}}"#).unwrap();
        assert_eq!(
            cmd.op,
            CommandOp::DisplayText {
                text: "hello".into(),
                beep: 0,
                left_dots: 0,
                right_dots: 0
            }
        );

        let err = parse(
            r#"{"id":"c7","command":"displayText","params":{"text":"way too long for the display"}}"#,
        )
        .unwrap_err();
        assert_eq!(err.code, SystemErrorCode::InvalidParameters);

        let err =
            parse(r#"{"id":"c8","command":"displayText","params":{"text":"hi","beep":49}}"#)
                .unwrap_err();
        assert_eq!(err.code, SystemErrorCode::InvalidParameters);
    }

    #[test]
    fn status_query_needs_no_clock() {
        let cmd = parse(r#"{"id":"c9","command":"getStatus"}"#).unwrap();
        assert!(!cmd.op.needs_clock());
        let cmd = parse(r#"{"id":"c10","command":"getTime"}"#).unwrap();
        assert!(cmd.op.needs_clock());
    }
}
