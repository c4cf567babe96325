//! Host link: parsing the orchestrator's line-oriented command stream.
//!
//! Each line is either JSON (dispatched by key presence, same convention as
//! the radio side) or a bare pairing answer. The hub forwards relayed shapes
//! verbatim, so the JSON variants carry the original line alongside the
//! parsed form.

use crate::protocol::{ConfigCommand, DirectReply, OtaCommand};
use serde_json::Value;
use std::fmt;

/// Errors from host line parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostLinkError {
    /// Line started with `{` but did not parse as JSON, or a recognized
    /// shape was missing a required field.
    MalformedLine(String),
    /// Valid JSON matching none of the known command shapes.
    UnrecognizedCommand(String),
}

impl fmt::Display for HostLinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedLine(msg) => write!(f, "malformed host line: {}", msg),
            Self::UnrecognizedCommand(line) => write!(f, "unrecognized host command: {}", line),
        }
    }
}

impl std::error::Error for HostLinkError {}

/// A parsed host -> hub line.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    /// `OTA_CMD`: network-fetch update order, relayed verbatim.
    OtaUpdate { command: OtaCommand, raw: String },
    /// `OTA_DATA`: one hex-encoded legacy firmware chunk.
    OtaChunk { device_id: u32, chunk: String },
    /// `CONFIG_CMD`: node configuration order, relayed verbatim.
    Config { command: ConfigCommand, raw: String },
    /// `Id`/`c` direct reply, routed by terminal id with stable-id fallback.
    Reply { reply: DirectReply, raw: String },
    /// `UpdateTerminal`: hub-local terminal-id reassignment.
    UpdateTerminal {
        device_id: u32,
        new_terminal_id: u32,
    },
    /// `{"Debug":…}`: toggle verbose logging at runtime.
    DebugToggle(bool),
    /// Any non-JSON line; meaningful only while a pairing prompt is open.
    PairingAnswer(String),
}

impl HostCommand {
    /// Parse one host line.
    pub fn parse(line: &str) -> Result<Self, HostLinkError> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return Ok(Self::PairingAnswer(trimmed.to_string()));
        }

        let value: Value = serde_json::from_str(trimmed)
            .map_err(|e| HostLinkError::MalformedLine(e.to_string()))?;
        let malformed = |e: serde_json::Error| HostLinkError::MalformedLine(e.to_string());

        if value.get("OTA_CMD").is_some() {
            return Ok(Self::OtaUpdate {
                command: serde_json::from_value(value).map_err(malformed)?,
                raw: trimmed.to_string(),
            });
        }
        if let Some(chunk) = value.get("OTA_DATA").and_then(Value::as_str) {
            let device_id = require_u32(&value, "Did")?;
            return Ok(Self::OtaChunk {
                device_id,
                chunk: chunk.to_string(),
            });
        }
        if value.get("CONFIG_CMD").is_some() {
            return Ok(Self::Config {
                command: serde_json::from_value(value).map_err(malformed)?,
                raw: trimmed.to_string(),
            });
        }
        if value.get("UpdateTerminal").is_some() {
            return Ok(Self::UpdateTerminal {
                device_id: require_u32(&value, "DeviceId")?,
                new_terminal_id: require_u32(&value, "NewTerminalId")?,
            });
        }
        if let Some(enabled) = value.get("Debug").and_then(Value::as_bool) {
            return Ok(Self::DebugToggle(enabled));
        }
        if value.get("c").is_some() {
            return Ok(Self::Reply {
                reply: serde_json::from_value(value).map_err(malformed)?,
                raw: trimmed.to_string(),
            });
        }

        Err(HostLinkError::UnrecognizedCommand(trimmed.to_string()))
    }
}

fn require_u32(value: &Value, key: &str) -> Result<u32, HostLinkError> {
    value
        .get(key)
        .and_then(Value::as_u64)
        .map(|v| v as u32)
        .ok_or_else(|| HostLinkError::MalformedLine(format!("missing {}", key)))
}
