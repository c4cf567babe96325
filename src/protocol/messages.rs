//! Radio and host-link message shapes.
//!
//! The JSON shapes mirror the original wire contract exactly: handlers are
//! selected by which key is present (`OTA_CMD`, `OTA`, `CONFIG_CMD`,
//! `CONFIG`, `Ans`, `c`), not by a type tag. Key events are framed two ways:
//!
//! - pre-session: `{"Did":<stable_id>,"Ans":"<key>"}`
//! - in-session:  `{"Id":<session_id>,"Ans":"<key>"}` (no `Did`)
//!
//! Pairing uses plain tokens instead of JSON, and legacy OTA chunks are raw
//! bytes, so [`RadioMessage::parse`] classifies all three families.

use crate::protocol::constants::{ACCEPT_TOKEN, CLAIM_PREFIX, RADIO_MTU, RESEND_TOKEN};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Errors produced while parsing or building wire messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Payload is empty.
    EmptyPayload,
    /// Payload exceeds the radio MTU.
    PayloadTooLarge { len: usize, max: usize },
    /// Payload looked like JSON but did not parse, or a recognized shape
    /// was missing a required field.
    MalformedPayload(String),
    /// A claim token carried a bad stable id.
    InvalidClaim(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyPayload => write!(f, "empty payload"),
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload too large: {} bytes (max {})", len, max)
            }
            Self::MalformedPayload(msg) => write!(f, "malformed payload: {}", msg),
            Self::InvalidClaim(tok) => write!(f, "invalid claim token: {}", tok),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// A key-press event, framed for the radio link.
///
/// Nodes switch from pre-session to in-session framing once the orchestrator
/// assigns a session id through a direct reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFrame {
    /// No session assigned yet; the node identifies by stable id.
    PreSession { stable_id: u32, key: char },
    /// Session assigned; the stable id is omitted.
    InSession { session_id: u32, key: char },
}

impl EventFrame {
    /// The key character carried by this event.
    pub fn key(&self) -> char {
        match self {
            Self::PreSession { key, .. } | Self::InSession { key, .. } => *key,
        }
    }

    /// Encode to the JSON wire form.
    pub fn encode(&self) -> String {
        match self {
            Self::PreSession { stable_id, key } => {
                json!({ "Did": stable_id, "Ans": key.to_string() }).to_string()
            }
            Self::InSession { session_id, key } => {
                json!({ "Id": session_id, "Ans": key.to_string() }).to_string()
            }
        }
    }

    /// Decode from a parsed JSON value carrying an `Ans` key.
    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let key = value
            .get("Ans")
            .and_then(Value::as_str)
            .and_then(|s| s.chars().next())
            .ok_or_else(|| ProtocolError::MalformedPayload("missing Ans".into()))?;

        if let Some(session_id) = value.get("Id").and_then(Value::as_u64) {
            return Ok(Self::InSession {
                session_id: session_id as u32,
                key,
            });
        }
        if let Some(stable_id) = value.get("Did").and_then(Value::as_u64) {
            return Ok(Self::PreSession {
                stable_id: stable_id as u32,
                key,
            });
        }
        Err(ProtocolError::MalformedPayload(
            "event carries neither Id nor Did".into(),
        ))
    }
}

/// OTA command from the host, forwarded verbatim to the target node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaCommand {
    /// Command action, e.g. `WIFI_UPDATE`.
    #[serde(rename = "OTA_CMD")]
    pub action: String,
    /// Target node stable id.
    #[serde(rename = "Did")]
    pub device_id: u32,
    /// Firmware URL for the network-fetch transport.
    #[serde(rename = "URL", skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// CONFIG command from the host, forwarded verbatim to the target node.
///
/// The shape is flat on the wire; which optional fields are required depends
/// on the action (`SET_DEVICE_ID`, `SET_GPIO_CONFIG`, `SET_WIFI_CONFIG`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigCommand {
    #[serde(rename = "CONFIG_CMD")]
    pub action: String,
    /// Target node stable id.
    #[serde(rename = "Did")]
    pub device_id: u32,
    /// New stable id (`SET_DEVICE_ID`).
    #[serde(rename = "DeviceId", skip_serializing_if = "Option::is_none")]
    pub new_device_id: Option<u32>,
    #[serde(rename = "RedPin", skip_serializing_if = "Option::is_none")]
    pub red_pin: Option<u8>,
    #[serde(rename = "GreenPin", skip_serializing_if = "Option::is_none")]
    pub green_pin: Option<u8>,
    #[serde(rename = "YellowPin", skip_serializing_if = "Option::is_none")]
    pub yellow_pin: Option<u8>,
    #[serde(rename = "ButtonA", skip_serializing_if = "Option::is_none")]
    pub button_a: Option<u8>,
    #[serde(rename = "ButtonB", skip_serializing_if = "Option::is_none")]
    pub button_b: Option<u8>,
    #[serde(rename = "ButtonC", skip_serializing_if = "Option::is_none")]
    pub button_c: Option<u8>,
    #[serde(rename = "ButtonD", skip_serializing_if = "Option::is_none")]
    pub button_d: Option<u8>,
    /// Wireless SSID (`SET_WIFI_CONFIG`).
    #[serde(rename = "SSID", skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
    /// Wireless secret (`SET_WIFI_CONFIG`).
    #[serde(rename = "Password", skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Direct reply routed from the host back to a node.
///
/// Routed preferring the terminal (external) id, falling back to the stable
/// id when the terminal id is not yet on file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectReply {
    /// Terminal id assigned by the orchestrator (becomes the node session id).
    #[serde(rename = "Id")]
    pub terminal_id: u32,
    /// Response code.
    #[serde(rename = "c")]
    pub code: i64,
    /// Stable id fallback for routing.
    #[serde(rename = "Did", skip_serializing_if = "Option::is_none")]
    pub device_id: Option<u32>,
}

/// OTA status report from a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaStatus {
    #[serde(rename = "Did")]
    pub device_id: u32,
    /// Status token, e.g. `OTA_SUCCESS`.
    #[serde(rename = "OTA")]
    pub status: String,
    #[serde(rename = "Msg", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OtaStatus {
    pub fn new(device_id: u32, status: &str) -> Self {
        Self {
            device_id,
            status: status.to_string(),
            message: None,
        }
    }

    pub fn with_message(device_id: u32, status: &str, message: impl Into<String>) -> Self {
        Self {
            device_id,
            status: status.to_string(),
            message: Some(message.into()),
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("OTA status serialization cannot fail")
    }
}

/// CONFIG status report from a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigStatus {
    #[serde(rename = "Did")]
    pub device_id: u32,
    /// Status token, e.g. `GPIO_OK`.
    #[serde(rename = "CONFIG")]
    pub status: String,
}

impl ConfigStatus {
    pub fn new(device_id: u32, status: &str) -> Self {
        Self {
            device_id,
            status: status.to_string(),
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("CONFIG status serialization cannot fail")
    }
}

/// A classified radio datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioMessage {
    /// Pairing claim broadcast from a node.
    Claim { stable_id: u32 },
    /// Fixed pairing accept token from a hub.
    Accept,
    /// Request to resend the last event.
    ResendRequest,
    /// Key-press event from a node.
    Event(EventFrame),
    /// OTA command relayed hub -> node.
    OtaCommand(OtaCommand),
    /// CONFIG command relayed hub -> node.
    ConfigCommand(ConfigCommand),
    /// Direct reply relayed hub -> node.
    Reply(DirectReply),
    /// OTA status from a node.
    OtaStatus(OtaStatus),
    /// CONFIG status from a node.
    ConfigStatus(ConfigStatus),
    /// Structurally valid JSON of no recognized shape; the hub forwards it
    /// verbatim upstream.
    Json(Value),
    /// Raw bytes: a legacy OTA firmware chunk.
    Raw(Vec<u8>),
}

impl RadioMessage {
    /// Classify a raw radio payload.
    ///
    /// JSON payloads are dispatched by key presence; text payloads are
    /// matched against the pairing and resend tokens; anything else is a
    /// raw legacy chunk. A payload that starts with `{` but fails to parse
    /// is malformed (the hub answers it with a resend request).
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.is_empty() {
            return Err(ProtocolError::EmptyPayload);
        }
        if payload.len() > RADIO_MTU {
            return Err(ProtocolError::PayloadTooLarge {
                len: payload.len(),
                max: RADIO_MTU,
            });
        }

        if payload[0] == b'{' {
            let value: Value = serde_json::from_slice(payload)
                .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;
            return Self::classify_json(value);
        }

        if let Ok(text) = std::str::from_utf8(payload) {
            let text = text.trim();
            if let Some(id) = text.strip_prefix(CLAIM_PREFIX) {
                let stable_id = id
                    .parse::<u32>()
                    .map_err(|_| ProtocolError::InvalidClaim(text.to_string()))?;
                return Ok(Self::Claim { stable_id });
            }
            if text == ACCEPT_TOKEN {
                return Ok(Self::Accept);
            }
            if text == RESEND_TOKEN {
                return Ok(Self::ResendRequest);
            }
        }

        Ok(Self::Raw(payload.to_vec()))
    }

    fn classify_json(value: Value) -> Result<Self, ProtocolError> {
        let malformed = |e: serde_json::Error| ProtocolError::MalformedPayload(e.to_string());

        if value.get("OTA_CMD").is_some() {
            return Ok(Self::OtaCommand(
                serde_json::from_value(value).map_err(malformed)?,
            ));
        }
        if value.get("CONFIG_CMD").is_some() {
            return Ok(Self::ConfigCommand(
                serde_json::from_value(value).map_err(malformed)?,
            ));
        }
        if value.get("OTA").is_some() {
            return Ok(Self::OtaStatus(
                serde_json::from_value(value).map_err(malformed)?,
            ));
        }
        if value.get("CONFIG").is_some() {
            return Ok(Self::ConfigStatus(
                serde_json::from_value(value).map_err(malformed)?,
            ));
        }
        if value.get("Ans").is_some() {
            return Ok(Self::Event(EventFrame::from_value(&value)?));
        }
        if value.get("c").is_some() {
            return Ok(Self::Reply(
                serde_json::from_value(value).map_err(malformed)?,
            ));
        }
        Ok(Self::Json(value))
    }
}

/// Build a claim broadcast token for the given stable id.
pub fn claim_token(stable_id: u32) -> String {
    format!("{}{}", CLAIM_PREFIX, stable_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Event framing ====================

    #[test]
    fn test_pre_session_event_round_trip() {
        let frame = EventFrame::PreSession {
            stable_id: 5,
            key: 'A',
        };
        let encoded = frame.encode();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["Did"], 5);
        assert_eq!(value["Ans"], "A");
        assert!(value.get("Id").is_none());

        match RadioMessage::parse(encoded.as_bytes()).unwrap() {
            RadioMessage::Event(decoded) => assert_eq!(decoded, frame),
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_in_session_event_omits_stable_id() {
        let frame = EventFrame::InSession {
            session_id: 42,
            key: 'A',
        };
        let encoded = frame.encode();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["Id"], 42);
        assert_eq!(value["Ans"], "A");
        assert!(value.get("Did").is_none());
    }

    #[test]
    fn test_event_without_identity_is_malformed() {
        let result = RadioMessage::parse(br#"{"Ans":"B"}"#);
        assert!(matches!(result, Err(ProtocolError::MalformedPayload(_))));
    }

    #[test]
    fn test_session_framing_takes_precedence() {
        // A frame carrying both identities decodes as in-session.
        let msg = RadioMessage::parse(br#"{"Id":9,"Did":7,"Ans":"C"}"#).unwrap();
        assert_eq!(
            msg,
            RadioMessage::Event(EventFrame::InSession {
                session_id: 9,
                key: 'C'
            })
        );
    }

    // ==================== Token classification ====================

    #[test]
    fn test_claim_token_round_trip() {
        let token = claim_token(1234);
        assert_eq!(token, "claim-me:1234");
        assert_eq!(
            RadioMessage::parse(token.as_bytes()).unwrap(),
            RadioMessage::Claim { stable_id: 1234 }
        );
    }

    #[test]
    fn test_claim_with_garbage_id_is_invalid() {
        let result = RadioMessage::parse(b"claim-me:bogus");
        assert!(matches!(result, Err(ProtocolError::InvalidClaim(_))));
    }

    #[test]
    fn test_accept_and_resend_tokens() {
        assert_eq!(
            RadioMessage::parse(ACCEPT_TOKEN.as_bytes()).unwrap(),
            RadioMessage::Accept
        );
        assert_eq!(
            RadioMessage::parse(RESEND_TOKEN.as_bytes()).unwrap(),
            RadioMessage::ResendRequest
        );
    }

    // ==================== JSON dispatch ====================

    #[test]
    fn test_ota_command_shape() {
        let line = r#"{"OTA_CMD":"WIFI_UPDATE","Did":7,"URL":"http://example/fw.bin"}"#;
        match RadioMessage::parse(line.as_bytes()).unwrap() {
            RadioMessage::OtaCommand(cmd) => {
                assert_eq!(cmd.action, "WIFI_UPDATE");
                assert_eq!(cmd.device_id, 7);
                assert_eq!(cmd.url.as_deref(), Some("http://example/fw.bin"));
            }
            other => panic!("expected OTA command, got {:?}", other),
        }
    }

    #[test]
    fn test_config_command_shape() {
        let line = r#"{"CONFIG_CMD":"SET_DEVICE_ID","Did":7,"DeviceId":9}"#;
        match RadioMessage::parse(line.as_bytes()).unwrap() {
            RadioMessage::ConfigCommand(cmd) => {
                assert_eq!(cmd.action, "SET_DEVICE_ID");
                assert_eq!(cmd.new_device_id, Some(9));
            }
            other => panic!("expected CONFIG command, got {:?}", other),
        }
    }

    #[test]
    fn test_ota_status_shape() {
        let status = OtaStatus::with_message(3, "OTA_ERROR", "connect timeout");
        let encoded = status.encode();
        match RadioMessage::parse(encoded.as_bytes()).unwrap() {
            RadioMessage::OtaStatus(decoded) => assert_eq!(decoded, status),
            other => panic!("expected OTA status, got {:?}", other),
        }
    }

    #[test]
    fn test_direct_reply_shape() {
        let msg = RadioMessage::parse(br#"{"Id":12,"c":200,"Did":7}"#).unwrap();
        assert_eq!(
            msg,
            RadioMessage::Reply(DirectReply {
                terminal_id: 12,
                code: 200,
                device_id: Some(7),
            })
        );
    }

    #[test]
    fn test_unrecognized_json_is_forwardable() {
        let msg = RadioMessage::parse(br#"{"Battery":87,"Did":4}"#).unwrap();
        assert!(matches!(msg, RadioMessage::Json(_)));
    }

    // ==================== Malformed and raw payloads ====================

    #[test]
    fn test_truncated_json_is_malformed() {
        let result = RadioMessage::parse(br#"{"Did":5,"Ans""#);
        assert!(matches!(result, Err(ProtocolError::MalformedPayload(_))));
    }

    #[test]
    fn test_binary_payload_is_raw_chunk() {
        let chunk = [0xE9u8, 0x00, 0x12, 0xFF, 0x80];
        assert_eq!(
            RadioMessage::parse(&chunk).unwrap(),
            RadioMessage::Raw(chunk.to_vec())
        );
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert_eq!(
            RadioMessage::parse(&[]).unwrap_err(),
            ProtocolError::EmptyPayload
        );
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let payload = vec![0u8; RADIO_MTU + 1];
        assert!(matches!(
            RadioMessage::parse(&payload),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }
}
