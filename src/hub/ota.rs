//! Hub side of the OTA subsystem: command relay and session bookkeeping.
//!
//! The hub does not interpret firmware. For the network-fetch transport it
//! forwards the host's `OTA_CMD` line verbatim to the target node; for the
//! legacy chunked transport it hex-decodes each `OTA_DATA` chunk and relays
//! the raw bytes. Session state lives in the registry
//! ([`DeviceRegistry::begin_ota`](crate::hub::registry::DeviceRegistry::begin_ota)
//! and friends); this module decides which status tokens open, confirm, and
//! close a session, and builds the timeout notice.

use crate::protocol::constants::{
    OTA_STATUS_ABORT, OTA_STATUS_ERROR, OTA_STATUS_READY, OTA_STATUS_REJECT, OTA_STATUS_SUCCESS,
    OTA_STATUS_TIMEOUT, RADIO_MTU,
};
use crate::protocol::OtaStatus;
use std::fmt;

/// Message placed in the hub-side timeout notice. The orchestrator calls the
/// hub the "mother"; the wording is part of the wire contract.
const TIMEOUT_MESSAGE: &str = "Mother timeout";

/// Errors in the legacy chunk relay path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaRelayError {
    /// The hex string did not decode.
    BadChunk(String),
    /// The decoded chunk exceeds the radio MTU.
    ChunkTooLarge { len: usize, max: usize },
}

impl fmt::Display for OtaRelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadChunk(msg) => write!(f, "bad OTA chunk: {}", msg),
            Self::ChunkTooLarge { len, max } => {
                write!(f, "OTA chunk too large: {} bytes (max {})", len, max)
            }
        }
    }
}

impl std::error::Error for OtaRelayError {}

/// Effect a node's OTA status token has on the hub's session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEffect {
    /// `OTA_READY`: the node entered its update path; the session the hub
    /// opened when it forwarded the command is confirmed.
    Confirm,
    /// Terminal outcome (success, error, abort, reject): close the session.
    Close,
    /// Progress report; no bookkeeping change.
    Progress,
}

/// Classify a status token's effect on the session record.
pub fn session_effect(status: &str) -> SessionEffect {
    match status {
        OTA_STATUS_READY => SessionEffect::Confirm,
        OTA_STATUS_SUCCESS | OTA_STATUS_ERROR | OTA_STATUS_ABORT | OTA_STATUS_REJECT => {
            SessionEffect::Close
        }
        _ => SessionEffect::Progress,
    }
}

/// Decode one legacy `OTA_DATA` hex chunk into the raw bytes relayed to the
/// node's flashing routine.
pub fn decode_legacy_chunk(hex_chunk: &str) -> Result<Vec<u8>, OtaRelayError> {
    let bytes = hex::decode(hex_chunk.trim()).map_err(|e| OtaRelayError::BadChunk(e.to_string()))?;
    if bytes.len() > RADIO_MTU {
        return Err(OtaRelayError::ChunkTooLarge {
            len: bytes.len(),
            max: RADIO_MTU,
        });
    }
    Ok(bytes)
}

/// Build the upstream notice for a timed-out OTA session.
pub fn timeout_notice(stable_id: u32) -> String {
    OtaStatus::with_message(stable_id, OTA_STATUS_TIMEOUT, TIMEOUT_MESSAGE).encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::{OTA_STATUS_DOWNLOADING, OTA_STATUS_FLASHING};
    use serde_json::Value;

    // ==================== Status classification ====================

    #[test]
    fn test_ready_confirms_session() {
        assert_eq!(session_effect(OTA_STATUS_READY), SessionEffect::Confirm);
    }

    #[test]
    fn test_terminal_statuses_close_session() {
        for status in [
            OTA_STATUS_SUCCESS,
            OTA_STATUS_ERROR,
            OTA_STATUS_ABORT,
            OTA_STATUS_REJECT,
        ] {
            assert_eq!(session_effect(status), SessionEffect::Close, "{}", status);
        }
    }

    #[test]
    fn test_progress_statuses_leave_session_open() {
        for status in [OTA_STATUS_DOWNLOADING, OTA_STATUS_FLASHING, "OTA_STARTING"] {
            assert_eq!(session_effect(status), SessionEffect::Progress, "{}", status);
        }
    }

    // ==================== Legacy chunk decode ====================

    #[test]
    fn test_chunk_round_trip() {
        let raw = [0xE9u8, 0x00, 0x12, 0xFF];
        let encoded = hex::encode(raw);
        assert_eq!(decode_legacy_chunk(&encoded).unwrap(), raw);
    }

    #[test]
    fn test_bad_hex_rejected() {
        assert!(matches!(
            decode_legacy_chunk("zz00"),
            Err(OtaRelayError::BadChunk(_))
        ));
        assert!(matches!(
            decode_legacy_chunk("abc"),
            Err(OtaRelayError::BadChunk(_))
        ));
    }

    #[test]
    fn test_oversized_chunk_rejected() {
        let oversized = hex::encode(vec![0u8; RADIO_MTU + 1]);
        assert!(matches!(
            decode_legacy_chunk(&oversized),
            Err(OtaRelayError::ChunkTooLarge { .. })
        ));
    }

    #[test]
    fn test_mtu_sized_chunk_accepted() {
        let exact = hex::encode(vec![0u8; RADIO_MTU]);
        assert_eq!(decode_legacy_chunk(&exact).unwrap().len(), RADIO_MTU);
    }

    // ==================== Timeout notice ====================

    #[test]
    fn test_timeout_notice_shape() {
        let notice = timeout_notice(7);
        let value: Value = serde_json::from_str(&notice).unwrap();
        assert_eq!(value["Did"], 7);
        assert_eq!(value["OTA"], "OTA_TIMEOUT");
        assert_eq!(value["Msg"], "Mother timeout");
    }
}
