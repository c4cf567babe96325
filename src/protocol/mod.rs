//! Shared wire protocol between hub, nodes, and the host orchestrator.
//!
//! Three message families share the radio link:
//! - JSON payloads (events, replies, OTA/CONFIG commands and statuses)
//! - plain pairing tokens (`claim-me:<id>` and the fixed accept token)
//! - raw legacy OTA chunk bytes
//!
//! Everything here is platform-independent and host-testable.

pub mod constants;
pub mod messages;

pub use constants::*;
pub use messages::{
    claim_token, ConfigCommand, ConfigStatus, DirectReply, EventFrame, OtaCommand, OtaStatus,
    ProtocolError, RadioMessage,
};
