//! The radio driver contract.

use crate::protocol::constants::{MAX_RADIO_PEERS, RADIO_MTU};
use std::fmt;

/// Six-byte radio (MAC) address identifying a device on the link.
pub type RadioAddress = [u8; 6];

/// The link-layer broadcast address.
pub const BROADCAST_ADDRESS: RadioAddress = [0xFF; 6];

/// Format an address for logging, `AA:BB:CC:DD:EE:FF` style.
pub fn format_address(addr: &RadioAddress) -> String {
    addr.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Errors surfaced by a radio driver.
///
/// `Ok` from [`RadioLink::send`] means only that the driver accepted the
/// datagram; there is no delivery acknowledgment at this layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    /// Payload exceeds the link MTU.
    PayloadTooLarge { len: usize, max: usize },
    /// The driver's peer table is full.
    PeerTableFull { max: usize },
    /// Unicast destination is not in the peer list.
    UnknownPeer(RadioAddress),
    /// Driver-level send failure.
    Driver(String),
}

impl fmt::Display for RadioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload too large: {} bytes (max {})", len, max)
            }
            Self::PeerTableFull { max } => write!(f, "peer table full (max {})", max),
            Self::UnknownPeer(addr) => write!(f, "unknown peer: {}", format_address(addr)),
            Self::Driver(msg) => write!(f, "driver error: {}", msg),
        }
    }
}

impl std::error::Error for RadioError {}

/// Contract of the connectionless peer-to-peer radio driver.
///
/// Unicast requires the destination in the peer list; broadcast does not.
/// Reception is out of band: the hub wires the driver's receive callback to
/// its inbound queue, the node polls its driver between loop iterations.
pub trait RadioLink {
    /// This device's own link address.
    fn local_address(&self) -> RadioAddress;

    /// Add a peer to the driver's peer table. Adding an existing peer is a
    /// no-op.
    fn add_peer(&mut self, addr: RadioAddress) -> Result<(), RadioError>;

    /// Whether the address is already in the peer table.
    fn has_peer(&self, addr: &RadioAddress) -> bool;

    /// Fire-and-forget send. `Ok` means accepted by the driver only.
    fn send(&mut self, dest: RadioAddress, payload: &[u8]) -> Result<(), RadioError>;
}

/// Validate a payload against the link MTU. Shared by driver impls.
pub(crate) fn check_payload(payload: &[u8]) -> Result<(), RadioError> {
    if payload.len() > RADIO_MTU {
        return Err(RadioError::PayloadTooLarge {
            len: payload.len(),
            max: RADIO_MTU,
        });
    }
    Ok(())
}

/// Validate peer-table headroom. Shared by driver impls.
pub(crate) fn check_peer_capacity(current: usize) -> Result<(), RadioError> {
    if current >= MAX_RADIO_PEERS {
        return Err(RadioError::PeerTableFull {
            max: MAX_RADIO_PEERS,
        });
    }
    Ok(())
}
