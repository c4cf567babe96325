//! Connectionless peer-to-peer radio link abstraction.
//!
//! The real transport is an ESP-NOW-style driver: ≤250-byte datagrams, an
//! explicit peer list, fire-and-forget sends whose only feedback is
//! "accepted by driver". The [`RadioLink`] trait captures exactly that
//! contract so every state machine in this crate is host-testable; the
//! loopback and UDP implementations stand in for the driver off-device.

pub mod link;
pub mod loopback;
pub mod udp;

pub use link::{format_address, RadioAddress, RadioError, RadioLink, BROADCAST_ADDRESS};
pub use loopback::{LoopbackBus, LoopbackRadio};
pub use udp::UdpRadio;
