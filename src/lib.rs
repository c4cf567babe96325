//! Keypad-mesh control firmware library.
//!
//! This library contains the platform-independent control core for a small
//! wireless keypad/buzzer mesh: one hub aggregating many battery-powered
//! nodes over a connectionless peer-to-peer radio link. Everything here is
//! testable on the host machine without hardware; the radio driver, flash
//! writer, and status lights sit behind traits with loopback and file-backed
//! implementations.

pub mod hub;
pub mod node;
pub mod protocol;
pub mod radio;

// Re-export commonly used items
pub use hub::{HubController, HostCommand};
pub use node::{ConfigStore, NodeConfig, NodeController};
pub use protocol::{EventFrame, ProtocolError, RadioMessage};
pub use radio::{LoopbackBus, RadioAddress, RadioError, RadioLink, UdpRadio};
