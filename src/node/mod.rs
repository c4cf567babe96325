//! Node-side firmware: durable configuration, pairing claim, debounced
//! delivery with retry, OTA apply, and the power manager.

pub mod config_store;
pub mod controller;
pub mod delivery;
pub mod ota;
pub mod pairing;
pub mod power;

pub use config_store::{ConfigStore, NodeConfig, OtaResume, PinMap, StoreError, WirelessCredentials};
pub use controller::NodeController;
