//! Hub-side firmware: inbound queue, device registry, pairing-accept side,
//! OTA relay, and the host link.

pub mod controller;
pub mod host_link;
pub mod ota;
pub mod pairing;
pub mod queue;
pub mod registry;

pub use controller::HubController;
pub use host_link::HostCommand;
pub use queue::{inbound_queue, QueueConsumer, QueueEntry, QueueProducer};
pub use registry::{DeviceRecord, DeviceRegistry, RegistryError};
