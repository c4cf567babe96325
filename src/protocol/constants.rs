//! Protocol constants and shared timing parameters.
//!
//! Wire tokens must match the host orchestrator byte-for-byte; it selects
//! handlers by key presence and greps for the pairing prompt lines, so none
//! of these are free to change independently.

use std::time::Duration;

/// Maximum raw radio datagram size (ESP-NOW payload limit).
pub const RADIO_MTU: usize = 250;

/// Maximum peers the radio driver can hold (ESP-NOW peer table limit).
pub const MAX_RADIO_PEERS: usize = 20;

/// Capacity of the hub's inbound packet queue.
pub const INBOUND_QUEUE_CAPACITY: usize = 20;

/// Maximum device records the hub registry will hold.
pub const REGISTRY_CAPACITY: usize = 30;

/// Prefix of the pairing claim broadcast: `claim-me:<stable_id>`.
pub const CLAIM_PREFIX: &str = "claim-me:";

/// Fixed pairing accept token sent by the hub to the claimant.
pub const ACCEPT_TOKEN: &str = "pair-accept";

/// Single-character token asking a node to resend its last event.
pub const RESEND_TOKEN: &str = "R";

/// How often a claiming node rebroadcasts its claim.
pub const CLAIM_BROADCAST_INTERVAL: Duration = Duration::from_secs(1);

/// How long a node keeps claiming before giving up.
pub const CLAIM_WINDOW: Duration = Duration::from_secs(30);

/// How long the hub waits for an operator answer to a pairing prompt.
pub const PAIRING_PROMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Presses of the designated input required to start a claim.
pub const CONTROL_SEQUENCE_COUNT: usize = 4;

/// Rolling window in which the control-sequence presses must land.
pub const CONTROL_SEQUENCE_WINDOW: Duration = Duration::from_secs(3);

/// Minimum spacing between accepted presses on one input.
pub const DEBOUNCE_INTERVAL: Duration = Duration::from_millis(500);

/// Maximum send attempts for one event.
pub const MAX_SEND_ATTEMPTS: u8 = 3;

/// Hub-side ceiling on an OTA session. Longer than the node's network-phase
/// ceiling because it also absorbs node reboot and network reassociation.
pub const OTA_SESSION_TIMEOUT: Duration = Duration::from_secs(7 * 60);

/// Node-side hard ceiling on the whole OTA network phase.
pub const OTA_NETWORK_CEILING: Duration = Duration::from_secs(5 * 60);

/// Node-side network connect timeout during OTA.
pub const OTA_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle time before the node starts its sleep warning.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Length of the pre-sleep warning phase.
pub const SLEEP_WARNING_DURATION: Duration = Duration::from_secs(10);

/// Status-light blink period during the sleep warning.
pub const WARNING_BLINK_PERIOD: Duration = Duration::from_secs(2);

// OTA status tokens (node -> hub -> host, `"OTA"` key).
pub const OTA_STATUS_READY: &str = "OTA_READY";
pub const OTA_STATUS_STARTING: &str = "OTA_STARTING";
pub const OTA_STATUS_DOWNLOADING: &str = "OTA_DOWNLOADING";
pub const OTA_STATUS_FLASHING: &str = "OTA_FLASHING";
pub const OTA_STATUS_SUCCESS: &str = "OTA_SUCCESS";
pub const OTA_STATUS_ERROR: &str = "OTA_ERROR";
pub const OTA_STATUS_ABORT: &str = "OTA_ABORT";
pub const OTA_STATUS_REJECT: &str = "OTA_REJECT";
pub const OTA_STATUS_TIMEOUT: &str = "OTA_TIMEOUT";

// OTA command actions (`"OTA_CMD"` key).
pub const OTA_CMD_WIFI_UPDATE: &str = "WIFI_UPDATE";

// CONFIG command actions (`"CONFIG_CMD"` key).
pub const CONFIG_CMD_SET_DEVICE_ID: &str = "SET_DEVICE_ID";
pub const CONFIG_CMD_SET_GPIO: &str = "SET_GPIO_CONFIG";
pub const CONFIG_CMD_SET_WIFI: &str = "SET_WIFI_CONFIG";

// CONFIG status tokens (`"CONFIG"` key).
pub const CONFIG_STATUS_DEVICE_ID_OK: &str = "DEVICE_ID_OK";
pub const CONFIG_STATUS_GPIO_OK: &str = "GPIO_OK";
pub const CONFIG_STATUS_WIFI_OK: &str = "WIFI_OK";
