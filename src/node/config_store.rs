//! Durable node configuration.
//!
//! Everything a node must remember across deep sleep and reboot lives in one
//! JSON document: stable id, pin assignments, optional wireless credentials,
//! the paired hub's address, and the OTA resume flag. Writes are fsynced and
//! verified by reading back, because the OTA path reboots immediately after
//! persisting its resume state and a torn write there would strand the node.
//!
//! A store that fails to parse falls back to factory defaults with a logged
//! warning; the stable id is drawn from the OS RNG on first boot and kept
//! forever after.

use log::{info, warn};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Errors from the config store.
#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    /// The read-back after a write did not match what was written.
    VerifyFailed { path: PathBuf },
    Serialize(serde_json::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config store I/O error: {}", e),
            Self::VerifyFailed { path } => {
                write!(f, "config verification failed at {:?}", path)
            }
            Self::Serialize(e) => write!(f, "config serialization error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// GPIO assignments for the three status lights and four inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinMap {
    pub status_red: u8,
    pub status_green: u8,
    pub status_yellow: u8,
    pub input_a: u8,
    pub input_b: u8,
    pub input_c: u8,
    pub input_d: u8,
}

impl Default for PinMap {
    fn default() -> Self {
        Self {
            status_red: 25,
            status_green: 26,
            status_yellow: 27,
            input_a: 32,
            input_b: 33,
            input_c: 34,
            input_d: 35,
        }
    }
}

impl PinMap {
    /// The input pin for a 0-based input index, if any.
    pub fn input_pin(&self, index: usize) -> Option<u8> {
        match index {
            0 => Some(self.input_a),
            1 => Some(self.input_b),
            2 => Some(self.input_c),
            3 => Some(self.input_d),
            _ => None,
        }
    }
}

/// Wireless credentials for the OTA network phase. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct WirelessCredentials {
    pub ssid: String,
    pub secret: String,
}

impl fmt::Debug for WirelessCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The secret never reaches a log line.
        f.debug_struct("WirelessCredentials")
            .field("ssid", &self.ssid)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// OTA resume state, persisted before the reboot into a download attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaResume {
    pub pending: bool,
    pub url: Option<String>,
}

/// The node's durable configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub stable_id: u32,
    #[serde(default)]
    pub pin_map: PinMap,
    #[serde(default)]
    pub wireless_creds: Option<WirelessCredentials>,
    #[serde(default)]
    pub paired_hub: Option<[u8; 6]>,
    #[serde(default)]
    pub ota_resume: OtaResume,
}

impl NodeConfig {
    /// Factory defaults with a freshly drawn stable id.
    pub fn factory() -> Self {
        Self {
            stable_id: OsRng.next_u32(),
            pin_map: PinMap::default(),
            wireless_creds: None,
            paired_hub: None,
            ota_resume: OtaResume::default(),
        }
    }

    /// Reject documents a buggy host could have talked us into.
    pub fn validate(&self) -> Result<(), String> {
        if self.ota_resume.pending && self.ota_resume.url.is_none() {
            return Err("OTA resume pending without a URL".into());
        }
        Ok(())
    }
}

/// File-backed store for [`NodeConfig`].
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored config, or fall back to factory defaults (persisting
    /// them) when the store is absent or corrupted.
    pub fn load_or_create(&self) -> Result<NodeConfig, StoreError> {
        match self.load() {
            Some(config) => Ok(config),
            None => {
                let config = NodeConfig::factory();
                info!(
                    "initializing factory config with stable id {}",
                    config.stable_id
                );
                self.save(&config)?;
                Ok(config)
            }
        }
    }

    fn load(&self) -> Option<NodeConfig> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("failed to read config at {:?}: {}", self.path, e);
                return None;
            }
        };
        match serde_json::from_str::<NodeConfig>(&text) {
            Ok(config) => match config.validate() {
                Ok(()) => Some(config),
                Err(msg) => {
                    warn!("stored config invalid ({}), using factory defaults", msg);
                    None
                }
            },
            Err(e) => {
                warn!("stored config corrupted ({}), using factory defaults", e);
                None
            }
        }
    }

    /// Persist the config: write, fsync, read back and compare.
    pub fn save(&self, config: &NodeConfig) -> Result<(), StoreError> {
        let text = serde_json::to_string_pretty(config).map_err(StoreError::Serialize)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = fs::File::create(&self.path)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
        drop(file);

        let read_back = fs::read_to_string(&self.path)?;
        if read_back != text {
            return Err(StoreError::VerifyFailed {
                path: self.path.clone(),
            });
        }
        Ok(())
    }
}
