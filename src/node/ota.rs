//! Node side of the OTA subsystem: network fetch, flash streaming, and the
//! legacy chunked path.
//!
//! The network transport never runs alongside the radio. The accepting node
//! persists the firmware URL (fsynced), announces `OTA_READY`, and reboots;
//! the boot path then sees the pending flag, skips radio bring-up entirely,
//! and runs the fetch inside a radio-silent region with a hard five-minute
//! ceiling. Whatever the outcome, the resume flag is cleared before the next
//! boot so a crash mid-download cannot loop the node.
//!
//! Flash and network hardware sit behind the [`FlashTarget`] and
//! [`NetworkStack`] traits; host builds use [`FileFlashTarget`] and a no-op
//! network, which is how the download path is tested.

use crate::node::config_store::{ConfigStore, NodeConfig, OtaResume, WirelessCredentials};
use crate::protocol::constants::{OTA_CONNECT_TIMEOUT, OTA_NETWORK_CEILING};
use log::{info, warn};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Errors across the OTA apply path. Each maps to a best-effort
/// `OTA_ERROR` status message upstream.
#[derive(Debug)]
pub enum OtaError {
    /// No wireless credentials are stored.
    MissingCredentials,
    /// The network stack did not associate within the connect timeout.
    ConnectTimeout,
    /// HTTP-level failure (connection refused, bad status, broken body).
    TransferError(String),
    /// Missing, zero, or non-positive Content-Length.
    InvalidSize,
    /// The whole network phase exceeded its hard ceiling.
    PhaseTimeout,
    /// The resume state could not be persisted.
    Persist(String),
    FlashBegin(String),
    FlashWrite(String),
    FlashCommit(String),
}

impl fmt::Display for OtaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingCredentials => write!(f, "no wireless credentials stored"),
            Self::ConnectTimeout => write!(f, "network connect timeout"),
            Self::TransferError(msg) => write!(f, "transfer error: {}", msg),
            Self::InvalidSize => write!(f, "server did not report a positive firmware size"),
            Self::PhaseTimeout => write!(f, "OTA network phase exceeded its time ceiling"),
            Self::Persist(msg) => write!(f, "could not persist resume state: {}", msg),
            Self::FlashBegin(msg) => write!(f, "flash begin failed: {}", msg),
            Self::FlashWrite(msg) => write!(f, "flash write failed: {}", msg),
            Self::FlashCommit(msg) => write!(f, "flash commit failed: {}", msg),
        }
    }
}

impl std::error::Error for OtaError {}

/// Write seam for the firmware partition.
pub trait FlashTarget {
    /// Prepare to receive an image of `size` bytes.
    fn begin(&mut self, size: usize) -> Result<(), OtaError>;
    fn write(&mut self, chunk: &[u8]) -> Result<(), OtaError>;
    /// Validate and activate the written image.
    fn commit(&mut self) -> Result<(), OtaError>;
}

/// Network bring-up seam for the radio-silent OTA phase.
pub trait NetworkStack {
    fn connect(
        &mut self,
        creds: &WirelessCredentials,
        timeout: Duration,
    ) -> Result<(), OtaError>;
    fn disconnect(&mut self);
}

/// Host-side network stack: the OS is already connected.
#[derive(Default)]
pub struct HostNetwork;

impl NetworkStack for HostNetwork {
    fn connect(
        &mut self,
        _creds: &WirelessCredentials,
        _timeout: Duration,
    ) -> Result<(), OtaError> {
        Ok(())
    }

    fn disconnect(&mut self) {}
}

/// Progress milestones reported during an apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaStage {
    /// HTTP response accepted; `total` bytes expected.
    Downloading { total: usize },
    /// Streaming writes under way.
    Flashing { written: usize, total: usize },
}

/// Result of a completed apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaOutcome {
    pub bytes: usize,
    /// SHA-256 of the streamed image, hex-encoded; reported upstream on
    /// success.
    pub digest: String,
}

/// Tunables for the fetch-and-flash path.
#[derive(Debug, Clone)]
pub struct OtaConfig {
    pub connect_timeout: Duration,
    pub phase_ceiling: Duration,
    /// Emit a flashing progress milestone every this many bytes.
    pub progress_stride: usize,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            connect_timeout: OTA_CONNECT_TIMEOUT,
            phase_ceiling: OTA_NETWORK_CEILING,
            progress_stride: 64 * 1024,
        }
    }
}

impl OtaConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.progress_stride == 0 {
            return Err("progress_stride must be positive".into());
        }
        if self.phase_ceiling < self.connect_timeout {
            return Err("phase ceiling shorter than connect timeout".into());
        }
        Ok(())
    }
}

/// Download a firmware image and stream it into the flash target.
///
/// The HTTP client carries both the connect timeout and the phase ceiling;
/// the streaming loop additionally checks elapsed time so a trickling server
/// cannot stretch the phase past its ceiling.
pub fn fetch_and_flash(
    url: &str,
    config: &OtaConfig,
    flash: &mut dyn FlashTarget,
    mut progress: impl FnMut(OtaStage),
) -> Result<OtaOutcome, OtaError> {
    let started = Instant::now();
    let client = reqwest::blocking::Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.phase_ceiling)
        .build()
        .map_err(|e| OtaError::TransferError(e.to_string()))?;

    let response = client
        .get(url)
        .send()
        .map_err(|e| OtaError::TransferError(e.to_string()))?;
    if !response.status().is_success() {
        return Err(OtaError::TransferError(format!(
            "HTTP {}",
            response.status()
        )));
    }

    let total = match response.content_length() {
        Some(len) if len > 0 => len as usize,
        _ => return Err(OtaError::InvalidSize),
    };
    progress(OtaStage::Downloading { total });

    flash.begin(total)?;

    let mut reader = response;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 4096];
    let mut written = 0usize;
    let mut next_milestone = config.progress_stride;

    loop {
        if started.elapsed() > config.phase_ceiling {
            return Err(OtaError::PhaseTimeout);
        }
        let n = reader
            .read(&mut buf)
            .map_err(|e| OtaError::TransferError(e.to_string()))?;
        if n == 0 {
            break;
        }
        flash.write(&buf[..n])?;
        hasher.update(&buf[..n]);
        written += n;
        if written >= next_milestone {
            progress(OtaStage::Flashing { written, total });
            next_milestone += config.progress_stride;
        }
    }

    if written != total {
        return Err(OtaError::TransferError(format!(
            "short body: {} of {} bytes",
            written, total
        )));
    }

    flash.commit()?;
    Ok(OtaOutcome {
        bytes: written,
        digest: hex::encode(hasher.finalize()),
    })
}

/// Run the full radio-silent network phase for a pending resume.
///
/// Returns `None` when no resume is pending. When one is, the resume flag is
/// cleared and persisted before this function returns, success or not, so
/// the next boot is ordinary either way. Milestones reach `progress` as they
/// happen; the boot path buffers them for reporting once the radio is back,
/// since nothing can be sent from inside the radio-silent region.
pub fn run_resume(
    store: &ConfigStore,
    config: &mut NodeConfig,
    network: &mut dyn NetworkStack,
    flash: &mut dyn FlashTarget,
    ota_config: &OtaConfig,
    mut progress: impl FnMut(OtaStage),
) -> Option<Result<OtaOutcome, OtaError>> {
    if !config.ota_resume.pending {
        return None;
    }
    let url = config.ota_resume.url.clone();

    // Clear the flag first: a crash during the attempt must not loop.
    config.ota_resume = OtaResume::default();
    if let Err(e) = store.save(config) {
        warn!("could not clear OTA resume state: {}", e);
        return Some(Err(OtaError::Persist(e.to_string())));
    }

    let Some(url) = url else {
        return Some(Err(OtaError::TransferError("resume without URL".into())));
    };
    let Some(creds) = config.wireless_creds.clone() else {
        return Some(Err(OtaError::MissingCredentials));
    };

    info!("resuming OTA update from {}", url);
    let result = (|| {
        network.connect(&creds, ota_config.connect_timeout)?;
        let outcome = fetch_and_flash(&url, ota_config, flash, |stage| {
            if let OtaStage::Flashing { written, total } = stage {
                info!("flashed {}/{} bytes", written, total);
            }
            progress(stage);
        });
        network.disconnect();
        outcome
    })();
    Some(result)
}

/// Persist the resume state that precedes the reboot into a download.
pub fn arm_resume(
    store: &ConfigStore,
    config: &mut NodeConfig,
    url: &str,
) -> Result<(), crate::node::config_store::StoreError> {
    config.ota_resume = OtaResume {
        pending: true,
        url: Some(url.to_string()),
    };
    store.save(config)
}

/// File-backed flash target for host builds.
pub struct FileFlashTarget {
    path: PathBuf,
    file: Option<fs::File>,
    expected: usize,
    written: usize,
}

impl FileFlashTarget {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            expected: 0,
            written: 0,
        }
    }
}

impl FlashTarget for FileFlashTarget {
    fn begin(&mut self, size: usize) -> Result<(), OtaError> {
        let file = fs::File::create(&self.path).map_err(|e| OtaError::FlashBegin(e.to_string()))?;
        self.file = Some(file);
        self.expected = size;
        self.written = 0;
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), OtaError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| OtaError::FlashWrite("write before begin".into()))?;
        file.write_all(chunk)
            .map_err(|e| OtaError::FlashWrite(e.to_string()))?;
        self.written += chunk.len();
        Ok(())
    }

    fn commit(&mut self) -> Result<(), OtaError> {
        let file = self
            .file
            .take()
            .ok_or_else(|| OtaError::FlashCommit("commit before begin".into()))?;
        if self.written != self.expected {
            return Err(OtaError::FlashCommit(format!(
                "image incomplete: {} of {} bytes",
                self.written, self.expected
            )));
        }
        file.sync_all()
            .map_err(|e| OtaError::FlashCommit(e.to_string()))?;
        Ok(())
    }
}

impl FlashTarget for Box<dyn FlashTarget> {
    fn begin(&mut self, size: usize) -> Result<(), OtaError> {
        (**self).begin(size)
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), OtaError> {
        (**self).write(chunk)
    }

    fn commit(&mut self) -> Result<(), OtaError> {
        (**self).commit()
    }
}

/// Legacy chunked flashing: raw chunks relayed by the hub, no size known up
/// front and no end-of-transfer marker on the wire. `begin(0)` opens the
/// target on the first chunk; the operator-side tooling is responsible for
/// completeness.
pub struct LegacyFlasher<F: FlashTarget> {
    flash: F,
    active: bool,
    written: usize,
}

impl<F: FlashTarget> LegacyFlasher<F> {
    pub fn new(flash: F) -> Self {
        Self {
            flash,
            active: false,
            written: 0,
        }
    }

    /// Feed one raw chunk. The first chunk opens the flash target.
    pub fn chunk(&mut self, bytes: &[u8]) -> Result<(), OtaError> {
        if !self.active {
            self.flash.begin(0)?;
            self.active = true;
        }
        self.flash.write(bytes)?;
        self.written += bytes.len();
        Ok(())
    }

    /// Abandon the stream after an error; the next chunk starts over.
    pub fn reset(&mut self) {
        self.active = false;
        self.written = 0;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn written(&self) -> usize {
        self.written
    }

    #[cfg(test)]
    pub fn into_inner(self) -> F {
        self.flash
    }
}
