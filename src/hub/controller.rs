//! Hub main-loop logic, independent of the binary's I/O plumbing.
//!
//! [`HubController`] owns the radio, registry, and pairing slot, consumes
//! the inbound queue, and produces host-link output lines into a buffer the
//! caller drains. Keeping stdout and stdin out of this type lets the whole
//! hub run under a loopback radio in tests.
//!
//! Per loop iteration the binary calls [`HubController::poll`], which drains
//! every queued datagram in FIFO order, then expires the pairing window and
//! sweeps stale OTA sessions.

use crate::hub::host_link::{HostCommand, HostLinkError};
use crate::hub::ota::{self, SessionEffect};
use crate::hub::pairing::{AnswerOutcome, PairingSlot};
use crate::hub::queue::{QueueConsumer, QueueEntry};
use crate::hub::registry::DeviceRegistry;
use crate::protocol::constants::{OTA_SESSION_TIMEOUT, RESEND_TOKEN};
use crate::protocol::{EventFrame, ProtocolError, RadioMessage};
use crate::radio::{format_address, RadioAddress, RadioLink};
use log::{debug, info, warn, LevelFilter};
use std::time::Instant;

/// The hub's control core.
pub struct HubController<R: RadioLink> {
    radio: R,
    registry: DeviceRegistry,
    pairing: PairingSlot,
    inbound: QueueConsumer,
    host_out: Vec<String>,
}

impl<R: RadioLink> HubController<R> {
    pub fn new(radio: R, inbound: QueueConsumer) -> Self {
        Self {
            radio,
            registry: DeviceRegistry::default(),
            pairing: PairingSlot::new(),
            inbound,
            host_out: Vec::new(),
        }
    }

    /// Lines destined for the host, in emission order. The caller prints
    /// and clears them once per loop iteration.
    pub fn take_host_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.host_out)
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// One loop iteration: drain the inbound queue, then service timers.
    pub fn poll(&mut self, now: Instant) {
        let dropped = self.inbound.take_new_drops();
        if dropped > 0 {
            warn!("inbound queue overflowed, {} packet(s) dropped", dropped);
        }

        for entry in self.inbound.drain_all() {
            self.handle_inbound(entry, now);
        }

        self.pairing.poll(now);

        for stable_id in self.registry.sweep_ota_timeouts(now, OTA_SESSION_TIMEOUT) {
            warn!("OTA session for device {} timed out", stable_id);
            self.host_out.push(ota::timeout_notice(stable_id));
        }
    }

    // ==================== Inbound radio path ====================

    fn handle_inbound(&mut self, entry: QueueEntry, now: Instant) {
        let message = match RadioMessage::parse(&entry.payload) {
            Ok(message) => message,
            Err(ProtocolError::MalformedPayload(msg)) => {
                // Ask for a resend; no state is mutated on a bad payload.
                debug!(
                    "malformed payload from {}: {}",
                    format_address(&entry.source),
                    msg
                );
                self.send_to(entry.source, RESEND_TOKEN.as_bytes());
                return;
            }
            Err(e) => {
                warn!(
                    "dropping payload from {}: {}",
                    format_address(&entry.source),
                    e
                );
                return;
            }
        };

        match message {
            RadioMessage::Claim { stable_id } => {
                if let Some(prompt) = self.pairing.offer_claim(stable_id, entry.source, now) {
                    self.host_out.push(prompt);
                }
            }
            RadioMessage::Event(ref frame) => {
                self.record_event_sender(frame, entry.source);
                self.forward_upstream(&entry.payload);
            }
            RadioMessage::OtaStatus(ref status) => {
                match ota::session_effect(&status.status) {
                    SessionEffect::Confirm => {
                        debug!("device {} confirmed OTA entry", status.device_id)
                    }
                    SessionEffect::Close => {
                        if self.registry.clear_ota(status.device_id) {
                            info!(
                                "OTA session for device {} closed: {}",
                                status.device_id, status.status
                            );
                        }
                    }
                    SessionEffect::Progress => {}
                }
                self.refresh_address(status.device_id, entry.source);
                self.forward_upstream(&entry.payload);
            }
            RadioMessage::ConfigStatus(ref status) => {
                self.refresh_address(status.device_id, entry.source);
                self.forward_upstream(&entry.payload);
            }
            RadioMessage::OtaCommand(_)
            | RadioMessage::ConfigCommand(_)
            | RadioMessage::Reply(_)
            | RadioMessage::Json(_) => {
                // Structurally valid JSON of a shape the hub does not act
                // on goes upstream verbatim.
                self.forward_upstream(&entry.payload);
            }
            RadioMessage::Accept | RadioMessage::ResendRequest => {
                debug!(
                    "ignoring node-bound token from {}",
                    format_address(&entry.source)
                );
            }
            RadioMessage::Raw(_) => {
                warn!(
                    "unexpected raw payload from {}, dropped",
                    format_address(&entry.source)
                );
            }
        }
    }

    fn record_event_sender(&mut self, frame: &EventFrame, source: RadioAddress) {
        let result = match frame {
            EventFrame::PreSession { stable_id, .. } => {
                self.registry.upsert(*stable_id, source, None).map(|_| ())
            }
            EventFrame::InSession { session_id, .. } => {
                self.registry.upsert_legacy(*session_id, source)
            }
        };
        if let Err(e) = result {
            warn!("registry refused event sender: {}", e);
        }
    }

    fn refresh_address(&mut self, stable_id: u32, source: RadioAddress) {
        if let Err(e) = self.registry.upsert(stable_id, source, None) {
            warn!("registry refused status sender {}: {}", stable_id, e);
        }
    }

    fn forward_upstream(&mut self, payload: &[u8]) {
        match std::str::from_utf8(payload) {
            Ok(text) => self.host_out.push(text.to_string()),
            Err(_) => warn!("non-UTF-8 JSON payload, not forwarded"),
        }
    }

    // ==================== Host command path ====================

    /// Process one line from the host.
    pub fn handle_host_line(&mut self, line: &str, now: Instant) {
        let command = match HostCommand::parse(line) {
            Ok(command) => command,
            Err(HostLinkError::UnrecognizedCommand(line)) => {
                warn!("unrecognized host command: {}", line);
                return;
            }
            Err(e) => {
                warn!("bad host line: {}", e);
                return;
            }
        };

        match command {
            HostCommand::OtaUpdate { command, raw } => {
                let Some(addr) = self.require_target(command.device_id) else {
                    return;
                };
                self.send_to(addr, raw.as_bytes());
                if let Err(e) = self.registry.begin_ota(command.device_id, now) {
                    warn!("could not open OTA session: {}", e);
                } else {
                    info!(
                        "OTA update ordered for device {} ({})",
                        command.device_id, command.action
                    );
                }
            }
            HostCommand::OtaChunk { device_id, chunk } => {
                let bytes = match ota::decode_legacy_chunk(&chunk) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("OTA chunk for device {} rejected: {}", device_id, e);
                        return;
                    }
                };
                let Some(addr) = self.require_target(device_id) else {
                    return;
                };
                self.send_to(addr, &bytes);
            }
            HostCommand::Config { command, raw } => {
                let Some(addr) = self.require_target(command.device_id) else {
                    return;
                };
                self.send_to(addr, raw.as_bytes());
            }
            HostCommand::Reply { reply, raw } => {
                // Prefer the terminal id; fall back to the stable id for a
                // node that has not been assigned one yet. A successful
                // fallback teaches the registry the terminal id.
                let addr = self.registry.resolve_legacy(reply.terminal_id).or_else(|| {
                    let stable_id = reply.device_id?;
                    let addr = self.registry.resolve(stable_id)?;
                    if let Err(e) = self.registry.upsert(stable_id, addr, Some(reply.terminal_id)) {
                        warn!("could not record terminal id: {}", e);
                    }
                    Some(addr)
                });
                match addr {
                    Some(addr) => self.send_to(addr, raw.as_bytes()),
                    None => warn!(
                        "reply for terminal {} has no routable device, dropped",
                        reply.terminal_id
                    ),
                }
            }
            HostCommand::UpdateTerminal {
                device_id,
                new_terminal_id,
            } => match self.registry.reassign_terminal(device_id, new_terminal_id) {
                Ok(()) => info!(
                    "device {} reassigned to terminal {}",
                    device_id, new_terminal_id
                ),
                Err(e) => warn!("terminal reassignment failed: {}", e),
            },
            HostCommand::DebugToggle(enabled) => {
                let level = if enabled {
                    LevelFilter::Debug
                } else {
                    LevelFilter::Info
                };
                log::set_max_level(level);
                info!("debug logging {}", if enabled { "enabled" } else { "disabled" });
                if enabled {
                    debug!("{}", self.registry.describe());
                }
            }
            HostCommand::PairingAnswer(answer) => match self.pairing.answer(&answer) {
                AnswerOutcome::Accept {
                    stable_id,
                    radio_address,
                } => {
                    // Exactly one accept token; a driver failure here is
                    // logged and the node's claim window handles the rest.
                    self.send_to(radio_address, crate::protocol::constants::ACCEPT_TOKEN.as_bytes());
                    if let Err(e) = self.registry.upsert(stable_id, radio_address, None) {
                        warn!("paired device not registered: {}", e);
                    }
                }
                AnswerOutcome::Reject | AnswerOutcome::NoPending => {}
            },
        }
    }

    fn require_target(&self, stable_id: u32) -> Option<RadioAddress> {
        let addr = self.registry.resolve(stable_id);
        if addr.is_none() {
            warn!("no radio address on file for device {}, dropped", stable_id);
        }
        addr
    }

    fn send_to(&mut self, dest: RadioAddress, payload: &[u8]) {
        if !self.radio.has_peer(&dest) {
            if let Err(e) = self.radio.add_peer(dest) {
                warn!("cannot add peer {}: {}", format_address(&dest), e);
                return;
            }
        }
        if let Err(e) = self.radio.send(dest, payload) {
            warn!("send to {} failed: {}", format_address(&dest), e);
        }
    }
}
