//! Node main-loop logic, independent of the binary's I/O plumbing.
//!
//! [`NodeController`] owns the radio, the durable config, and every node
//! state machine. The binary's loop polls the radio, feeds received frames
//! through [`NodeController::handle_frame`], reports pressed inputs through
//! [`NodeController::handle_press`], and calls [`NodeController::poll`] once
//! per iteration; the controller tells it when to sleep or reboot.
//!
//! Hardware sits behind seams: the radio behind [`RadioLink`], the status
//! lights behind [`StatusLights`], the firmware partition behind
//! [`FlashTarget`]. Host builds plug in loopback and file implementations.

use crate::node::config_store::{ConfigStore, NodeConfig, StoreError, WirelessCredentials};
use crate::node::delivery::{AttemptOutcome, Debouncer, DeliverySlot, RetryConfig};
use crate::node::ota::{self, FlashTarget, LegacyFlasher, OtaStage};
use crate::node::pairing::{ClaimAction, ClaimSequenceDetector, PairingClaim};
use crate::node::power::{PowerAction, PowerConfig, PowerManager};
use crate::protocol::constants::{
    CONFIG_STATUS_DEVICE_ID_OK, CONFIG_STATUS_GPIO_OK, CONFIG_STATUS_WIFI_OK, OTA_CMD_WIFI_UPDATE,
    OTA_STATUS_DOWNLOADING, OTA_STATUS_ERROR, OTA_STATUS_FLASHING, OTA_STATUS_READY,
    OTA_STATUS_REJECT, OTA_STATUS_STARTING,
};
use crate::protocol::{
    claim_token, ConfigCommand, ConfigStatus, DirectReply, EventFrame, OtaCommand, OtaStatus,
    RadioMessage,
};
use crate::radio::{format_address, RadioAddress, RadioLink, BROADCAST_ADDRESS};
use log::{debug, info, warn};
use std::time::Instant;

/// The input reserved for the pairing control sequence.
pub const CONTROL_INPUT: usize = 3;

/// Status light identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Light {
    Red,
    Green,
    Yellow,
}

/// Seam for the three status lights.
pub trait StatusLights {
    fn set(&mut self, light: Light, on: bool);
}

/// Host-side lights: log at debug level.
#[derive(Default)]
pub struct LogLights;

impl StatusLights for LogLights {
    fn set(&mut self, light: Light, on: bool) {
        debug!("light {:?} {}", light, if on { "on" } else { "off" });
    }
}

/// What the binary's loop should do after a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeTick {
    /// Enter deep sleep now (after reconfiguring wake sources).
    pub sleep: bool,
    /// Reboot now (config change applied or OTA resume armed).
    pub reboot: bool,
}

/// The node's control core.
pub struct NodeController<R: RadioLink> {
    radio: R,
    store: ConfigStore,
    config: NodeConfig,
    lights: Box<dyn StatusLights>,
    legacy: LegacyFlasher<Box<dyn FlashTarget>>,
    /// 0 means unassigned; never persisted.
    session_id: u32,
    debouncer: Debouncer,
    claim_detector: ClaimSequenceDetector,
    pairing: PairingClaim,
    delivery: DeliverySlot,
    power: PowerManager,
    reboot_requested: bool,
}

impl<R: RadioLink> NodeController<R> {
    pub fn new(
        radio: R,
        store: ConfigStore,
        config: NodeConfig,
        lights: Box<dyn StatusLights>,
        flash: Box<dyn FlashTarget>,
        now: Instant,
    ) -> Self {
        let delivery = DeliverySlot::new(RetryConfig::default(), config.stable_id);
        let mut controller = Self {
            radio,
            store,
            config,
            lights,
            legacy: LegacyFlasher::new(flash),
            session_id: 0,
            debouncer: Debouncer::default(),
            claim_detector: ClaimSequenceDetector::default(),
            pairing: PairingClaim::default(),
            delivery,
            power: PowerManager::new(PowerConfig::default(), now),
            reboot_requested: false,
        };
        if let Some(hub) = controller.config.paired_hub {
            if let Err(e) = controller.radio.add_peer(hub) {
                warn!("could not re-add paired hub as peer: {}", e);
            }
        }
        controller
    }

    pub fn stable_id(&self) -> u32 {
        self.config.stable_id
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn is_paired(&self) -> bool {
        self.config.paired_hub.is_some()
    }

    pub fn reboot_requested(&self) -> bool {
        self.reboot_requested
    }

    /// Access the radio driver, e.g. for the binary's receive polling.
    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    // ==================== Input path ====================

    /// Report a pressed input (0-based). Debounced; the control input also
    /// feeds the pairing sequence detector.
    pub fn handle_press(&mut self, input: usize, now: Instant) {
        if !self.debouncer.accept(input, now) {
            return;
        }
        self.power.note_activity(now);

        if input == CONTROL_INPUT && self.claim_detector.register_press(now) {
            // The presses that formed the sequence were operator intent to
            // pair, not answers; drop whatever they queued.
            self.delivery.cancel_pending();
            self.pairing.start(now);
            return;
        }
        self.queue_event(input, now);
    }

    /// A press already delivered by the wake path: transmit immediately and
    /// arm the debouncer so the first scan does not re-send it.
    pub fn handle_wake_press(&mut self, input: usize, now: Instant) {
        self.debouncer.suppress(input, now);
        self.power.note_activity(now);
        let Some(frame) = self.frame_for(input) else {
            return;
        };
        if self.send_to_hub(frame.encode().as_bytes()) {
            // A resend request must replay this press, not one from before
            // the node slept.
            self.delivery.note_sent(frame);
        }
    }

    fn queue_event(&mut self, input: usize, now: Instant) {
        let Some(frame) = self.frame_for(input) else {
            return;
        };
        self.delivery.submit(frame, now);
    }

    fn frame_for(&self, input: usize) -> Option<EventFrame> {
        if input >= 4 {
            return None;
        }
        let key = (b'A' + input as u8) as char;
        Some(if self.session_id == 0 {
            EventFrame::PreSession {
                stable_id: self.config.stable_id,
                key,
            }
        } else {
            EventFrame::InSession {
                session_id: self.session_id,
                key,
            }
        })
    }

    // ==================== Radio path ====================

    /// Process one received radio frame.
    pub fn handle_frame(&mut self, source: RadioAddress, payload: &[u8], now: Instant) {
        self.power.note_activity(now);

        let message = match RadioMessage::parse(payload) {
            Ok(message) => message,
            Err(e) => {
                debug!("unparseable frame from {}: {}", format_address(&source), e);
                return;
            }
        };

        match message {
            RadioMessage::Accept => self.handle_accept(source),
            RadioMessage::ResendRequest => {
                if !self.delivery.resend_last(now) {
                    debug!("resend requested but no event on record");
                }
            }
            RadioMessage::Reply(reply) => self.handle_reply(reply),
            RadioMessage::OtaCommand(cmd) => self.handle_ota_command(cmd),
            RadioMessage::ConfigCommand(cmd) => self.handle_config_command(cmd),
            RadioMessage::Raw(chunk) => self.handle_legacy_chunk(&chunk),
            RadioMessage::Claim { .. }
            | RadioMessage::Event(_)
            | RadioMessage::OtaStatus(_)
            | RadioMessage::ConfigStatus(_)
            | RadioMessage::Json(_) => {
                debug!("ignoring hub-bound frame from {}", format_address(&source));
            }
        }
    }

    fn handle_accept(&mut self, source: RadioAddress) {
        if !self.pairing.handle_accept() {
            debug!("stale accept token from {}", format_address(&source));
            return;
        }
        if !self.radio.has_peer(&source) {
            if let Err(e) = self.radio.add_peer(source) {
                warn!("cannot add hub as peer: {}", e);
                return;
            }
        }
        self.config.paired_hub = Some(source);
        if let Err(e) = self.store.save(&self.config) {
            warn!("could not persist paired hub: {}", e);
        } else {
            info!("paired with hub {}", format_address(&source));
        }
    }

    fn handle_reply(&mut self, reply: DirectReply) {
        let for_us = reply.device_id == Some(self.config.stable_id)
            || (self.session_id != 0 && reply.terminal_id == self.session_id);
        if !for_us {
            debug!("reply for terminal {} is not ours", reply.terminal_id);
            return;
        }
        if self.session_id != reply.terminal_id {
            info!("session id assigned: {}", reply.terminal_id);
            self.session_id = reply.terminal_id;
        }
        self.delivery.response_outstanding = false;
    }

    fn handle_ota_command(&mut self, cmd: OtaCommand) {
        if cmd.device_id != self.config.stable_id {
            debug!("OTA command for device {} is not ours", cmd.device_id);
            return;
        }
        if cmd.action != OTA_CMD_WIFI_UPDATE {
            self.send_ota_status(OTA_STATUS_REJECT, Some(format!("unknown action {}", cmd.action)));
            return;
        }
        let Some(url) = cmd.url else {
            self.send_ota_status(OTA_STATUS_REJECT, Some("missing URL".into()));
            return;
        };
        if self.config.wireless_creds.is_none() {
            self.send_ota_status(OTA_STATUS_REJECT, Some("no wireless credentials".into()));
            return;
        }
        match ota::arm_resume(&self.store, &mut self.config, &url) {
            Ok(()) => {
                info!("OTA update armed, rebooting into download");
                self.send_ota_status(OTA_STATUS_READY, None);
                // Last word before the radio goes silent for the fetch.
                self.send_ota_status(OTA_STATUS_STARTING, None);
                self.reboot_requested = true;
            }
            Err(e) => {
                self.send_ota_status(OTA_STATUS_ERROR, Some(e.to_string()));
            }
        }
    }

    fn handle_config_command(&mut self, cmd: ConfigCommand) {
        if cmd.device_id != self.config.stable_id {
            debug!("CONFIG command for device {} is not ours", cmd.device_id);
            return;
        }
        let result: Result<(&str, bool), StoreError> = match cmd.action.as_str() {
            crate::protocol::constants::CONFIG_CMD_SET_DEVICE_ID => {
                let Some(new_id) = cmd.new_device_id else {
                    warn!("SET_DEVICE_ID without a DeviceId, ignored");
                    return;
                };
                // The acknowledgement must carry the id the host targeted.
                let old_id = self.config.stable_id;
                self.config.stable_id = new_id;
                match self.store.save(&self.config) {
                    Ok(()) => {
                        self.send_config_status_as(old_id, CONFIG_STATUS_DEVICE_ID_OK);
                        info!("stable id changed {} -> {}, rebooting", old_id, new_id);
                        self.reboot_requested = true;
                        return;
                    }
                    Err(e) => {
                        self.config.stable_id = old_id;
                        Err(e)
                    }
                }
            }
            crate::protocol::constants::CONFIG_CMD_SET_GPIO => {
                let pins = &mut self.config.pin_map;
                if let Some(p) = cmd.red_pin {
                    pins.status_red = p;
                }
                if let Some(p) = cmd.green_pin {
                    pins.status_green = p;
                }
                if let Some(p) = cmd.yellow_pin {
                    pins.status_yellow = p;
                }
                if let Some(p) = cmd.button_a {
                    pins.input_a = p;
                }
                if let Some(p) = cmd.button_b {
                    pins.input_b = p;
                }
                if let Some(p) = cmd.button_c {
                    pins.input_c = p;
                }
                if let Some(p) = cmd.button_d {
                    pins.input_d = p;
                }
                self.store
                    .save(&self.config)
                    .map(|()| (CONFIG_STATUS_GPIO_OK, true))
            }
            crate::protocol::constants::CONFIG_CMD_SET_WIFI => {
                let (Some(ssid), Some(password)) = (cmd.ssid, cmd.password) else {
                    warn!("SET_WIFI_CONFIG missing SSID or Password, ignored");
                    return;
                };
                self.config.wireless_creds = Some(WirelessCredentials {
                    ssid,
                    secret: password,
                });
                self.store
                    .save(&self.config)
                    .map(|()| (CONFIG_STATUS_WIFI_OK, false))
            }
            other => {
                warn!("unknown CONFIG action {}, ignored", other);
                return;
            }
        };

        match result {
            Ok((status, reboot)) => {
                self.send_config_status(status);
                if reboot {
                    info!("configuration change applied, rebooting");
                    self.reboot_requested = true;
                }
            }
            Err(e) => warn!("could not persist configuration: {}", e),
        }
    }

    fn handle_legacy_chunk(&mut self, chunk: &[u8]) {
        if let Err(e) = self.legacy.chunk(chunk) {
            warn!("legacy flash chunk failed: {}", e);
            self.send_ota_status(OTA_STATUS_ERROR, Some(e.to_string()));
            self.legacy.reset();
        }
    }

    // ==================== Main loop ====================

    /// One loop iteration: service delivery, pairing, and power.
    pub fn poll(&mut self, now: Instant) -> NodeTick {
        // Delivery first, so a wake-sent event's retries go out promptly.
        let due_payload = self.delivery.due(now).map(EventFrame::encode);
        if let Some(payload) = due_payload {
            let outcome = if self.send_to_hub(payload.as_bytes()) {
                AttemptOutcome::Accepted
            } else {
                AttemptOutcome::Failed
            };
            self.delivery.record_outcome(outcome, now);
        }

        if self.pairing.poll(now) == ClaimAction::Broadcast {
            let token = claim_token(self.config.stable_id);
            if let Err(e) = self.radio.send(BROADCAST_ADDRESS, token.as_bytes()) {
                warn!("claim broadcast failed: {}", e);
            }
        }

        let veto =
            self.pairing.is_claiming() || self.reboot_requested || self.legacy.is_active();
        let action = self.power.poll(now, veto);
        match action {
            PowerAction::EnterWarning => {
                self.lights.set(Light::Yellow, true);
            }
            PowerAction::Sleep => {
                self.lights.set(Light::Yellow, false);
                return NodeTick {
                    sleep: true,
                    reboot: false,
                };
            }
            PowerAction::None => {
                if self.power.is_warning() {
                    let on = self.power.warning_blink_on(now);
                    self.lights.set(Light::Yellow, on);
                }
            }
        }

        NodeTick {
            sleep: false,
            reboot: self.reboot_requested,
        }
    }

    /// Report a milestone buffered during the radio-silent network phase.
    /// Called by the boot path once the radio is back up, before the
    /// terminal status goes out.
    pub fn announce_ota_stage(&mut self, stage: &OtaStage) {
        match stage {
            OtaStage::Downloading { total } => {
                self.send_ota_status(OTA_STATUS_DOWNLOADING, Some(format!("{} bytes", total)));
            }
            OtaStage::Flashing { written, total } => {
                self.send_ota_status(
                    OTA_STATUS_FLASHING,
                    Some(format!("{}/{} bytes", written, total)),
                );
            }
        }
    }

    /// Report the outcome of a completed OTA network phase. Called by the
    /// boot path once the radio is back up, right before the post-update
    /// reboot.
    pub fn announce_ota_result(&mut self, result: &Result<ota::OtaOutcome, ota::OtaError>) {
        match result {
            Ok(outcome) => {
                self.send_ota_status(
                    crate::protocol::constants::OTA_STATUS_SUCCESS,
                    Some(format!("sha256:{}", outcome.digest)),
                );
            }
            Err(e) => {
                self.send_ota_status(OTA_STATUS_ERROR, Some(e.to_string()));
            }
        }
    }

    // ==================== Sends ====================

    fn send_to_hub(&mut self, payload: &[u8]) -> bool {
        let Some(hub) = self.config.paired_hub else {
            warn!("not paired, dropping outbound frame");
            return false;
        };
        if !self.radio.has_peer(&hub) {
            if let Err(e) = self.radio.add_peer(hub) {
                warn!("cannot add hub as peer: {}", e);
                return false;
            }
        }
        match self.radio.send(hub, payload) {
            Ok(()) => true,
            Err(e) => {
                warn!("send to hub failed: {}", e);
                false
            }
        }
    }

    fn send_ota_status(&mut self, status: &str, message: Option<String>) {
        let report = match message {
            Some(msg) => OtaStatus::with_message(self.config.stable_id, status, msg),
            None => OtaStatus::new(self.config.stable_id, status),
        };
        self.send_to_hub(report.encode().as_bytes());
    }

    fn send_config_status(&mut self, status: &str) {
        self.send_config_status_as(self.config.stable_id, status);
    }

    fn send_config_status_as(&mut self, device_id: u32, status: &str) {
        let report = ConfigStatus::new(device_id, status);
        self.send_to_hub(report.encode().as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::ACCEPT_TOKEN;
    use crate::radio::{LoopbackBus, LoopbackRadio};
    use serde_json::Value;
    use std::env;
    use std::fs;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const HUB: RadioAddress = [0x10; 6];
    const NODE: RadioAddress = [0x20; 6];

    static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

    struct Rig {
        node: NodeController<LoopbackRadio>,
        hub: LoopbackRadio,
        store_path: std::path::PathBuf,
    }

    impl Drop for Rig {
        fn drop(&mut self) {
            let _ = fs::remove_file(&self.store_path);
        }
    }

    fn rig(paired: bool) -> Rig {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = env::temp_dir().join(format!(
            "keymesh-node-{}-{}.json",
            std::process::id(),
            id
        ));
        let store = ConfigStore::new(&path);
        let mut config = store.load_or_create().unwrap();
        config.stable_id = 7;
        if paired {
            config.paired_hub = Some(HUB);
        }
        store.save(&config).unwrap();

        let bus = LoopbackBus::new();
        let radio = bus.endpoint(NODE);
        let hub = bus.endpoint(HUB);
        let node = NodeController::new(
            radio,
            store,
            config,
            Box::new(LogLights),
            Box::new(MemFlash::default()),
            Instant::now(),
        );
        Rig {
            node,
            hub,
            store_path: path,
        }
    }

    #[derive(Default)]
    struct MemFlash {
        data: Vec<u8>,
    }

    impl FlashTarget for MemFlash {
        fn begin(&mut self, _size: usize) -> Result<(), crate::node::ota::OtaError> {
            Ok(())
        }
        fn write(&mut self, chunk: &[u8]) -> Result<(), crate::node::ota::OtaError> {
            self.data.extend_from_slice(chunk);
            Ok(())
        }
        fn commit(&mut self) -> Result<(), crate::node::ota::OtaError> {
            Ok(())
        }
    }

    /// Poll the node forward until the hub receives a frame.
    fn pump_until_recv(r: &mut Rig, mut now: Instant) -> (Instant, Vec<u8>) {
        for _ in 0..10_000 {
            r.node.poll(now);
            if let Some((_, payload)) = r.hub.poll_recv() {
                return (now, payload);
            }
            now += Duration::from_millis(1);
        }
        panic!("hub never received a frame");
    }

    // ==================== Event delivery ====================

    #[test]
    fn test_press_sends_pre_session_frame() {
        let mut r = rig(true);
        let now = Instant::now();
        r.node.handle_press(0, now);
        let (_, payload) = pump_until_recv(&mut r, now);

        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["Did"], 7);
        assert_eq!(value["Ans"], "A");
        assert!(value.get("Id").is_none());
    }

    #[test]
    fn test_reply_assigns_session_and_switches_framing() {
        let mut r = rig(true);
        let now = Instant::now();
        r.node.handle_press(0, now);
        let (now, _) = pump_until_recv(&mut r, now);

        r.node
            .handle_frame(HUB, br#"{"Id":12,"c":200,"Did":7}"#, now);
        assert_eq!(r.node.session_id(), 12);

        let later = now + Duration::from_secs(1);
        r.node.handle_press(1, later);
        let (_, payload) = pump_until_recv(&mut r, later);
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["Id"], 12);
        assert_eq!(value["Ans"], "B");
        assert!(value.get("Did").is_none());
    }

    #[test]
    fn test_reply_for_other_device_ignored() {
        let mut r = rig(true);
        r.node
            .handle_frame(HUB, br#"{"Id":12,"c":200,"Did":99}"#, Instant::now());
        assert_eq!(r.node.session_id(), 0);
    }

    #[test]
    fn test_debounce_swallows_rapid_presses() {
        let mut r = rig(true);
        let now = Instant::now();
        r.node.handle_press(0, now);
        r.node.handle_press(0, now + Duration::from_millis(100));
        let (now, _) = pump_until_recv(&mut r, now);
        // Only one frame made it out.
        let mut quiet = now;
        for _ in 0..600 {
            quiet += Duration::from_millis(1);
            r.node.poll(quiet);
        }
        assert!(r.hub.poll_recv().is_none());
    }

    #[test]
    fn test_resend_request_retransmits_last_event() {
        let mut r = rig(true);
        let now = Instant::now();
        r.node.handle_press(2, now);
        let (now, first) = pump_until_recv(&mut r, now);

        r.node.handle_frame(HUB, b"R", now);
        let (_, second) = pump_until_recv(&mut r, now);
        assert_eq!(first, second);
    }

    #[test]
    fn test_unpaired_node_gives_up_after_attempts() {
        let mut r = rig(false);
        let mut now = Instant::now();
        r.node.handle_press(0, now);
        for _ in 0..2000 {
            r.node.poll(now);
            now += Duration::from_millis(1);
        }
        assert!(r.hub.poll_recv().is_none());
    }

    // ==================== Pairing ====================

    #[test]
    fn test_control_sequence_starts_claim_broadcasts() {
        let mut r = rig(false);
        let start = Instant::now();
        for i in 0..4u64 {
            r.node
                .handle_press(CONTROL_INPUT, start + Duration::from_millis(i * 600));
        }
        let tick = start + Duration::from_millis(1900);
        r.node.poll(tick);
        let (_, payload) = r.hub.poll_recv().expect("claim broadcast");
        assert_eq!(payload, b"claim-me:7");

        // Once per second, not once per tick.
        r.node.poll(tick + Duration::from_millis(100));
        assert!(r.hub.poll_recv().is_none());
        r.node.poll(tick + Duration::from_secs(1));
        assert!(r.hub.poll_recv().is_some());
    }

    #[test]
    fn test_accept_persists_hub_and_stops_broadcasts() {
        let mut r = rig(false);
        let start = Instant::now();
        for i in 0..4u64 {
            r.node
                .handle_press(CONTROL_INPUT, start + Duration::from_millis(i * 600));
        }
        let tick = start + Duration::from_secs(2);
        r.node.poll(tick);
        assert!(r.hub.poll_recv().is_some());

        r.node.handle_frame(HUB, ACCEPT_TOKEN.as_bytes(), tick);
        assert!(r.node.is_paired());

        // The pairing survives on disk.
        let stored = ConfigStore::new(&r.store_path).load_or_create().unwrap();
        assert_eq!(stored.paired_hub, Some(HUB));

        // No broadcast after the accept.
        r.node.poll(tick + Duration::from_secs(1));
        assert!(r.hub.poll_recv().is_none());
    }

    #[test]
    fn test_stale_accept_does_not_pair() {
        let mut r = rig(false);
        r.node
            .handle_frame(HUB, ACCEPT_TOKEN.as_bytes(), Instant::now());
        assert!(!r.node.is_paired());
    }

    // ==================== OTA and config commands ====================

    #[test]
    fn test_ota_command_arms_resume_and_requests_reboot() {
        let mut r = rig(true);
        let now = Instant::now();
        r.node.handle_frame(
            HUB,
            br#"{"CONFIG_CMD":"SET_WIFI_CONFIG","Did":7,"SSID":"net","Password":"pw"}"#,
            now,
        );
        assert!(r.hub.poll_recv().is_some(), "WIFI_OK acknowledged");

        r.node.handle_frame(
            HUB,
            br#"{"OTA_CMD":"WIFI_UPDATE","Did":7,"URL":"http://h/fw.bin"}"#,
            now,
        );
        let (_, payload) = r.hub.poll_recv().expect("OTA_READY sent");
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["OTA"], "OTA_READY");
        // The starting notice goes out before the radio falls silent.
        let (_, payload) = r.hub.poll_recv().expect("OTA_STARTING sent");
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["OTA"], "OTA_STARTING");
        assert!(r.node.reboot_requested());

        let stored = ConfigStore::new(&r.store_path).load_or_create().unwrap();
        assert!(stored.ota_resume.pending);
        assert_eq!(stored.ota_resume.url.as_deref(), Some("http://h/fw.bin"));
    }

    #[test]
    fn test_ota_stages_reported_after_radio_restore() {
        let mut r = rig(true);
        r.node
            .announce_ota_stage(&OtaStage::Downloading { total: 8192 });
        r.node.announce_ota_stage(&OtaStage::Flashing {
            written: 8192,
            total: 8192,
        });

        let (_, payload) = r.hub.poll_recv().expect("downloading status sent");
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["OTA"], "OTA_DOWNLOADING");
        assert_eq!(value["Msg"], "8192 bytes");

        let (_, payload) = r.hub.poll_recv().expect("flashing status sent");
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["OTA"], "OTA_FLASHING");
        assert_eq!(value["Msg"], "8192/8192 bytes");
    }

    #[test]
    fn test_ota_command_without_credentials_rejected() {
        let mut r = rig(true);
        r.node.handle_frame(
            HUB,
            br#"{"OTA_CMD":"WIFI_UPDATE","Did":7,"URL":"http://h/fw.bin"}"#,
            Instant::now(),
        );
        let (_, payload) = r.hub.poll_recv().expect("rejection sent");
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["OTA"], "OTA_REJECT");
        assert!(!r.node.reboot_requested());
    }

    #[test]
    fn test_set_device_id_acks_under_old_id_then_reboots() {
        let mut r = rig(true);
        r.node.handle_frame(
            HUB,
            br#"{"CONFIG_CMD":"SET_DEVICE_ID","Did":7,"DeviceId":9}"#,
            Instant::now(),
        );
        let (_, payload) = r.hub.poll_recv().expect("ack sent");
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["Did"], 7);
        assert_eq!(value["CONFIG"], "DEVICE_ID_OK");
        assert!(r.node.reboot_requested());

        let stored = ConfigStore::new(&r.store_path).load_or_create().unwrap();
        assert_eq!(stored.stable_id, 9);
    }

    #[test]
    fn test_set_gpio_updates_pins_and_reboots() {
        let mut r = rig(true);
        r.node.handle_frame(
            HUB,
            br#"{"CONFIG_CMD":"SET_GPIO_CONFIG","Did":7,"RedPin":14,"ButtonA":4}"#,
            Instant::now(),
        );
        let (_, payload) = r.hub.poll_recv().expect("ack sent");
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["CONFIG"], "GPIO_OK");
        assert!(r.node.reboot_requested());

        let stored = ConfigStore::new(&r.store_path).load_or_create().unwrap();
        assert_eq!(stored.pin_map.status_red, 14);
        assert_eq!(stored.pin_map.input_a, 4);
        // Untouched pins keep their values.
        assert_eq!(stored.pin_map.input_b, 33);
    }

    #[test]
    fn test_command_for_other_device_ignored() {
        let mut r = rig(true);
        r.node.handle_frame(
            HUB,
            br#"{"CONFIG_CMD":"SET_DEVICE_ID","Did":99,"DeviceId":9}"#,
            Instant::now(),
        );
        assert!(r.hub.poll_recv().is_none());
        assert!(!r.node.reboot_requested());
    }

    // ==================== Power ====================

    #[test]
    fn test_idle_node_sleeps_after_warning() {
        let mut r = rig(true);
        let start = Instant::now();
        r.node.poll(start);

        let warned = start + crate::protocol::constants::IDLE_TIMEOUT;
        assert!(!r.node.poll(warned).sleep);
        let asleep = warned + crate::protocol::constants::SLEEP_WARNING_DURATION;
        assert!(r.node.poll(asleep).sleep);
    }

    #[test]
    fn test_pending_ota_vetoes_sleep() {
        let mut r = rig(true);
        let start = Instant::now();
        r.node.handle_frame(
            HUB,
            br#"{"CONFIG_CMD":"SET_WIFI_CONFIG","Did":7,"SSID":"net","Password":"pw"}"#,
            start,
        );
        r.node.handle_frame(
            HUB,
            br#"{"OTA_CMD":"WIFI_UPDATE","Did":7,"URL":"http://h/fw.bin"}"#,
            start,
        );
        assert!(r.node.reboot_requested());

        // Even far past the idle deadline, the armed update holds the node
        // out of the sleep path.
        let deep_idle = start + crate::protocol::constants::IDLE_TIMEOUT * 2;
        let tick = r.node.poll(deep_idle);
        assert!(!tick.sleep);
        assert!(tick.reboot);
    }

    #[test]
    fn test_wake_press_sends_once_and_is_suppressed() {
        let mut r = rig(true);
        let now = Instant::now();
        r.node.handle_wake_press(1, now);
        let (_, payload) = r.hub.poll_recv().expect("wake event sent immediately");
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["Ans"], "B");

        // The main scan sees the same press held down; it must not re-send.
        r.node.handle_press(1, now + Duration::from_millis(20));
        let mut quiet = now;
        for _ in 0..600 {
            quiet += Duration::from_millis(1);
            r.node.poll(quiet);
        }
        assert!(r.hub.poll_recv().is_none());
    }

    #[test]
    fn test_resend_after_wake_press_replays_wake_event() {
        let mut r = rig(true);
        let now = Instant::now();
        r.node.handle_wake_press(2, now);
        let (_, first) = r.hub.poll_recv().expect("wake event sent");

        r.node.handle_frame(HUB, b"R", now);
        let (_, second) = pump_until_recv(&mut r, now);
        assert_eq!(first, second);
    }

    // ==================== Legacy flashing ====================

    #[test]
    fn test_legacy_chunks_stream_into_flash() {
        let mut r = rig(true);
        let now = Instant::now();
        r.node.handle_frame(HUB, &[0xE9, 0x01, 0x02], now);
        r.node.handle_frame(HUB, &[0x03, 0x04], now);
        // Chunks are accepted without an error status going out.
        assert!(r.hub.poll_recv().is_none());
    }
}
