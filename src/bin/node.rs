//! Node process for host development.
//!
//! Simulates one keypad node: stdin lines `a`..`d` press the corresponding
//! input, the UDP stand-in driver carries the radio protocol, and the
//! firmware partition is a file next to the config store. An outer loop
//! models the reboot cycle; a pending OTA resume runs before the radio is
//! brought up, exactly as on hardware.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin node -- [port] [hub-port]
//! ```

use keymesh_esp32::node::controller::{LogLights, CONTROL_INPUT};
use keymesh_esp32::node::ota::{self, FileFlashTarget, HostNetwork, OtaConfig};
use keymesh_esp32::node::{ConfigStore, NodeController};
use keymesh_esp32::radio::{RadioAddress, RadioLink, UdpRadio};
use log::{error, info, warn};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const DEFAULT_PORT: u16 = 47001;
const DEFAULT_HUB_PORT: u16 = 47000;

fn address_for_port(port: u16) -> RadioAddress {
    let [hi, lo] = port.to_be_bytes();
    [0, 0, 0, 0, hi, lo]
}

fn default_state_dir() -> PathBuf {
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".keymesh-esp32"),
        Err(_) => std::env::temp_dir().join("keymesh-esp32"),
    }
}

/// Why one boot cycle ended.
enum BootExit {
    Reboot,
    Quit,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let port = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let hub_port = std::env::args()
        .nth(2)
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_HUB_PORT);
    let state_dir = default_state_dir();
    let store_path = state_dir.join(format!("node-{}.json", port));
    let firmware_path = state_dir.join(format!("node-{}-firmware.bin", port));

    // Stdin lives across simulated reboots, like the physical buttons do.
    let (line_tx, line_rx) = crossbeam_channel::unbounded::<String>();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    info!("=== keymesh node starting on port {} ===", port);
    info!("config store: {:?}", store_path);

    loop {
        match boot_once(port, hub_port, &store_path, &firmware_path, &line_rx) {
            BootExit::Reboot => info!("--- reboot ---"),
            BootExit::Quit => break,
        }
    }
}

/// One boot cycle: run a pending OTA resume if armed, then the main loop
/// until a reboot is requested, sleep wakes into a new cycle, or stdin
/// closes.
fn boot_once(
    port: u16,
    hub_port: u16,
    store_path: &Path,
    firmware_path: &Path,
    lines: &crossbeam_channel::Receiver<String>,
) -> BootExit {
    let store = ConfigStore::new(store_path);
    let mut config = match store.load_or_create() {
        Ok(config) => config,
        Err(e) => {
            error!("config store unusable: {}", e);
            std::process::exit(1);
        }
    };

    // The OTA network phase runs before any radio bring-up. Milestones are
    // buffered here and reported once the radio is back: first download
    // acceptance, then the latest flashing high-water mark.
    let mut ota_stages: Vec<ota::OtaStage> = Vec::new();
    let ota_result = {
        let mut network = HostNetwork;
        let mut flash = FileFlashTarget::new(firmware_path);
        ota::run_resume(
            &store,
            &mut config,
            &mut network,
            &mut flash,
            &OtaConfig::default(),
            |stage| match stage {
                ota::OtaStage::Downloading { .. } => ota_stages.push(stage),
                ota::OtaStage::Flashing { .. } => {
                    if let Some(last @ ota::OtaStage::Flashing { .. }) = ota_stages.last_mut() {
                        *last = stage;
                    } else {
                        ota_stages.push(stage);
                    }
                }
            },
        )
    };

    let radio = match UdpRadio::bind(address_for_port(port)) {
        Ok(radio) => radio,
        Err(e) => {
            error!("cannot bind radio port {}: {}", port, e);
            std::process::exit(1);
        }
    };

    let mut node = NodeController::new(
        radio,
        store,
        config,
        Box::new(LogLights),
        Box::new(FileFlashTarget::new(firmware_path)),
        Instant::now(),
    );
    info!(
        "node up: stable id {}, paired: {}",
        node.stable_id(),
        node.is_paired()
    );

    // Claim broadcasts fan out over the peer table; an unpaired node needs
    // the hub's well-known address in it before pairing can reach anything.
    if !node.is_paired() {
        if let Err(e) = node.radio_mut().add_peer(address_for_port(hub_port)) {
            warn!("cannot pre-peer hub port {}: {}", hub_port, e);
        }
    }

    if let Some(result) = ota_result {
        for stage in &ota_stages {
            node.announce_ota_stage(stage);
        }
        node.announce_ota_result(&result);
        match result {
            Ok(outcome) => {
                info!("OTA applied: {} bytes, sha256 {}", outcome.bytes, outcome.digest)
            }
            Err(e) => warn!("OTA failed: {}", e),
        }
        // The post-update reboot.
        return BootExit::Reboot;
    }

    loop {
        let now = Instant::now();

        // Radio reception is polled on the node.
        while let Some((source, payload)) = node.radio_mut().poll_recv() {
            node.handle_frame(source, &payload, now);
        }

        while let Ok(line) = lines.try_recv() {
            match parse_input(&line) {
                Some(InputLine::Press(input)) => node.handle_press(input, now),
                Some(InputLine::Quit) => return BootExit::Quit,
                None => warn!("unknown input {:?} (use a-d, q)", line.trim()),
            }
        }

        let tick = node.poll(now);
        if tick.reboot {
            return BootExit::Reboot;
        }
        if tick.sleep {
            return simulate_deep_sleep(node, lines);
        }

        std::thread::sleep(Duration::from_millis(10));
    }
}

enum InputLine {
    Press(usize),
    Quit,
}

fn parse_input(line: &str) -> Option<InputLine> {
    match line.trim() {
        "a" => Some(InputLine::Press(0)),
        "b" => Some(InputLine::Press(1)),
        "c" => Some(InputLine::Press(2)),
        "d" => Some(InputLine::Press(CONTROL_INPUT)),
        "q" => Some(InputLine::Quit),
        "" => None,
        _ => None,
    }
}

/// Host stand-in for deep sleep: block until a key arrives, deliver it
/// through the wake path, then reboot into a fresh cycle.
fn simulate_deep_sleep(
    mut node: NodeController<UdpRadio>,
    lines: &crossbeam_channel::Receiver<String>,
) -> BootExit {
    info!("entering deep sleep (press a-d to wake, q to quit)");
    loop {
        let Ok(line) = lines.recv() else {
            return BootExit::Quit;
        };
        let input = match parse_input(&line) {
            Some(InputLine::Press(input)) => input,
            Some(InputLine::Quit) => return BootExit::Quit,
            None => continue,
        };
        info!("woke on input {}", input);
        node.handle_wake_press(input, Instant::now());
        // Let the wake event's send settle before the simulated reboot.
        for _ in 0..10 {
            node.poll(Instant::now());
            std::thread::sleep(Duration::from_millis(10));
        }
        return BootExit::Reboot;
    }
}
