//! Hub process for host development.
//!
//! Speaks the line-oriented host protocol on stdin/stdout and the radio
//! protocol over the UDP stand-in driver. A dedicated thread blocks on the
//! socket and plays the role of the driver's receive callback: its only
//! action is appending to the bounded inbound queue.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin hub -- [port]
//! ```

use keymesh_esp32::hub::{inbound_queue, HubController};
use keymesh_esp32::radio::{RadioAddress, UdpRadio};
use log::{error, info, warn};
use std::io::BufRead;
use std::time::{Duration, Instant};

const DEFAULT_PORT: u16 = 47000;

fn address_for_port(port: u16) -> RadioAddress {
    let [hi, lo] = port.to_be_bytes();
    [0, 0, 0, 0, hi, lo]
}

fn main() {
    // env_logger's own filter must admit debug records; the runtime gate is
    // the global max level, which the host's {"Debug":...} command flips.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    log::set_max_level(log::LevelFilter::Info);

    let port = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let address = address_for_port(port);

    info!("=== keymesh hub starting on port {} ===", port);

    let radio = match UdpRadio::bind(address) {
        Ok(radio) => radio,
        Err(e) => {
            error!("cannot bind radio port {}: {}", port, e);
            std::process::exit(1);
        }
    };

    let (producer, consumer) = inbound_queue();

    // Receive thread: the driver callback stand-in. Append to the queue,
    // nothing else.
    let rx_socket = match radio.try_clone_socket() {
        Ok(socket) => socket,
        Err(e) => {
            error!("cannot clone radio socket: {}", e);
            std::process::exit(1);
        }
    };
    std::thread::spawn(move || {
        let mut buf = [0u8; 1024];
        loop {
            match rx_socket.recv_from(&mut buf) {
                Ok((len, _)) => {
                    if let Some((source, payload)) = UdpRadio::decode_datagram(&buf[..len]) {
                        producer.enqueue(source, &payload);
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    warn!("radio receive error: {}", e);
                }
            }
        }
    });

    // Stdin thread: one host line per channel message.
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
                Err(e) => {
                    warn!("stdin read error: {}", e);
                    break;
                }
            }
        }
    });

    let mut hub = HubController::new(radio, consumer);
    info!("entering main loop (Ctrl+C to exit)");

    loop {
        let now = Instant::now();
        hub.poll(now);

        while let Ok(line) = line_rx.try_recv() {
            if line.trim().is_empty() {
                continue;
            }
            hub.handle_host_line(&line, now);
        }

        for line in hub.take_host_output() {
            println!("{}", line);
        }

        std::thread::sleep(Duration::from_millis(10));
    }
}
