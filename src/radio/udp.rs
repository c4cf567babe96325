//! UDP stand-in for the radio driver.
//!
//! Lets the hub and node binaries talk across processes during development.
//! A link address maps to a loopback UDP port: the last two address bytes
//! are the port, big-endian, so `00:00:00:00:1F:90` listens on 127.0.0.1:8080.
//! Broadcast fans out to every known peer (UDP loopback has no broadcast
//! worth modeling; a claiming node pre-peers the hub's well-known address).
//!
//! Datagrams carry the sender's 6-byte address followed by the payload, so
//! the receiver learns the link-level source just like the real driver
//! reports it.

use super::link::{check_payload, check_peer_capacity, RadioAddress, RadioError, RadioLink};
use crate::protocol::constants::RADIO_MTU;
use crate::radio::BROADCAST_ADDRESS;
use log::warn;
use std::collections::HashSet;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// Derive the loopback socket address for a link address.
fn socket_addr_for(addr: &RadioAddress) -> SocketAddr {
    let port = u16::from_be_bytes([addr[4], addr[5]]);
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// UDP-backed radio driver stand-in.
pub struct UdpRadio {
    socket: UdpSocket,
    address: RadioAddress,
    peers: HashSet<RadioAddress>,
}

impl UdpRadio {
    /// Bind the local endpoint for the given link address.
    pub fn bind(address: RadioAddress) -> io::Result<Self> {
        let socket = UdpSocket::bind(socket_addr_for(&address))?;
        socket.set_read_timeout(Some(Duration::from_millis(10)))?;
        Ok(Self {
            socket,
            address,
            peers: HashSet::new(),
        })
    }

    /// Poll for one received frame. Returns `None` when nothing is pending.
    pub fn poll_recv(&mut self) -> Option<(RadioAddress, Vec<u8>)> {
        let mut buf = [0u8; 6 + RADIO_MTU];
        match self.socket.recv_from(&mut buf) {
            Ok((len, _)) if len > 6 => {
                let mut from = [0u8; 6];
                from.copy_from_slice(&buf[..6]);
                Some((from, buf[6..len].to_vec()))
            }
            Ok(_) => None,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => None,
            Err(e) => {
                warn!("UDP radio recv error: {}", e);
                None
            }
        }
    }

    /// Clone the underlying socket so a dedicated thread can block on
    /// reception and feed the hub's receive callback.
    pub fn try_clone_socket(&self) -> io::Result<UdpSocket> {
        self.socket.try_clone()
    }

    /// Decode a raw datagram into (source address, payload).
    pub fn decode_datagram(buf: &[u8]) -> Option<(RadioAddress, Vec<u8>)> {
        if buf.len() <= 6 {
            return None;
        }
        let mut from = [0u8; 6];
        from.copy_from_slice(&buf[..6]);
        Some((from, buf[6..].to_vec()))
    }

    fn send_to(&self, dest: &RadioAddress, payload: &[u8]) -> Result<(), RadioError> {
        let mut datagram = Vec::with_capacity(6 + payload.len());
        datagram.extend_from_slice(&self.address);
        datagram.extend_from_slice(payload);
        self.socket
            .send_to(&datagram, socket_addr_for(dest))
            .map_err(|e| RadioError::Driver(e.to_string()))?;
        Ok(())
    }
}

impl RadioLink for UdpRadio {
    fn local_address(&self) -> RadioAddress {
        self.address
    }

    fn add_peer(&mut self, addr: RadioAddress) -> Result<(), RadioError> {
        if self.peers.contains(&addr) {
            return Ok(());
        }
        check_peer_capacity(self.peers.len())?;
        self.peers.insert(addr);
        Ok(())
    }

    fn has_peer(&self, addr: &RadioAddress) -> bool {
        self.peers.contains(addr)
    }

    fn send(&mut self, dest: RadioAddress, payload: &[u8]) -> Result<(), RadioError> {
        check_payload(payload)?;
        if dest == BROADCAST_ADDRESS {
            for peer in self.peers.clone() {
                self.send_to(&peer, payload)?;
            }
            return Ok(());
        }
        if !self.peers.contains(&dest) {
            return Err(RadioError::UnknownPeer(dest));
        }
        self.send_to(&dest, payload)
    }
}
