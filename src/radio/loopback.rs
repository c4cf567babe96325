//! In-memory radio bus for host testing.
//!
//! A [`LoopbackBus`] connects any number of [`LoopbackRadio`] endpoints in
//! the same process. Delivery is synchronous and lossless unless an endpoint
//! is told to drop; retry behavior is exercised by failing the send side
//! instead of modeling channel loss.

use super::link::{check_payload, check_peer_capacity, RadioAddress, RadioError, RadioLink};
use crate::radio::BROADCAST_ADDRESS;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

/// A received datagram: source address and payload.
pub type ReceivedFrame = (RadioAddress, Vec<u8>);

/// Receive-side sink for one endpoint: either a queued inbox drained by
/// polling, or a callback fired on delivery (modeling the driver's
/// asynchronous receive interrupt on the hub).
enum Sink {
    Inbox(VecDeque<ReceivedFrame>),
    Callback(Box<dyn FnMut(RadioAddress, &[u8]) + Send>),
}

struct Endpoint {
    sink: Sink,
}

#[derive(Default)]
struct BusInner {
    endpoints: HashMap<RadioAddress, Endpoint>,
}

/// Shared in-memory bus connecting loopback endpoints.
#[derive(Clone, Default)]
pub struct LoopbackBus {
    inner: Arc<Mutex<BusInner>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new endpoint with the given address.
    pub fn endpoint(&self, address: RadioAddress) -> LoopbackRadio {
        let mut inner = self.inner.lock().expect("loopback bus lock");
        inner.endpoints.insert(
            address,
            Endpoint {
                sink: Sink::Inbox(VecDeque::new()),
            },
        );
        LoopbackRadio {
            bus: self.clone(),
            address,
            peers: HashSet::new(),
            fail_sends: false,
        }
    }

    fn deliver(&self, from: RadioAddress, to: RadioAddress, payload: &[u8]) {
        let mut inner = self.inner.lock().expect("loopback bus lock");
        if to == BROADCAST_ADDRESS {
            for (addr, ep) in inner.endpoints.iter_mut() {
                if *addr != from {
                    Self::push(ep, from, payload);
                }
            }
        } else if let Some(ep) = inner.endpoints.get_mut(&to) {
            Self::push(ep, from, payload);
        }
        // Unknown destination: dropped silently, exactly like the air.
    }

    fn push(ep: &mut Endpoint, from: RadioAddress, payload: &[u8]) {
        match &mut ep.sink {
            Sink::Inbox(q) => q.push_back((from, payload.to_vec())),
            Sink::Callback(cb) => cb(from, payload),
        }
    }

    fn pop(&self, address: &RadioAddress) -> Option<ReceivedFrame> {
        let mut inner = self.inner.lock().expect("loopback bus lock");
        match inner.endpoints.get_mut(address)?.sink {
            Sink::Inbox(ref mut q) => q.pop_front(),
            Sink::Callback(_) => None,
        }
    }

    fn set_callback(
        &self,
        address: &RadioAddress,
        callback: Box<dyn FnMut(RadioAddress, &[u8]) + Send>,
    ) {
        let mut inner = self.inner.lock().expect("loopback bus lock");
        if let Some(ep) = inner.endpoints.get_mut(address) {
            ep.sink = Sink::Callback(callback);
        }
    }
}

/// One device's view of the loopback bus.
pub struct LoopbackRadio {
    bus: LoopbackBus,
    address: RadioAddress,
    peers: HashSet<RadioAddress>,
    fail_sends: bool,
}

impl LoopbackRadio {
    /// Poll for a received frame (node-style reception).
    pub fn poll_recv(&mut self) -> Option<ReceivedFrame> {
        self.bus.pop(&self.address)
    }

    /// Route deliveries through a callback instead of the inbox
    /// (hub-style reception: the callback runs on delivery, outside the
    /// consumer's control flow).
    pub fn set_receive_callback<F>(&mut self, callback: F)
    where
        F: FnMut(RadioAddress, &[u8]) + Send + 'static,
    {
        self.bus.set_callback(&self.address, Box::new(callback));
    }

    /// Make every subsequent send fail at the driver (for retry tests).
    pub fn set_fail_sends(&mut self, fail: bool) {
        self.fail_sends = fail;
    }
}

impl RadioLink for LoopbackRadio {
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
        if self.fail_sends {
            return Err(RadioError::Driver("simulated send failure".into()));
        }
        if dest != BROADCAST_ADDRESS && !self.peers.contains(&dest) {
            return Err(RadioError::UnknownPeer(dest));
        }
        self.bus.deliver(self.address, dest, payload);
        Ok(())
    }
}
