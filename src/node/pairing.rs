//! Node side of the pairing protocol.
//!
//! Pairing is operator-initiated on the node: the designated input pressed
//! four times inside a rolling three-second window starts a claim. While
//! claiming, the node broadcasts its claim token once per second for up to
//! thirty seconds, then gives up silently. An accept token addressed to the
//! node while claiming ends the claim immediately; the controller persists
//! the hub's address and no further broadcast goes out that tick.

use crate::protocol::constants::{
    CLAIM_BROADCAST_INTERVAL, CLAIM_WINDOW, CONTROL_SEQUENCE_COUNT, CONTROL_SEQUENCE_WINDOW,
};
use log::info;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Detects the pairing control sequence on the designated input.
pub struct ClaimSequenceDetector {
    required: usize,
    window: Duration,
    presses: VecDeque<Instant>,
}

impl Default for ClaimSequenceDetector {
    fn default() -> Self {
        Self::new(CONTROL_SEQUENCE_COUNT, CONTROL_SEQUENCE_WINDOW)
    }
}

impl ClaimSequenceDetector {
    pub fn new(required: usize, window: Duration) -> Self {
        Self {
            required,
            window,
            presses: VecDeque::with_capacity(required),
        }
    }

    /// Register an accepted press on the designated input. Returns true when
    /// this press completes the sequence; the detector then resets.
    pub fn register_press(&mut self, now: Instant) -> bool {
        while let Some(first) = self.presses.front() {
            if now.duration_since(*first) > self.window {
                self.presses.pop_front();
            } else {
                break;
            }
        }
        self.presses.push_back(now);
        if self.presses.len() >= self.required {
            self.presses.clear();
            return true;
        }
        false
    }
}

/// What the claim machine wants done this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimAction {
    /// Broadcast the claim token now.
    Broadcast,
    /// Nothing due.
    Idle,
}

enum ClaimState {
    Idle,
    Claiming {
        started: Instant,
        last_broadcast: Option<Instant>,
    },
}

/// The node's claim state machine.
pub struct PairingClaim {
    state: ClaimState,
    interval: Duration,
    window: Duration,
}

impl Default for PairingClaim {
    fn default() -> Self {
        Self::new(CLAIM_BROADCAST_INTERVAL, CLAIM_WINDOW)
    }
}

impl PairingClaim {
    pub fn new(interval: Duration, window: Duration) -> Self {
        Self {
            state: ClaimState::Idle,
            interval,
            window,
        }
    }

    pub fn is_claiming(&self) -> bool {
        matches!(self.state, ClaimState::Claiming { .. })
    }

    /// Enter the claiming state. A repeat of the control sequence while
    /// already claiming restarts the window.
    pub fn start(&mut self, now: Instant) {
        info!("pairing claim started");
        self.state = ClaimState::Claiming {
            started: now,
            last_broadcast: None,
        };
    }

    /// Advance the machine. Returns [`ClaimAction::Broadcast`] when a claim
    /// token is due; the first broadcast goes out on the tick after
    /// [`start`](Self::start).
    pub fn poll(&mut self, now: Instant) -> ClaimAction {
        let ClaimState::Claiming {
            started,
            last_broadcast,
        } = &mut self.state
        else {
            return ClaimAction::Idle;
        };

        if now.duration_since(*started) >= self.window {
            info!("pairing claim window expired without an accept");
            self.state = ClaimState::Idle;
            return ClaimAction::Idle;
        }

        let due = match last_broadcast {
            None => true,
            Some(last) => now.duration_since(*last) >= self.interval,
        };
        if due {
            *last_broadcast = Some(now);
            ClaimAction::Broadcast
        } else {
            ClaimAction::Idle
        }
    }

    /// An accept token arrived. Returns true when the node was claiming
    /// (the accept is otherwise stale and ignored).
    pub fn handle_accept(&mut self) -> bool {
        if self.is_claiming() {
            info!("pairing accept received");
            self.state = ClaimState::Idle;
            true
        } else {
            false
        }
    }
}
