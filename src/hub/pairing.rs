//! Hub side of the pairing protocol: the single pending-claim slot.
//!
//! The hub never auto-accepts. A claim opens a 30-second operator window and
//! prints a prompt over the host link; only an affirmative answer inside the
//! window sends the accept token. The prompt text is part of the external
//! contract: the orchestrator greps for these exact lines, so they are not
//! free to reword.
//!
//! This module owns the slot state only. Emitting the prompt, sending the
//! accept token, and adding the claimant as a radio peer are the
//! controller's job; the slot tells it when.

use crate::protocol::constants::PAIRING_PROMPT_TIMEOUT;
use crate::radio::{format_address, RadioAddress};
use log::{info, warn};
use std::time::{Duration, Instant};

/// An outstanding pairing claim awaiting the operator's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPairing {
    pub stable_id: u32,
    pub radio_address: RadioAddress,
    pub requested_at: Instant,
}

/// What the slot wants the controller to do after an operator answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerOutcome {
    /// Send exactly one accept token to this claimant.
    Accept {
        stable_id: u32,
        radio_address: RadioAddress,
    },
    /// The claim was declined; nothing goes out.
    Reject,
    /// No claim was pending; the line was not a pairing answer.
    NoPending,
}

/// Single-slot pairing state.
#[derive(Default)]
pub struct PairingSlot {
    pending: Option<PendingPairing>,
    timeout: Option<Duration>,
}

impl PairingSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the operator window (tests).
    #[cfg(test)]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            pending: None,
            timeout: Some(timeout),
        }
    }

    fn window(&self) -> Duration {
        self.timeout.unwrap_or(PAIRING_PROMPT_TIMEOUT)
    }

    pub fn pending(&self) -> Option<&PendingPairing> {
        self.pending.as_ref()
    }

    /// Offer a received claim. Returns the prompt to print when the slot was
    /// free; while a claim is pending every further claim is ignored,
    /// including repeats from the same node (the window is not restarted).
    pub fn offer_claim(
        &mut self,
        stable_id: u32,
        radio_address: RadioAddress,
        now: Instant,
    ) -> Option<String> {
        if let Some(pending) = &self.pending {
            info!(
                "ignoring claim from {} while claim from {} is pending",
                stable_id, pending.stable_id
            );
            return None;
        }
        self.pending = Some(PendingPairing {
            stable_id,
            radio_address,
            requested_at: now,
        });
        Some(prompt_text(stable_id, &radio_address))
    }

    /// Process an operator line. `Y`/`YES` (any case) accepts; anything else
    /// rejects. Either way the slot is cleared.
    pub fn answer(&mut self, line: &str) -> AnswerOutcome {
        let Some(pending) = self.pending.take() else {
            return AnswerOutcome::NoPending;
        };
        let answer = line.trim().to_ascii_uppercase();
        if answer == "Y" || answer == "YES" {
            info!("pairing accepted for device {}", pending.stable_id);
            AnswerOutcome::Accept {
                stable_id: pending.stable_id,
                radio_address: pending.radio_address,
            }
        } else {
            info!("pairing rejected for device {}", pending.stable_id);
            AnswerOutcome::Reject
        }
    }

    /// Expire a pending claim whose operator window has elapsed. Returns
    /// true when a claim was just dropped.
    pub fn poll(&mut self, now: Instant) -> bool {
        let expired = match &self.pending {
            Some(p) => now.duration_since(p.requested_at) >= self.window(),
            None => false,
        };
        if expired {
            let pending = self.pending.take().unwrap();
            warn!(
                "pairing request from device {} timed out without an answer",
                pending.stable_id
            );
        }
        expired
    }
}

/// The operator prompt. Line contents are grepped by the orchestrator.
fn prompt_text(stable_id: u32, radio_address: &RadioAddress) -> String {
    format!(
        "\n*** PAIRING REQUEST RECEIVED ***\n\
         Device ID: {}\n\
         MAC Address: {}\n\
         Do you want to become the mother for this device?\n\
         Type 'Y' to accept or anything else to ignore:",
        stable_id,
        format_address(radio_address)
    )
}
