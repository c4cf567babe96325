//! Node power management: idle tracking, sleep warning, deep-sleep entry,
//! and wake-source resolution.
//!
//! Three minutes without activity starts a ten-second warning (slow status
//! blink); surviving the warning means deep sleep, with the input pins
//! reconfigured as pull-up wake-on-low sources. Any radio message or
//! accepted press is activity and cancels a pending warning. OTA activity
//! and an active pairing claim veto sleep unconditionally.
//!
//! On wake the hardware reports a status bitmask naming the wake pin;
//! re-reading the pins directly is only a fallback for when the mask is
//! ambiguous, because by then the operator may have released the button.

use crate::node::config_store::PinMap;
use crate::protocol::constants::{IDLE_TIMEOUT, SLEEP_WARNING_DURATION, WARNING_BLINK_PERIOD};
use log::{debug, info};
use std::time::{Duration, Instant};

/// Power manager tunables.
#[derive(Debug, Clone)]
pub struct PowerConfig {
    pub idle_timeout: Duration,
    pub warning_duration: Duration,
    pub blink_period: Duration,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: IDLE_TIMEOUT,
            warning_duration: SLEEP_WARNING_DURATION,
            blink_period: WARNING_BLINK_PERIOD,
        }
    }
}

impl PowerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.blink_period.is_zero() {
            return Err("blink_period must be positive".into());
        }
        if self.warning_duration.is_zero() {
            return Err("warning_duration must be positive".into());
        }
        Ok(())
    }
}

/// What the main loop should do this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    None,
    /// The warning phase just began; start blinking.
    EnterWarning,
    /// The warning ran out; enter deep sleep now.
    Sleep,
}

enum PowerState {
    Active,
    Warning { since: Instant },
}

/// Idle and sleep-warning state machine.
pub struct PowerManager {
    config: PowerConfig,
    state: PowerState,
    last_activity: Instant,
}

impl PowerManager {
    pub fn new(config: PowerConfig, now: Instant) -> Self {
        Self {
            config,
            state: PowerState::Active,
            last_activity: now,
        }
    }

    /// Record activity: resets the idle timer and cancels a pending warning.
    pub fn note_activity(&mut self, now: Instant) {
        if matches!(self.state, PowerState::Warning { .. }) {
            debug!("sleep warning cancelled by activity");
        }
        self.state = PowerState::Active;
        self.last_activity = now;
    }

    pub fn is_warning(&self) -> bool {
        matches!(self.state, PowerState::Warning { .. })
    }

    /// Advance the machine. `veto` holds the node awake regardless of idle
    /// time (OTA in flight, pairing claim active).
    pub fn poll(&mut self, now: Instant, veto: bool) -> PowerAction {
        if veto {
            // A vetoed node is by definition busy.
            self.note_activity(now);
            return PowerAction::None;
        }
        match self.state {
            PowerState::Active => {
                if now.duration_since(self.last_activity) >= self.config.idle_timeout {
                    info!("idle timeout reached, starting sleep warning");
                    self.state = PowerState::Warning { since: now };
                    return PowerAction::EnterWarning;
                }
                PowerAction::None
            }
            PowerState::Warning { since } => {
                if now.duration_since(since) >= self.config.warning_duration {
                    info!("sleep warning elapsed, entering deep sleep");
                    return PowerAction::Sleep;
                }
                PowerAction::None
            }
        }
    }

    /// Blink phase during the warning: true while the light should be on.
    pub fn warning_blink_on(&self, now: Instant) -> bool {
        let PowerState::Warning { since } = self.state else {
            return false;
        };
        let elapsed = now.duration_since(since).as_millis();
        let period = self.config.blink_period.as_millis();
        (elapsed / (period / 2)) % 2 == 0
    }
}

/// Identify which input woke the node.
///
/// `wake_mask` has one bit per GPIO number. A mask naming exactly one
/// configured input is authoritative; otherwise each input's level is
/// re-read through `is_pressed` and the first pressed input wins.
pub fn resolve_wake_input(
    wake_mask: u64,
    pins: &PinMap,
    is_pressed: impl Fn(u8) -> bool,
) -> Option<usize> {
    let mut matched = None;
    for index in 0..4 {
        let pin = pins.input_pin(index)?;
        if wake_mask & (1u64 << pin) != 0 {
            if matched.is_some() {
                matched = None;
                break;
            }
            matched = Some(index);
        }
    }
    if matched.is_some() {
        return matched;
    }

    debug!("ambiguous wake mask {:#x}, re-reading input pins", wake_mask);
    (0..4).find(|&index| pins.input_pin(index).is_some_and(&is_pressed))
}
