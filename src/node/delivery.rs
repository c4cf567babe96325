//! Event delivery from node to hub: debounce, framing, jittered retries.
//!
//! A press survives the 500 ms per-input debounce, gets framed per the
//! session state, and is handed to the [`DeliverySlot`], which makes up to
//! three send attempts. Each attempt is preceded by a randomized delay drawn
//! from a window that widens per attempt, so colliding nodes spread out.
//! After the third driver-level failure the event is given up silently; the
//! hub's single-character resend token re-arms the slot for an immediate
//! retransmission of the last value, bypassing the jitter.

use crate::protocol::constants::{DEBOUNCE_INTERVAL, MAX_SEND_ATTEMPTS};
use crate::protocol::EventFrame;
use std::time::{Duration, Instant};

/// Per-input debounce state.
pub struct Debouncer {
    interval: Duration,
    last_accepted: [Option<Instant>; 4],
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEBOUNCE_INTERVAL)
    }
}

impl Debouncer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_accepted: [None; 4],
        }
    }

    /// Whether a press on `input` is accepted at `now`. Accepted presses
    /// start the input's dead time.
    pub fn accept(&mut self, input: usize, now: Instant) -> bool {
        let Some(slot) = self.last_accepted.get_mut(input) else {
            return false;
        };
        if let Some(last) = *slot {
            if now.duration_since(last) < self.interval {
                return false;
            }
        }
        *slot = Some(now);
        true
    }

    /// Mark an input as just accepted without delivering anything. Used
    /// after a wake press has already been sent so the main scan does not
    /// re-trigger on the same physical press.
    pub fn suppress(&mut self, input: usize, now: Instant) {
        if let Some(slot) = self.last_accepted.get_mut(input) {
            *slot = Some(now);
        }
    }
}

/// Retry timing parameters.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u8,
    /// Jitter window for the first attempt.
    pub base_window: Duration,
    /// Window growth per further attempt.
    pub window_step: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: MAX_SEND_ATTEMPTS,
            base_window: Duration::from_millis(50),
            window_step: Duration::from_millis(100),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".into());
        }
        Ok(())
    }

    /// Upper bound of the jitter window for a 0-based attempt index.
    fn window(&self, attempt: u8) -> Duration {
        self.base_window + self.window_step * u32::from(attempt)
    }
}

/// Outcome of a send attempt, reported back by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The driver accepted the frame.
    Accepted,
    /// The driver refused; another attempt may follow.
    Failed,
}

/// One in-flight event and its retry schedule.
pub struct DeliverySlot {
    config: RetryConfig,
    current: Option<Pending>,
    /// Last frame handed to the slot, kept for resend requests.
    last_frame: Option<EventFrame>,
    /// Set on the first accepted send, cleared by the controller when the
    /// orchestrator's reply arrives.
    pub response_outstanding: bool,
    rng_state: u32,
}

struct Pending {
    frame: EventFrame,
    attempt: u8,
    send_at: Instant,
}

impl DeliverySlot {
    pub fn new(config: RetryConfig, seed: u32) -> Self {
        Self {
            config,
            current: None,
            last_frame: None,
            response_outstanding: false,
            rng_state: seed,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    pub fn last_frame(&self) -> Option<&EventFrame> {
        self.last_frame.as_ref()
    }

    /// Schedule a new event. A still-pending previous event is replaced;
    /// the freshest press wins.
    pub fn submit(&mut self, frame: EventFrame, now: Instant) {
        let send_at = now + self.jitter(0);
        self.last_frame = Some(frame.clone());
        self.current = Some(Pending {
            frame,
            attempt: 0,
            send_at,
        });
    }

    /// Drop the in-flight event, if any. Entering a pairing claim cancels
    /// whatever the control-sequence presses queued on the way in.
    pub fn cancel_pending(&mut self) {
        self.current = None;
    }

    /// Record a frame sent outside the slot's schedule, such as the wake
    /// path's direct transmit. Keeps resend requests pointing at the newest
    /// event and marks its response as awaited.
    pub fn note_sent(&mut self, frame: EventFrame) {
        self.last_frame = Some(frame);
        self.response_outstanding = true;
    }

    /// Re-arm the last frame for an immediate send (hub resend request).
    pub fn resend_last(&mut self, now: Instant) -> bool {
        let Some(frame) = self.last_frame.clone() else {
            return false;
        };
        self.current = Some(Pending {
            frame,
            attempt: 0,
            send_at: now,
        });
        true
    }

    /// The frame to transmit this tick, if its delay has elapsed.
    pub fn due(&self, now: Instant) -> Option<&EventFrame> {
        let pending = self.current.as_ref()?;
        (now >= pending.send_at).then_some(&pending.frame)
    }

    /// Record the outcome of the attempt just made for the due frame.
    pub fn record_outcome(&mut self, outcome: AttemptOutcome, now: Instant) {
        let Some(mut pending) = self.current.take() else {
            return;
        };
        match outcome {
            AttemptOutcome::Accepted => {
                self.response_outstanding = true;
            }
            AttemptOutcome::Failed => {
                pending.attempt += 1;
                if pending.attempt >= self.config.max_attempts {
                    log::warn!(
                        "giving up on event after {} attempts",
                        self.config.max_attempts
                    );
                    return;
                }
                pending.send_at = now + self.jitter(pending.attempt);
                self.current = Some(pending);
            }
        }
    }

    /// Randomized delay in `[0, window(attempt)]`.
    fn jitter(&mut self, attempt: u8) -> Duration {
        let window = self.config.window(attempt).as_millis() as u32;
        if window == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(u64::from(self.next_random() % (window + 1)))
    }

    /// LCG with Numerical Recipes parameters; plenty for backoff jitter.
    fn next_random(&mut self) -> u32 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(1664525)
            .wrapping_add(1013904223);
        self.rng_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> EventFrame {
        EventFrame::PreSession {
            stable_id: 7,
            key: 'A',
        }
    }

    fn slot() -> DeliverySlot {
        DeliverySlot::new(RetryConfig::default(), 0x1234)
    }

    /// Drive time forward until the pending frame is due.
    fn next_due(slot: &DeliverySlot, mut now: Instant) -> Instant {
        for _ in 0..10_000 {
            if slot.due(now).is_some() {
                return now;
            }
            now += Duration::from_millis(1);
        }
        panic!("frame never came due");
    }

    // ==================== Debounce ====================

    #[test]
    fn test_debounce_rejects_rapid_repeat() {
        let mut deb = Debouncer::default();
        let start = Instant::now();
        assert!(deb.accept(0, start));
        assert!(!deb.accept(0, start + Duration::from_millis(499)));
        assert!(deb.accept(0, start + Duration::from_millis(500)));
    }

    #[test]
    fn test_debounce_is_per_input() {
        let mut deb = Debouncer::default();
        let start = Instant::now();
        assert!(deb.accept(0, start));
        assert!(deb.accept(1, start));
    }

    #[test]
    fn test_suppress_blocks_next_scan() {
        let mut deb = Debouncer::default();
        let start = Instant::now();
        deb.suppress(2, start);
        assert!(!deb.accept(2, start + Duration::from_millis(10)));
        assert!(deb.accept(2, start + Duration::from_millis(600)));
    }

    #[test]
    fn test_out_of_range_input_rejected() {
        let mut deb = Debouncer::default();
        assert!(!deb.accept(4, Instant::now()));
    }

    // ==================== Retry schedule ====================

    #[test]
    fn test_attempts_bounded_at_three() {
        let mut s = slot();
        let mut now = Instant::now();
        s.submit(frame(), now);

        for _ in 0..3 {
            now = next_due(&s, now);
            s.record_outcome(AttemptOutcome::Failed, now);
        }
        // Fourth attempt never scheduled.
        assert!(!s.is_busy());
        assert!(s.due(now + Duration::from_secs(10)).is_none());
        assert!(!s.response_outstanding);
    }

    #[test]
    fn test_jitter_windows_widen_per_attempt() {
        let config = RetryConfig::default();
        // Each attempt's delay is bounded by its window; the bounds are
        // strictly non-decreasing.
        for attempt in 0..2u8 {
            assert!(config.window(attempt) <= config.window(attempt + 1));
        }

        let mut s = slot();
        let mut now = Instant::now();
        s.submit(frame(), now);
        let mut previous_bound = config.window(0);
        for attempt in 1..3u8 {
            now = next_due(&s, now);
            s.record_outcome(AttemptOutcome::Failed, now);
            let bound = config.window(attempt);
            assert!(bound >= previous_bound);
            // The rescheduled send lands inside the attempt's window.
            let due_at = next_due(&s, now);
            assert!(due_at.duration_since(now) <= bound);
            previous_bound = bound;
        }
    }

    #[test]
    fn test_accepted_send_sets_response_outstanding() {
        let mut s = slot();
        let now = Instant::now();
        s.submit(frame(), now);
        let due_at = next_due(&s, now);
        s.record_outcome(AttemptOutcome::Accepted, due_at);

        assert!(s.response_outstanding);
        assert!(!s.is_busy());
    }

    #[test]
    fn test_resend_request_bypasses_jitter() {
        let mut s = slot();
        let now = Instant::now();
        s.submit(frame(), now);
        let due_at = next_due(&s, now);
        s.record_outcome(AttemptOutcome::Accepted, due_at);

        let later = due_at + Duration::from_secs(2);
        assert!(s.resend_last(later));
        // Immediately due, same frame.
        assert_eq!(s.due(later), Some(&frame()));
    }

    #[test]
    fn test_resend_without_history_is_refused() {
        let mut s = slot();
        assert!(!s.resend_last(Instant::now()));
    }

    #[test]
    fn test_note_sent_updates_resend_history() {
        let mut s = slot();
        let now = Instant::now();
        s.submit(frame(), now);
        let due_at = next_due(&s, now);
        s.record_outcome(AttemptOutcome::Accepted, due_at);

        // A directly-transmitted frame supersedes the scheduled history.
        let wake = EventFrame::PreSession {
            stable_id: 7,
            key: 'C',
        };
        s.note_sent(wake.clone());
        assert!(s.response_outstanding);

        let later = due_at + Duration::from_secs(1);
        assert!(s.resend_last(later));
        assert_eq!(s.due(later), Some(&wake));
    }

    #[test]
    fn test_fresh_press_replaces_pending_event() {
        let mut s = slot();
        let now = Instant::now();
        s.submit(frame(), now);
        let replacement = EventFrame::PreSession {
            stable_id: 7,
            key: 'B',
        };
        s.submit(replacement.clone(), now);
        let due_at = next_due(&s, now);
        assert_eq!(s.due(due_at), Some(&replacement));
    }

    #[test]
    fn test_cancel_drops_pending_but_keeps_history() {
        let mut s = slot();
        let now = Instant::now();
        s.submit(frame(), now);
        s.cancel_pending();
        assert!(!s.is_busy());
        assert!(s.due(now + Duration::from_secs(1)).is_none());
        // The last frame stays available for a resend request.
        assert!(s.resend_last(now));
    }

    #[test]
    fn test_retry_config_validation() {
        let mut config = RetryConfig::default();
        assert!(config.validate().is_ok());
        config.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
