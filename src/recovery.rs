//! Bounded recovery policy for a lost clock connection.
//!
//! Recovery is the only automatic retry path in the system, gated on
//! being disconnected with a live transport, spaced by a minimum delay,
//! and capped by an attempt ceiling (0 = unlimited).

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RecoveryGate {
    max_attempts: u32,
    min_delay: Duration,
    attempts: u32,
    last_attempt: Option<Instant>,
}

impl RecoveryGate {
    pub fn new(max_attempts: u32, min_delay: Duration) -> Self {
        Self {
            max_attempts,
            min_delay,
            attempts: 0,
            last_attempt: None,
        }
    }

    /// Whether recovery makes sense at all right now. Spacing is checked
    /// separately in [`RecoveryGate::try_begin`].
    pub fn eligible(&self, clock_connected: bool, transport_up: bool, configuring: bool) -> bool {
        !clock_connected && transport_up && !configuring && self.under_ceiling()
    }

    /// Claims one attempt if the ceiling and the inter-attempt delay
    /// allow it. Claiming increments the counter even if the attempt then
    /// fails; only success resets it.
    pub fn try_begin(&mut self, now: Instant) -> bool {
        if !self.under_ceiling() {
            return false;
        }
        if let Some(last) = self.last_attempt
            && now.duration_since(last) < self.min_delay
        {
            return false;
        }
        self.attempts += 1;
        self.last_attempt = Some(now);
        true
    }

    pub fn record_success(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_attempt = None;
    }

    fn under_ceiling(&self) -> bool {
        self.max_attempts == 0 || self.attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spacing_limits_rapid_ticks_to_one_attempt() {
        let base = Instant::now();
        let mut gate = RecoveryGate::new(3, Duration::from_millis(1000));

        let mut attempts = 0;
        for tick in 0..5 {
            if gate.try_begin(base + Duration::from_millis(tick)) {
                attempts += 1;
            }
        }
        assert_eq!(attempts, 1);
    }

    #[test]
    fn ceiling_stops_spaced_attempts_at_three() {
        let base = Instant::now();
        let mut gate = RecoveryGate::new(3, Duration::from_millis(1000));

        let mut attempts = 0;
        for tick in 0..6 {
            if gate.try_begin(base + Duration::from_millis(tick * 1000)) {
                attempts += 1;
            }
        }
        assert_eq!(attempts, 3);
        assert!(!gate.eligible(false, true, false));
    }

    #[test]
    fn zero_ceiling_means_unlimited() {
        let base = Instant::now();
        let mut gate = RecoveryGate::new(0, Duration::from_millis(10));
        for tick in 0..20 {
            assert!(gate.try_begin(base + Duration::from_millis(tick * 10)));
        }
        assert_eq!(gate.attempts(), 20);
    }

    #[test]
    fn success_resets_the_counter() {
        let base = Instant::now();
        let mut gate = RecoveryGate::new(2, Duration::from_millis(10));
        assert!(gate.try_begin(base));
        assert!(gate.try_begin(base + Duration::from_millis(10)));
        assert!(!gate.try_begin(base + Duration::from_millis(20)));
        gate.record_success();
        assert!(gate.try_begin(base + Duration::from_millis(30)));
    }

    #[test]
    fn eligibility_requires_disconnected_clock_and_live_transport() {
        let gate = RecoveryGate::new(0, Duration::ZERO);
        assert!(gate.eligible(false, true, false));
        assert!(!gate.eligible(true, true, false));
        assert!(!gate.eligible(false, false, false));
        assert!(!gate.eligible(false, true, true));
    }
}
