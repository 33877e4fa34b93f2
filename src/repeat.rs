//! Hold-repeat synthesis for the five main buttons.
//!
//! While the same main-button combination stays held across polls, a
//! repeat fires after 800 ms, then every 400 ms, with a running count.
//! Any change in the held combination, a full release, or a discrete
//! button event resets tracking. The lever and on/off button never
//! repeat.

use std::time::{Duration, Instant};

const FIRST_REPEAT: Duration = Duration::from_millis(800);
const NEXT_REPEAT: Duration = Duration::from_millis(400);

#[derive(Debug)]
pub struct RepeatTracker {
    active: bool,
    held: u8,
    since: Instant,
    count: u32,
}

impl RepeatTracker {
    pub fn new() -> Self {
        Self {
            active: false,
            held: 0,
            since: Instant::now(),
            count: 0,
        }
    }

    /// Feeds the current main-button state (already masked to the five
    /// repeating buttons). Returns `(mask, count)` when a repeat fires.
    pub fn poll(&mut self, main_state: u8, now: Instant) -> Option<(u8, u32)> {
        if main_state == 0 {
            self.reset();
            return None;
        }

        if !self.active {
            // First sighting of a hold: start tracking, no event yet.
            self.active = true;
            self.held = main_state;
            self.since = now;
            self.count = 0;
            return None;
        }

        if self.held != main_state {
            // The combination changed mid-hold.
            self.reset();
            return None;
        }

        let threshold = if self.count == 0 { FIRST_REPEAT } else { NEXT_REPEAT };
        if now.duration_since(self.since) > threshold {
            self.count += 1;
            self.since = now;
            return Some((self.held, self.count));
        }
        None
    }

    /// Drops tracking; also called whenever a discrete button event is
    /// forwarded.
    pub fn reset(&mut self) {
        self.active = false;
        self.held = 0;
        self.count = 0;
    }
}

impl Default for RepeatTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(base: Instant, ms: u64) -> Instant {
        base + Duration::from_millis(ms)
    }

    #[test]
    fn repeats_on_the_800_400_schedule() {
        let base = Instant::now();
        let mut tracker = RepeatTracker::new();

        // Held continuously for 2s, polled every millisecond: repeats
        // land just past 800, 1200, 1600 and 2000 ms.
        let mut fired = Vec::new();
        for ms in 0..=2004 {
            if let Some((mask, count)) = tracker.poll(0x04, at(base, ms)) {
                fired.push((ms, mask, count));
            }
        }
        assert_eq!(
            fired,
            vec![(801, 0x04, 1), (1202, 0x04, 2), (1603, 0x04, 3), (2004, 0x04, 4)]
        );
    }

    #[test]
    fn release_and_repress_restarts_at_800() {
        let base = Instant::now();
        let mut tracker = RepeatTracker::new();

        assert_eq!(tracker.poll(0x02, at(base, 0)), None);
        assert_eq!(tracker.poll(0x02, at(base, 900)), Some((0x02, 1)));
        // Release, then press again: back to the long threshold.
        assert_eq!(tracker.poll(0x00, at(base, 950)), None);
        assert_eq!(tracker.poll(0x02, at(base, 1000)), None);
        assert_eq!(tracker.poll(0x02, at(base, 1500)), None);
        assert_eq!(tracker.poll(0x02, at(base, 1801)), Some((0x02, 1)));
    }

    #[test]
    fn combination_change_resets() {
        let base = Instant::now();
        let mut tracker = RepeatTracker::new();

        assert_eq!(tracker.poll(0x01, at(base, 0)), None);
        assert_eq!(tracker.poll(0x03, at(base, 900)), None); // plus joined in
        // Tracking restarts with the new combination on the next poll.
        assert_eq!(tracker.poll(0x03, at(base, 901)), None);
        assert_eq!(tracker.poll(0x03, at(base, 1701)), None);
        assert_eq!(tracker.poll(0x03, at(base, 1702)), Some((0x03, 1)));
    }

    #[test]
    fn discrete_event_reset_restarts_tracking() {
        let base = Instant::now();
        let mut tracker = RepeatTracker::new();

        assert_eq!(tracker.poll(0x10, at(base, 0)), None);
        tracker.reset();
        assert_eq!(tracker.poll(0x10, at(base, 900)), None);
        assert_eq!(tracker.poll(0x10, at(base, 1700)), None);
        assert_eq!(tracker.poll(0x10, at(base, 1701)), Some((0x10, 1)));
    }
}
