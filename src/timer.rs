//! The single retransmission timer.
//!
//! A deadline plus a generation counter: every arm or disarm bumps the
//! generation, so a context that went to sleep against an earlier deadline
//! can tell on wakeup whether that arming is still current. This keeps one
//! timer per endpoint instead of a short-lived task per retransmission.

use std::time::Instant;

#[derive(Debug, Default)]
pub struct RetransmitTimer {
    deadline: Option<Instant>,
    generation: u64,
}

impl RetransmitTimer {
    pub fn new() -> Self {
        RetransmitTimer::default()
    }

    pub fn arm(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
        self.generation += 1;
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
        self.generation += 1;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True when the arming observed as `generation` is still current and its
    /// deadline has passed. Stale generations never report expiry.
    pub fn expired(&self, generation: u64, now: Instant) -> bool {
        self.generation == generation && self.deadline.map_or(false, |d| now >= d)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn starts_disarmed() {
        let timer = RetransmitTimer::new();
        assert!(!timer.is_armed());
        assert!(!timer.expired(timer.generation(), Instant::now()));
    }

    #[test]
    fn reports_expiry_for_current_generation() {
        let mut timer = RetransmitTimer::new();
        let now = Instant::now();

        timer.arm(now);
        let gen = timer.generation();
        assert!(timer.expired(gen, now + Duration::from_millis(1)));
        assert!(!timer.expired(gen, now - Duration::from_millis(1)));
    }

    #[test]
    fn rearming_invalidates_older_generations() {
        let mut timer = RetransmitTimer::new();
        let now = Instant::now();

        timer.arm(now);
        let stale = timer.generation();

        timer.arm(now + Duration::from_secs(10));
        assert!(!timer.expired(stale, now + Duration::from_secs(1)));
        assert!(timer.expired(timer.generation(), now + Duration::from_secs(11)));
    }

    #[test]
    fn disarm_clears_deadline_and_generation() {
        let mut timer = RetransmitTimer::new();
        let now = Instant::now();

        timer.arm(now);
        let stale = timer.generation();
        timer.disarm();

        assert!(!timer.is_armed());
        assert!(!timer.expired(stale, now + Duration::from_secs(1)));
    }
}
