use std::time::Instant;

use chrono::{DateTime, Duration, Utc};

/// Wall-clock timestamps that never run backwards within one process.
///
/// The wall time is read once at construction and every later reading is
/// that anchor plus monotonic elapsed time, so a system clock adjustment in
/// the middle of a session cannot reorder a producer's events.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    wall_anchor: DateTime<Utc>,
    mono_anchor: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            wall_anchor: Utc::now(),
            mono_anchor: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.at(Instant::now())
    }

    /// Wall-clock time corresponding to a monotonic instant.
    pub fn at(&self, instant: Instant) -> DateTime<Utc> {
        let elapsed = instant.saturating_duration_since(self.mono_anchor);
        match Duration::from_std(elapsed) {
            Ok(offset) => self.wall_anchor + offset,
            Err(_) => self.wall_anchor,
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readings_never_decrease() {
        let clock = MonotonicClock::new();
        let mut previous = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next >= previous);
            previous = next;
        }
    }

    #[test]
    fn instants_before_anchor_saturate() {
        let earlier = Instant::now();
        let clock = MonotonicClock::new();
        assert_eq!(clock.at(earlier), clock.at(clock.mono_anchor));
    }
}
