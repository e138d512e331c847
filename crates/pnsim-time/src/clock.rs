//! Time model and simulation clock

use std::time::{Duration, Instant};

use pnsim_core::{SimError, SimResult};

/// Relative time accepted when planning an action
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum When {
    /// Execute immediately, without waiting
    Now,
    /// Offset from the simulation start
    After(Duration),
    /// Never fires
    Never,
}

impl When {
    pub fn secs(secs: u64) -> Self {
        When::After(Duration::from_secs(secs))
    }

    pub fn millis(millis: u64) -> Self {
        When::After(Duration::from_millis(millis))
    }

    /// Anchor an offset at `start`
    pub fn anchor(self, start: Instant) -> Deadline {
        match self {
            When::Now => Deadline::Now,
            When::After(offset) => Deadline::At(start + offset),
            When::Never => Deadline::Never,
        }
    }
}

/// Absolute deadline stored by the scheduler
///
/// Ordered `Now < At(_) < Never`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Deadline {
    Now,
    At(Instant),
    Never,
}

impl Deadline {
    /// Time left until the deadline; `None` for `Never`
    pub fn remaining(self, now: Instant) -> Option<Duration> {
        match self {
            Deadline::Now => Some(Duration::ZERO),
            Deadline::At(at) => Some(at.saturating_duration_since(now)),
            Deadline::Never => None,
        }
    }

    pub fn is_due(self, now: Instant) -> bool {
        match self {
            Deadline::Now => true,
            Deadline::At(at) => at <= now,
            Deadline::Never => false,
        }
    }

    /// How far `now` is past the deadline
    pub fn lateness(self, now: Instant) -> Duration {
        match self {
            Deadline::At(at) => now.saturating_duration_since(at),
            Deadline::Now | Deadline::Never => Duration::ZERO,
        }
    }
}

/// Wall-clock anchors of a running simulation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimClock {
    start: Instant,
    end: Option<Instant>,
}

impl SimClock {
    /// Start now; `run_for` of `None` runs forever
    pub fn start(run_for: Option<Duration>) -> SimResult<Self> {
        Self::anchored(Instant::now(), run_for)
    }

    pub fn anchored(start: Instant, run_for: Option<Duration>) -> SimResult<Self> {
        let end = match run_for {
            Some(d) if d.is_zero() => return Err(SimError::NonPositiveEndTime),
            Some(d) => Some(start + d),
            None => None,
        };
        Ok(SimClock { start, end })
    }

    pub fn start_instant(&self) -> Instant {
        self.start
    }

    pub fn end(&self) -> Deadline {
        match self.end {
            Some(at) => Deadline::At(at),
            None => Deadline::Never,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed_at(Instant::now())
    }

    pub fn elapsed_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.start)
    }

    pub fn is_over(&self) -> bool {
        self.is_over_at(Instant::now())
    }

    pub fn is_over_at(&self, now: Instant) -> bool {
        self.end.map(|end| now > end).unwrap_or(false)
    }

    /// Time left before the end; `None` when running forever
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.end.map(|end| end.saturating_duration_since(now))
    }

    pub fn absolute(&self, when: When) -> Deadline {
        when.anchor(self.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_order() {
        let now = Instant::now();
        let mut deadlines = vec![
            Deadline::Never,
            Deadline::At(now + Duration::from_secs(1)),
            Deadline::Now,
            Deadline::At(now),
        ];
        deadlines.sort();
        assert_eq!(
            deadlines,
            vec![
                Deadline::Now,
                Deadline::At(now),
                Deadline::At(now + Duration::from_secs(1)),
                Deadline::Never
            ]
        );
    }

    #[test]
    fn test_anchor() {
        let start = Instant::now();
        assert_eq!(When::Now.anchor(start), Deadline::Now);
        assert_eq!(When::millis(5).anchor(start), Deadline::At(start + Duration::from_millis(5)));
        assert_eq!(When::Never.anchor(start), Deadline::Never);
    }

    #[test]
    fn test_clock_end() {
        let start = Instant::now();
        let clock = SimClock::anchored(start, Some(Duration::from_secs(10))).unwrap();
        assert!(!clock.is_over_at(start + Duration::from_secs(9)));
        assert!(clock.is_over_at(start + Duration::from_secs(11)));
        assert_eq!(clock.remaining(start + Duration::from_secs(4)), Some(Duration::from_secs(6)));
        assert_eq!(
            SimClock::anchored(start, Some(Duration::ZERO)),
            Err(SimError::NonPositiveEndTime)
        );
        let forever = SimClock::anchored(start, None).unwrap();
        assert_eq!(forever.end(), Deadline::Never);
        assert!(!forever.is_over_at(start + Duration::from_secs(1_000_000)));
    }

    #[test]
    fn test_lateness() {
        let start = Instant::now();
        let deadline = Deadline::At(start);
        assert_eq!(deadline.lateness(start + Duration::from_millis(3)), Duration::from_millis(3));
        assert!(deadline.is_due(start));
        assert_eq!(Deadline::Never.remaining(start), None);
    }
}
