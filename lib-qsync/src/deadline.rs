use std::time::{Duration, SystemTime};

use quanta::Instant;

/// A point in time after which a timed wait gives up. A deadline too far in
/// the future to represent never elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Deadline {
        let at = u64::try_from(timeout.as_nanos())
            .ok()
            .and_then(|_| Instant::now().checked_add(timeout));

        Deadline { at }
    }

    pub fn never() -> Deadline {
        Deadline { at: None }
    }

    /// Converts a wall-clock instant. Times in the past elapse immediately.
    pub fn at_system_time(when: SystemTime) -> Deadline {
        let timeout = when
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);

        Deadline::after(timeout)
    }

    /// Time left, or `None` when the deadline is unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn has_elapsed(&self) -> bool {
        matches!(self.remaining(), Some(left) if left.is_zero())
    }

    pub fn is_bounded(&self) -> bool {
        self.at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_elapses_immediately() {
        assert!(Deadline::after(Duration::ZERO).has_elapsed());
        assert!(Deadline::at_system_time(SystemTime::UNIX_EPOCH).has_elapsed());
    }

    #[test]
    fn huge_timeout_never_elapses() {
        let deadline = Deadline::after(Duration::MAX);
        assert!(!deadline.is_bounded());
        assert_eq!(deadline.remaining(), None);
        assert!(!deadline.has_elapsed());
    }

    #[test]
    fn remaining_shrinks() {
        let deadline = Deadline::after(Duration::from_secs(10));
        let left = deadline.remaining().unwrap();
        assert!(left <= Duration::from_secs(10));
        assert!(left > Duration::from_secs(9));
    }
}
