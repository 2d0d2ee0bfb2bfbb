use linux_futex::{Futex, Private};
use std::{sync::atomic::Ordering::*, time::Duration};

const PARKED: u32 = u32::MAX;
const EMPTY: u32 = 0;
const NOTIFIED: u32 = 1;

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum State {
    Empty,
    Parked,
    Notified,
}

/// Futex backed parker holding at most one wakeup token.
///
/// `unpark` deposits the token (waking the owner if it sleeps), `park`
/// consumes it, blocking until one is available. Tokens do not accumulate.
#[derive(Default, Debug)]
pub struct Parker {
    state: Futex<Private>,
}

impl Parker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the token is available, then consumes it.
    pub fn park(&self) {
        // NOTIFIED => EMPTY returns right away, EMPTY => PARKED goes to sleep.
        if self.state.value.fetch_sub(1, Acquire) == NOTIFIED {
            return;
        }

        loop {
            // Spurious and interrupted futex wakeups just go around again.
            let _ = self.state.wait(PARKED);

            if self
                .state
                .value
                .compare_exchange(NOTIFIED, EMPTY, Acquire, Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Blocks for at most `timeout`. Returns whether the token was consumed.
    pub fn park_timeout(&self, timeout: Duration) -> bool {
        if self.state.value.fetch_sub(1, Acquire) == NOTIFIED {
            return true;
        }

        let _ = self.state.wait_for(PARKED, timeout);

        match self.state.value.swap(EMPTY, Acquire) {
            NOTIFIED => true,
            PARKED => false,
            value => panic!("unexpected value: {:?}", value),
        }
    }

    pub fn unpark(&self) {
        if self.state.value.swap(NOTIFIED, Release) == PARKED {
            self.state.wake(1);
        }
    }

    pub fn state(&self) -> State {
        return match self.state.value.load(Acquire) {
            NOTIFIED => State::Notified,
            EMPTY => State::Empty,
            PARKED => State::Parked,
            value => panic!("unexpected value: {:?}", value),
        };
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Instant};

    use super::*;

    #[test]
    fn token_is_sticky() {
        let parker = Parker::new();
        parker.unpark();
        parker.unpark();
        assert_eq!(parker.state(), State::Notified);

        parker.park();
        assert_eq!(parker.state(), State::Empty);

        assert!(!parker.park_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn park_timeout_elapses() {
        let parker = Parker::new();
        let start = Instant::now();
        assert!(!parker.park_timeout(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(parker.state(), State::Empty);
    }

    #[test]
    fn unpark_wakes_sleeping_thread() {
        let parker = Arc::new(Parker::new());
        let sleeper = {
            let parker = parker.clone();
            thread::spawn(move || parker.park())
        };

        while parker.state() != State::Parked {
            thread::yield_now();
        }
        parker.unpark();
        sleeper.join().unwrap();
        assert_eq!(parker.state(), State::Empty);
    }
}
