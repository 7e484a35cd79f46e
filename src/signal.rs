//! Set-once latch built on a `parking_lot` mutex and condvar.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Once set it stays set; every waiter is released.
#[derive(Default)]
pub struct Signal {
    state: Mutex<bool>,
    condvar: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut state = self.state.lock();
        *state = true;
        self.condvar.notify_all();
    }

    /// Returns `true` if the signal was set before `timeout` elapsed. A
    /// timeout past the range of `Instant` waits until set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            while !*state {
                self.condvar.wait(&mut state);
            }
            return true;
        };
        while !*state {
            if self.condvar.wait_until(&mut state, deadline).timed_out() {
                return *state;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_times_out_when_unset() {
        let signal = Signal::new();
        let start = Instant::now();
        assert!(!signal.wait_timeout(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_set_releases_waiter() {
        let signal = Arc::new(Signal::new());
        let signal_clone = signal.clone();
        let waiter = thread::spawn(move || signal_clone.wait_timeout(Duration::from_secs(5)));

        thread::sleep(Duration::from_millis(20));
        signal.set();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_stays_set() {
        let signal = Signal::new();
        signal.set();
        assert!(signal.wait_timeout(Duration::ZERO));
        assert!(signal.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_unbounded_timeout_waits_for_set() {
        let signal = Arc::new(Signal::new());
        let signal_clone = signal.clone();
        let waiter = thread::spawn(move || signal_clone.wait_timeout(Duration::MAX));

        thread::sleep(Duration::from_millis(20));
        signal.set();
        assert!(waiter.join().unwrap());
    }
}
