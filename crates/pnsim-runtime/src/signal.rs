//! Wake signalling and cancellation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Generation counter paired with a condition variable
///
/// Read `generation()` before checking a condition, then wait on that
/// generation: a notification in between is never lost.
#[derive(Debug, Default)]
pub struct WakeSignal {
    generation: Mutex<u64>,
    condvar: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    pub fn notify(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.condvar.notify_all();
    }

    /// Block until notified after `seen`, or until `timeout` (`None` waits forever)
    ///
    /// Returns true when woken by a notification.
    pub fn wait_since(&self, seen: u64, timeout: Option<Duration>) -> bool {
        let mut generation = self.generation.lock();
        match timeout {
            None => {
                while *generation == seen {
                    self.condvar.wait(&mut generation);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while *generation == seen {
                    if self.condvar.wait_until(&mut generation, deadline).timed_out() {
                        return *generation != seen;
                    }
                }
                true
            }
        }
    }
}

/// Kill flag shared by every thread of a node
#[derive(Clone, Debug)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    wake: Arc<WakeSignal>,
}

impl Shutdown {
    pub fn new(wake: Arc<WakeSignal>) -> Self {
        Shutdown {
            flag: Arc::new(AtomicBool::new(false)),
            wake,
        }
    }

    /// Set the flag and interrupt every waiter; returns false if already set
    pub fn trigger(&self) -> bool {
        let first = !self.flag.swap(true, Ordering::AcqRel);
        self.wake.notify();
        first
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_times_out() {
        let signal = WakeSignal::new();
        let seen = signal.generation();
        assert!(!signal.wait_since(seen, Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_notify_before_wait_is_not_lost() {
        let signal = WakeSignal::new();
        let seen = signal.generation();
        signal.notify();
        assert!(signal.wait_since(seen, Some(Duration::from_secs(5))));
    }

    #[test]
    fn test_notify_from_other_thread() {
        let signal = Arc::new(WakeSignal::new());
        let seen = signal.generation();
        let notifier = {
            let signal = signal.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                signal.notify();
            })
        };
        assert!(signal.wait_since(seen, None));
        notifier.join().unwrap();
    }

    #[test]
    fn test_shutdown_interrupts_wait() {
        let wake = Arc::new(WakeSignal::new());
        let shutdown = Shutdown::new(wake.clone());
        let seen = wake.generation();
        let waiter = {
            let wake = wake.clone();
            thread::spawn(move || wake.wait_since(seen, Some(Duration::from_secs(30))))
        };
        assert!(shutdown.trigger());
        assert!(!shutdown.trigger());
        assert!(waiter.join().unwrap());
        assert!(shutdown.is_triggered());
    }
}
