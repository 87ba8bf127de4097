use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::types::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Elapsed,
    Cancelled,
}

/// One-way latch over a timed wait. After `cancel`, every wait resolves
/// immediately with `Cancelled`, including zero-length ones.
#[derive(Debug, Default)]
pub struct StickyCancelTimer {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

impl StickyCancelTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut cancelled = self.cancelled.lock().unwrap();
        *cancelled = true;
        self.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.lock().unwrap()
    }

    pub fn wait_for(&self, duration: Duration) -> WaitStatus {
        let deadline = Instant::now() + duration;
        let mut cancelled = self.cancelled.lock().unwrap();
        loop {
            if *cancelled {
                return WaitStatus::Cancelled;
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitStatus::Elapsed;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(cancelled, deadline - now)
                .unwrap();
            cancelled = guard;
        }
    }
}

#[derive(Debug, Default)]
struct EventState {
    ready: u64,
    cancelled: bool,
}

/// Counting event with the same sticky-cancel latch as the timer. Each
/// `trigger(n)` makes `n` waits runnable; cancellation wins over pending
/// counts.
#[derive(Debug, Default)]
pub struct StickyCancelEvent {
    state: Mutex<EventState>,
    cond: Condvar,
}

impl StickyCancelEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self, count: u64) {
        let mut state = self.state.lock().unwrap();
        state.ready += count;
        self.cond.notify_all();
    }

    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        state.cancelled = true;
        self.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap().cancelled
    }

    /// Consumes one ready unit, or fails with `Cancelled` once the latch is
    /// set.
    pub fn wait_for_event(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.cancelled {
                return Err(Error::Cancelled);
            }
            if state.ready > 0 {
                state.ready -= 1;
                return Ok(());
            }
            state = self.cond.wait(state).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn cancelled_timer_resolves_immediately() {
        let timer = StickyCancelTimer::new();
        timer.cancel();
        let start = Instant::now();
        assert_eq!(
            timer.wait_for(Duration::from_secs(10)),
            WaitStatus::Cancelled
        );
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn cancel_is_idempotent() {
        let timer = StickyCancelTimer::new();
        timer.cancel();
        timer.cancel();
        assert!(timer.is_cancelled());
        assert_eq!(timer.wait_for(Duration::ZERO), WaitStatus::Cancelled);
    }

    #[test]
    fn timer_elapses_when_armed() {
        let timer = StickyCancelTimer::new();
        assert_eq!(
            timer.wait_for(Duration::from_millis(1)),
            WaitStatus::Elapsed
        );
    }

    #[test]
    fn cancel_wakes_a_blocked_waiter() {
        let timer = Arc::new(StickyCancelTimer::new());
        let waiter = {
            let timer = Arc::clone(&timer);
            thread::spawn(move || timer.wait_for(Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(20));
        timer.cancel();
        assert_eq!(waiter.join().unwrap(), WaitStatus::Cancelled);
    }

    #[test]
    fn event_counts_are_consumed_one_per_wait() {
        let event = StickyCancelEvent::new();
        event.trigger(2);
        assert!(event.wait_for_event().is_ok());
        assert!(event.wait_for_event().is_ok());
        event.cancel();
        assert!(event.wait_for_event().unwrap_err().is_cancelled());
    }

    #[test]
    fn cancelled_event_ignores_pending_counts() {
        let event = StickyCancelEvent::new();
        event.trigger(5);
        event.cancel();
        assert!(event.wait_for_event().unwrap_err().is_cancelled());
    }
}
