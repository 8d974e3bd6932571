// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use sync::Condvar;
use sync::Mutex;

/// Result of [`Event::wait_timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventWaitResult {
    /// The event was signaled; the signal has been consumed.
    Signaled,
    /// The timeout elapsed without the event being signaled.
    TimedOut,
}

/// A portable auto-reset event.
///
/// A signal remains latched until one waiter consumes it, so a signal raised
/// while no thread is waiting is not lost. Clones share signal state.
#[derive(Clone, Default)]
pub struct Event {
    inner: Arc<EventInner>,
}

#[derive(Default)]
struct EventInner {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Event {
        Event::default()
    }

    /// Signals the event, waking one waiter. The signal stays latched until
    /// consumed by a wait.
    pub fn signal(&self) {
        let mut signaled = self.inner.signaled.lock();
        *signaled = true;
        self.inner.cond.notify_one();
    }

    /// Blocks until the event is signaled, then consumes the signal.
    pub fn wait(&self) {
        let mut signaled = self.inner.signaled.lock();
        while !*signaled {
            signaled = self.inner.cond.wait(signaled);
        }
        *signaled = false;
    }

    /// Returns an event sharing this event's signal state.
    pub fn try_clone(&self) -> Event {
        Event {
            inner: self.inner.clone(),
        }
    }

    /// Blocks until the event is signaled or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> EventWaitResult {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.inner.signaled.lock();
        loop {
            if *signaled {
                *signaled = false;
                return EventWaitResult::Signaled;
            }
            let now = Instant::now();
            if now >= deadline {
                return EventWaitResult::TimedOut;
            }
            (signaled, _) = self.inner.cond.wait_timeout(signaled, deadline - now);
        }
    }

    /// Whether `self` and `other` share signal state.
    pub(crate) fn ptr_eq(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn signal_then_wait() {
        let evt = Event::new();
        evt.signal();
        evt.wait();
    }

    #[test]
    fn signal_is_latched_once() {
        let evt = Event::new();
        evt.signal();
        evt.signal();
        assert_eq!(
            evt.wait_timeout(Duration::from_millis(0)),
            EventWaitResult::Signaled
        );
        assert_eq!(
            evt.wait_timeout(Duration::from_millis(0)),
            EventWaitResult::TimedOut
        );
    }

    #[test]
    fn clone_shares_signal_state() {
        let evt = Event::new();
        let clone = evt.try_clone();
        let handle = thread::spawn(move || clone.wait());
        evt.signal();
        handle.join().unwrap();
    }
}
