// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

// Monotonic clock abstraction, plus a fake clock giving tests exact control
// over time.

use std::time::Duration;
use std::time::Instant;

use sync::Mutex;

use crate::Event;

/// A monotonic nanosecond clock that timer workers can also sleep against.
pub trait HostClock: Send + Sync {
    /// Nanoseconds since an arbitrary fixed origin.
    fn now_ns(&self) -> u64;

    /// Blocks until `evt` is signaled or, best effort, until the clock reaches
    /// `deadline_ns`. Returns immediately if the deadline has already passed.
    fn wait(&self, evt: &Event, deadline_ns: Option<u64>);
}

/// The host's monotonic clock.
#[derive(Debug)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            origin: Instant::now(),
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for Clock {
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn wait(&self, evt: &Event, deadline_ns: Option<u64>) {
        match deadline_ns {
            None => evt.wait(),
            Some(deadline) => {
                let now = self.now_ns();
                if deadline <= now {
                    return;
                }
                let _ = evt.wait_timeout(Duration::from_nanos(deadline - now));
            }
        }
    }
}

/// A fake clock that only advances when told to, signaling events registered
/// at deadlines the advancement passes.
#[derive(Default)]
pub struct FakeClock {
    inner: Mutex<FakeClockInner>,
}

#[derive(Default)]
struct FakeClockInner {
    now_ns: u64,
    deadlines: Vec<(u64, Event)>,
}

impl FakeClock {
    pub fn new() -> Self {
        FakeClock::default()
    }

    /// The current fake time in nanoseconds.
    pub fn nanos(&self) -> u64 {
        self.inner.lock().now_ns
    }

    /// Advances the clock by `ns`, signaling every event whose registered
    /// deadline has now been reached.
    pub fn add_ns(&self, ns: u64) {
        let mut inner = self.inner.lock();
        inner.now_ns += ns;
        let now = inner.now_ns;
        inner.deadlines.retain(|(deadline, evt)| {
            let due = *deadline <= now;
            if due {
                evt.signal();
            }
            !due
        });
    }
}

impl HostClock for FakeClock {
    fn now_ns(&self) -> u64 {
        self.inner.lock().now_ns
    }

    fn wait(&self, evt: &Event, deadline_ns: Option<u64>) {
        {
            let mut inner = self.inner.lock();
            if let Some(deadline) = deadline_ns {
                if deadline <= inner.now_ns {
                    return;
                }
                // Re-registration replaces any earlier deadline for this event.
                inner.deadlines.retain(|(_, e)| !e.ptr_eq(evt));
                inner.deadlines.push((deadline, evt.try_clone()));
            }
        }
        evt.wait();
    }
}
