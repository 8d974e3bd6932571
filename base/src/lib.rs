// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-side platform facilities: monotonic and fake clocks, a portable
//! auto-reset event, and per-host-CPU one-shot callback timers.

mod clock;
mod event;
mod timer;
mod worker_thread;

pub use crate::clock::Clock;
pub use crate::clock::FakeClock;
pub use crate::clock::HostClock;
pub use crate::event::Event;
pub use crate::event::EventWaitResult;
pub use crate::timer::Timer;
pub use crate::timer::TimerCallback;
pub use crate::timer::TimerError;
pub use crate::timer::TimerPool;
pub use crate::timer::TimerResult;
pub use crate::worker_thread::WorkerThread;
