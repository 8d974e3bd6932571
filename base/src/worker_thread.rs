// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Worker thread abstraction

use std::io;
use std::panic;
use std::thread;
use std::thread::JoinHandle;

use crate::Event;

/// Wrapper object for creating a worker thread that can be stopped by
/// signaling an event.
pub struct WorkerThread<T: Send + 'static> {
    worker: Option<(Event, JoinHandle<T>)>,
}

impl<T: Send + 'static> WorkerThread<T> {
    /// Starts a worker thread named `thread_name` running the `thread_func`
    /// function.
    ///
    /// The `thread_func` implementation must monitor the provided [`Event`]
    /// and return from the thread once it is signaled.
    ///
    /// Call [`stop()`](Self::stop) to stop the thread.
    pub fn start<F>(thread_name: impl Into<String>, thread_func: F) -> io::Result<WorkerThread<T>>
    where
        F: FnOnce(Event) -> T + Send + 'static,
    {
        let stop_event = Event::new();
        let thread_stop_event = stop_event.clone();

        let thread_handle = thread::Builder::new()
            .name(thread_name.into())
            .spawn(move || thread_func(thread_stop_event))?;

        Ok(WorkerThread {
            worker: Some((stop_event, thread_handle)),
        })
    }

    /// Signals the thread's stop event without waiting for the thread to
    /// exit. Calling [`stop()`](Self::stop) or dropping the worker afterwards
    /// still joins the thread.
    pub fn signal(&self) {
        if let Some((event, _)) = &self.worker {
            event.signal();
        }
    }

    /// Stops the worker thread.
    ///
    /// Returns the value returned by the function running in the thread.
    pub fn stop(mut self) -> T {
        // The only time the internal `Option` is `None` is in a `drop` after
        // `stop`, so this `expect()` never fails.
        self.stop_internal().expect("invalid worker state")
    }

    // `stop_internal` accepts a reference so it can be called from `drop`.
    fn stop_internal(&mut self) -> Option<T> {
        self.worker.take().map(|(stop_event, thread_handle)| {
            stop_event.signal();
            match thread_handle.join() {
                Ok(v) => v,
                Err(e) => panic::resume_unwind(e),
            }
        })
    }
}

impl<T: Send + 'static> Drop for WorkerThread<T> {
    /// Stops the thread if the `WorkerThread` is dropped without calling
    /// [`stop()`](Self::stop).
    fn drop(&mut self) {
        let _ = self.stop_internal();
    }
}
