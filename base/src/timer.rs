// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! One-shot callback timers dispatched by per-host-CPU worker threads.
//!
//! A [`Timer`] is bound to one modeled host CPU; its callback runs on that
//! CPU's dispatch worker when the armed deadline passes. Rearming, stopping
//! and migration are cheap: queue entries are invalidated lazily through a
//! per-timer generation counter rather than removed from the heap.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::sync::Arc;
use std::sync::Weak;
use std::thread;
use std::thread::ThreadId;
use std::time::Duration;

use remain::sorted;
use sync::Condvar;
use sync::Mutex;
use thiserror::Error;

use crate::Event;
use crate::EventWaitResult;
use crate::HostClock;
use crate::WorkerThread;

#[sorted]
#[derive(Error, Debug)]
pub enum TimerError {
    /// Error while trying to create a dispatch worker thread.
    #[error("failed to spawn timer worker: {0}")]
    SpawnWorker(io::Error),
}

pub type TimerResult<T> = std::result::Result<T, TimerError>;

/// The callback run on the owning CPU's worker when a timer expires.
pub type TimerCallback = Box<dyn Fn() + Send + Sync>;

/// An armed deadline queued on one CPU. Entries whose generation no longer
/// matches the timer's are discarded when popped.
struct Entry {
    deadline_ns: u64,
    gen: u64,
    timer: Weak<TimerShared>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ns == other.deadline_ns && self.gen == other.gen
    }
}

impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the BinaryHeap yields the earliest deadline first.
        other
            .deadline_ns
            .cmp(&self.deadline_ns)
            .then_with(|| other.gen.cmp(&self.gen))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Queue {
    heap: BinaryHeap<Entry>,
    /// A due entry has been popped and its callback may be running.
    dispatching: bool,
}

/// Per-CPU dispatch state shared between the worker and timer handles.
struct Dispatch {
    queue: Mutex<Queue>,
    /// Wakes the worker on arm/migrate/shutdown and on fake-clock advance.
    evt: Event,
    /// Notified whenever the worker finishes a dispatch round or finds the
    /// queue quiescent; paired with `queue`.
    idle: Condvar,
}

struct PoolShared {
    cpus: Vec<Arc<Dispatch>>,
    clock: Arc<dyn HostClock>,
}

struct TimerState {
    cpu: usize,
    deadline: Option<u64>,
    gen: u64,
    /// Worker thread currently inside the callback, if any.
    firing: Option<ThreadId>,
    killed: bool,
}

struct TimerShared {
    pool: Arc<PoolShared>,
    cb: TimerCallback,
    state: Mutex<TimerState>,
    /// Notified when a callback invocation returns; paired with `state`.
    fired: Condvar,
}

/// A set of dispatch workers, one per modeled host CPU.
pub struct TimerPool {
    shared: Arc<PoolShared>,
    workers: Vec<WorkerThread<()>>,
}

impl TimerPool {
    /// Spawns `num_cpus` dispatch workers driven by `clock`.
    pub fn new(num_cpus: usize, clock: Arc<dyn HostClock>) -> TimerResult<TimerPool> {
        assert!(num_cpus > 0);
        let cpus: Vec<Arc<Dispatch>> = (0..num_cpus)
            .map(|_| {
                Arc::new(Dispatch {
                    queue: Mutex::new(Queue {
                        heap: BinaryHeap::new(),
                        dispatching: false,
                    }),
                    evt: Event::new(),
                    idle: Condvar::new(),
                })
            })
            .collect();
        let shared = Arc::new(PoolShared {
            cpus,
            clock,
        });
        let mut workers = Vec::with_capacity(num_cpus);
        for cpu in 0..num_cpus {
            let dispatch = shared.cpus[cpu].clone();
            let clock = shared.clock.clone();
            let worker = WorkerThread::start(format!("timer dispatch {}", cpu), move |stop| {
                run_worker(dispatch, clock, stop)
            })
            .map_err(TimerError::SpawnWorker)?;
            workers.push(worker);
        }
        Ok(TimerPool { shared, workers })
    }

    pub fn num_cpus(&self) -> usize {
        self.shared.cpus.len()
    }

    /// Creates a disarmed timer bound to `cpu` whose expiries run `cb` on that
    /// CPU's worker.
    pub fn add_timer(&self, cpu: usize, cb: TimerCallback) -> Timer {
        assert!(cpu < self.shared.cpus.len());
        Timer {
            shared: Arc::new(TimerShared {
                pool: self.shared.clone(),
                cb,
                state: Mutex::new(TimerState {
                    cpu,
                    deadline: None,
                    gen: 0,
                    firing: None,
                    killed: false,
                }),
                fired: Condvar::new(),
            }),
        }
    }

    /// Blocks until no armed-and-due timer remains undispatched and no
    /// callback is in flight on any CPU.
    pub fn wait_idle(&self) {
        for dispatch in &self.shared.cpus {
            let mut queue = dispatch.queue.lock();
            loop {
                let now = self.shared.clock.now_ns();
                let due = queue
                    .heap
                    .peek()
                    .map_or(false, |entry| entry.deadline_ns <= now);
                if !due && !queue.dispatching {
                    break;
                }
                queue = dispatch.idle.wait(queue);
            }
        }
    }
}

impl Drop for TimerPool {
    fn drop(&mut self) {
        // Latch every stop request before waking, so no worker goes back to
        // sleep between its wakeup and the request.
        for (worker, dispatch) in self.workers.iter().zip(&self.shared.cpus) {
            worker.signal();
            dispatch.evt.signal();
        }
        for worker in self.workers.drain(..) {
            worker.stop();
        }
    }
}

fn run_worker(dispatch: Arc<Dispatch>, clock: Arc<dyn HostClock>, stop: Event) {
    loop {
        if stop.wait_timeout(Duration::ZERO) == EventWaitResult::Signaled {
            return;
        }
        let now = clock.now_ns();
        let mut due = None;
        let next = {
            let mut queue = dispatch.queue.lock();
            loop {
                let deadline = match queue.heap.peek() {
                    Some(top) => top.deadline_ns,
                    None => break,
                };
                if deadline > now {
                    break;
                }
                let entry = match queue.heap.pop() {
                    Some(entry) => entry,
                    None => break,
                };
                if let Some(timer) = entry.timer.upgrade() {
                    queue.dispatching = true;
                    due = Some((timer, entry.gen));
                    break;
                }
                // The timer handle is gone; nothing to run.
            }
            if due.is_none() {
                dispatch.idle.notify_all();
                queue.heap.peek().map(|entry| entry.deadline_ns)
            } else {
                None
            }
        };
        match due {
            Some((timer, gen)) => {
                fire(&timer, gen);
                dispatch.queue.lock().dispatching = false;
                dispatch.idle.notify_all();
            }
            None => clock.wait(&dispatch.evt, next),
        }
    }
}

/// Runs one expiry, unless the popped entry went stale (rearmed, stopped,
/// migrated or killed since it was queued).
fn fire(timer: &Arc<TimerShared>, gen: u64) {
    {
        let mut state = timer.state.lock();
        if state.killed || state.gen != gen {
            return;
        }
        state.deadline = None;
        state.firing = Some(thread::current().id());
    }
    (timer.cb)();
    let mut state = timer.state.lock();
    state.firing = None;
    timer.fired.notify_all();
}

/// Handle to a one-shot callback timer created by [`TimerPool::add_timer`].
pub struct Timer {
    shared: Arc<TimerShared>,
}

impl Timer {
    /// Arms (or rearms) the timer at an absolute deadline. A deadline already
    /// in the past fires as soon as the owning worker runs.
    pub fn set(&self, deadline_ns: u64) {
        let (cpu, gen) = {
            let mut state = self.shared.state.lock();
            if state.killed {
                return;
            }
            state.gen = state.gen.wrapping_add(1);
            state.deadline = Some(deadline_ns);
            (state.cpu, state.gen)
        };
        let dispatch = &self.shared.pool.cpus[cpu];
        dispatch.queue.lock().heap.push(Entry {
            deadline_ns,
            gen,
            timer: Arc::downgrade(&self.shared),
        });
        dispatch.evt.signal();
    }

    /// Disarms the timer. An already in-flight callback is not waited for.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        state.gen = state.gen.wrapping_add(1);
        state.deadline = None;
    }

    /// Disarms the timer and blocks until any in-flight callback has
    /// returned. Afterwards the timer can never fire again.
    ///
    /// Must not be called while holding a lock the callback takes. Calling it
    /// from the timer's own callback does not wait (the callback cannot wait
    /// for itself).
    pub fn kill(&self) {
        let me = thread::current().id();
        let mut state = self.shared.state.lock();
        state.gen = state.gen.wrapping_add(1);
        state.deadline = None;
        state.killed = true;
        while let Some(worker) = state.firing {
            if worker == me {
                break;
            }
            state = self.shared.fired.wait(state);
        }
    }

    /// Rebinds dispatch, and any armed deadline, to another CPU's worker.
    pub fn migrate(&self, cpu: usize) {
        assert!(cpu < self.shared.pool.cpus.len());
        let rearm = {
            let mut state = self.shared.state.lock();
            state.cpu = cpu;
            if state.killed {
                None
            } else if let Some(deadline_ns) = state.deadline {
                state.gen = state.gen.wrapping_add(1);
                Some((deadline_ns, state.gen))
            } else {
                None
            }
        };
        if let Some((deadline_ns, gen)) = rearm {
            let dispatch = &self.shared.pool.cpus[cpu];
            dispatch.queue.lock().heap.push(Entry {
                deadline_ns,
                gen,
                timer: Arc::downgrade(&self.shared),
            });
            dispatch.evt.signal();
        }
    }

    /// The armed deadline, if any.
    pub fn deadline_ns(&self) -> Option<u64> {
        self.shared.state.lock().deadline
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FakeClock;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::mpsc;
    use std::time::Duration;

    struct TestData {
        pool: TimerPool,
        clock: Arc<FakeClock>,
    }

    fn set_up(num_cpus: usize) -> TestData {
        let clock = Arc::new(FakeClock::new());
        let pool = TimerPool::new(num_cpus, clock.clone()).unwrap();
        TestData { pool, clock }
    }

    fn counting_timer(data: &TestData, cpu: usize) -> (Timer, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let timer = data.pool.add_timer(
            cpu,
            Box::new(move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (timer, fired)
    }

    #[test]
    fn fires_at_deadline() {
        let data = set_up(1);
        let (timer, fired) = counting_timer(&data, 0);
        timer.set(1_000_000);
        data.clock.add_ns(999_999);
        data.pool.wait_idle();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        data.clock.add_ns(1);
        data.pool.wait_idle();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(timer.deadline_ns(), None);
    }

    #[test]
    fn past_deadline_fires_immediately() {
        let data = set_up(1);
        data.clock.add_ns(5_000_000);
        let (timer, fired) = counting_timer(&data, 0);
        timer.set(1_000_000);
        data.pool.wait_idle();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_disarms() {
        let data = set_up(1);
        let (timer, fired) = counting_timer(&data, 0);
        timer.set(1_000_000);
        timer.stop();
        data.clock.add_ns(2_000_000);
        data.pool.wait_idle();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(timer.deadline_ns(), None);
    }

    #[test]
    fn rearm_replaces_deadline() {
        let data = set_up(1);
        let (timer, fired) = counting_timer(&data, 0);
        timer.set(1_000_000);
        timer.set(3_000_000);
        data.clock.add_ns(2_000_000);
        data.pool.wait_idle();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        data.clock.add_ns(1_000_000);
        data.pool.wait_idle();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_can_rearm_itself() {
        let data = set_up(1);
        let fired = Arc::new(AtomicUsize::new(0));
        let (send, recv) = mpsc::channel();
        let send = Mutex::new(send);
        let timer: Arc<Mutex<Option<Timer>>> = Arc::new(Mutex::new(None));
        let timer2 = timer.clone();
        let fired2 = fired.clone();
        let clock = data.clock.clone();
        let t = data.pool.add_timer(
            0,
            Box::new(move || {
                let n = fired2.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    let now = clock.nanos();
                    if let Some(timer) = timer2.lock().as_ref() {
                        timer.set(now + 1_000_000);
                    }
                }
                send.lock().send(n).unwrap();
            }),
        );
        t.set(1_000_000);
        *timer.lock() = Some(t);
        for expected in 1..=3 {
            data.clock.add_ns(1_000_000);
            data.pool.wait_idle();
            assert_eq!(recv.recv_timeout(Duration::from_secs(5)).unwrap(), expected);
        }
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn migrate_rebinds_armed_deadline() {
        let data = set_up(2);
        let (timer, fired) = counting_timer(&data, 0);
        timer.set(1_000_000);
        timer.migrate(1);
        data.clock.add_ns(1_000_000);
        data.pool.wait_idle();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn kill_waits_for_in_flight_callback() {
        let data = set_up(1);
        let (enter_send, enter_recv) = mpsc::channel();
        let enter_send = Mutex::new(enter_send);
        let release = Event::new();
        let release2 = release.clone();
        let timer = data.pool.add_timer(
            0,
            Box::new(move || {
                enter_send.lock().send(()).unwrap();
                release2.wait();
            }),
        );
        timer.set(1_000_000);
        data.clock.add_ns(1_000_000);
        // The callback is now blocked inside the worker.
        enter_recv.recv_timeout(Duration::from_secs(5)).unwrap();

        let (killed_send, killed_recv) = mpsc::channel();
        let killer = thread::spawn(move || {
            timer.kill();
            killed_send.send(()).unwrap();
        });
        assert!(killed_recv.recv_timeout(Duration::from_millis(100)).is_err());
        release.signal();
        killed_recv.recv_timeout(Duration::from_secs(5)).unwrap();
        killer.join().unwrap();
    }

    #[test]
    fn killed_timer_never_fires_again() {
        let data = set_up(1);
        let (timer, fired) = counting_timer(&data, 0);
        timer.set(1_000_000);
        timer.kill();
        timer.set(2_000_000);
        data.clock.add_ns(3_000_000);
        data.pool.wait_idle();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
