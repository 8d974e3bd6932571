// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Virtual platform timers.
//!
//! Each guest vCPU owns a set of periodic (or one-shot) timers whose expiry
//! is driven by the host clock but whose delivery is gated by the guest being
//! runnable, by the emulated interrupt controllers, and by the domain's
//! tick-accounting mode. Device models (PIT, RTC, HPET, local APIC timer)
//! register [`PeriodicTime`] records against a vCPU; the scheduler freezes
//! and thaws them across context switches; the interrupt-delivery path picks
//! one eligible timer per guest entry and reconciles it when the guest
//! acknowledges the vector.
//!
//! Every field of every record owned by a vCPU, and the membership of that
//! vCPU's timer list, is protected by that vCPU's single timer lock. Because
//! a record's owning vCPU can be changed by re-registration, the lock is
//! acquired with a retry loop: read the owner, lock that vCPU, recheck the
//! owner.

use std::sync::Arc;
use std::sync::MutexGuard;
use std::sync::Weak;

use base::Clock;
use base::HostClock;
use base::Timer;
use base::TimerPool;
use enumn::N;
use log::warn;
use remain::sorted;
use sync::Mutex;
use thiserror::Error;

use crate::irqchip::IntAck;
use crate::irqchip::InterruptSource;
use crate::irqchip::IrqChip;
use crate::irqchip::TimerSource;
use crate::irqchip::VcpuScheduler;

/// Periodic timers shorter than this are clamped; the host timer cannot keep
/// up with sub-millisecond reprogramming.
const MIN_PERIOD_NS: u64 = 900_000;

#[sorted]
#[derive(Error, Debug)]
pub enum VptError {
    /// Error while starting the host timer dispatch workers.
    #[error("failed to start timer pool: {0}")]
    CreateTimerPool(base::TimerError),
}

/// How ticks that fired while the guest could not consume them are accounted.
///
/// The numeric values are the guest-visible configuration parameter encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
pub enum TimerMode {
    /// Hold guest time still while the vCPU is descheduled so the guest never
    /// observes a gap; missed ticks are not accumulated.
    DelayForMissedTicks = 0,
    /// Deliver every tick individually, as fast as the guest acknowledges
    /// them.
    NoDelay = 1,
    /// Never carry more than one undelivered tick.
    NoMissedTicksPending = 2,
    /// Accumulate missed ticks but collapse them into a single delivery on
    /// acknowledge.
    OneMissedTickPending = 3,
}

/// Invoked with the owning vCPU id after the guest acknowledges one of the
/// timer's ticks. Always called with no timer lock held.
pub type TickCallback = Arc<dyn Fn(usize) + Send + Sync>;

#[derive(Default)]
struct PtState {
    irq: u8,
    period: u64,
    period_cycles: u64,
    one_shot: bool,
    /// Absolute host time of the next expected expiry.
    scheduled: u64,
    /// Guest-time stamp of the last delivered tick; the injection selector's
    /// lag key is this plus `period_cycles`.
    last_plt_gtime: u64,
    /// Ticks fired on the host side but not yet acknowledged by the guest.
    pending_intr_nr: u32,
    /// A line assertion is outstanding for this record.
    irq_issued: bool,
    /// Skip stopping this record's host timer on the next save.
    do_not_freeze: bool,
    /// Linked into the owning vCPU's timer list.
    on_list: bool,
    cb: Option<TickCallback>,
}

/// A platform timer record.
///
/// Storage is owned by the registering device model and shared as
/// `Arc<PeriodicTime>`; the timer core owns only the list linkage, the host
/// timer handle and the interior state. A registered record keeps firing
/// until [`Vpt::destroy_periodic_time`] is called (or, for a one-shot, until
/// its tick is acknowledged).
pub struct PeriodicTime {
    source: TimerSource,
    /// Owning vCPU index. Leaf lock: read with no other lock held by the
    /// retry loop, written under the owning vCPU's timer lock.
    owner: Mutex<Option<usize>>,
    /// Host timer handle; present while the record is registered.
    timer: Mutex<Option<Timer>>,
    /// All remaining record state. Only locked while holding the owning
    /// vCPU's timer lock.
    state: Mutex<PtState>,
}

impl PeriodicTime {
    /// Creates an unregistered record that will assert through `source`.
    /// The source of a record never changes.
    pub fn new(source: TimerSource) -> PeriodicTime {
        PeriodicTime {
            source,
            owner: Mutex::new(None),
            timer: Mutex::new(None),
            state: Mutex::new(PtState::default()),
        }
    }

    pub fn source(&self) -> TimerSource {
        self.source
    }

    /// Whether the record is currently linked into a vCPU's timer list.
    pub fn is_active(&self) -> bool {
        self.state.lock().on_list
    }
}

/// Per-vCPU timer state, all guarded by one lock.
struct VcpuTimers {
    tm: Mutex<TmState>,
}

struct TmState {
    list: Vec<Arc<PeriodicTime>>,
    /// Guest time captured while frozen; 0 when not frozen.
    guest_time: u64,
    /// Offset from host cycles to guest cycles, wrapping.
    gtime_offset: u64,
    /// Host CPU whose dispatch worker services this vCPU's timers.
    processor: usize,
}

/// The virtual platform timer core for one guest.
#[derive(Clone)]
pub struct Vpt {
    inner: Arc<VptInner>,
}

struct VptInner {
    /// Back-reference handed to host timer callbacks.
    weak_self: Weak<VptInner>,
    clock: Arc<dyn HostClock>,
    pool: TimerPool,
    chip: Arc<dyn IrqChip>,
    sched: Arc<dyn VcpuScheduler>,
    vcpus: Vec<VcpuTimers>,
    /// Consulted live on every operation that accounts ticks.
    mode: Mutex<TimerMode>,
    cpu_khz: u64,
}

impl Vpt {
    /// Creates the timer core for a guest with `num_vcpus` vCPUs whose timers
    /// are serviced by `num_host_cpus` host CPUs, using the host's monotonic
    /// clock.
    pub fn new(
        num_vcpus: usize,
        num_host_cpus: usize,
        cpu_khz: u64,
        chip: Arc<dyn IrqChip>,
        sched: Arc<dyn VcpuScheduler>,
    ) -> Result<Vpt, VptError> {
        Self::new_with_clock(
            num_vcpus,
            num_host_cpus,
            cpu_khz,
            chip,
            sched,
            Arc::new(Clock::new()),
        )
    }

    /// Creates the timer core with a caller-supplied clock. Used for testing.
    pub fn new_with_clock(
        num_vcpus: usize,
        num_host_cpus: usize,
        cpu_khz: u64,
        chip: Arc<dyn IrqChip>,
        sched: Arc<dyn VcpuScheduler>,
        clock: Arc<dyn HostClock>,
    ) -> Result<Vpt, VptError> {
        assert!(num_vcpus > 0);
        assert!(cpu_khz > 0);
        let pool = TimerPool::new(num_host_cpus, clock.clone()).map_err(VptError::CreateTimerPool)?;
        let vcpus = (0..num_vcpus)
            .map(|id| VcpuTimers {
                tm: Mutex::new(TmState {
                    list: Vec::new(),
                    guest_time: 0,
                    gtime_offset: 0,
                    processor: id % num_host_cpus,
                }),
            })
            .collect();
        Ok(Vpt {
            inner: Arc::new_cyclic(|weak_self| VptInner {
                weak_self: weak_self.clone(),
                clock,
                pool,
                chip,
                sched,
                vcpus,
                mode: Mutex::new(TimerMode::DelayForMissedTicks),
                cpu_khz,
            }),
        })
    }

    /// Registers `pt` against `vcpu`, replacing any earlier registration of
    /// the same record. `period_ns` below 0.9 ms is clamped unless the timer
    /// is one-shot. `cb`, if given, runs after each guest acknowledge.
    pub fn create_periodic_time(
        &self,
        vcpu: usize,
        pt: &Arc<PeriodicTime>,
        period_ns: u64,
        irq: u8,
        one_shot: bool,
        cb: Option<TickCallback>,
    ) {
        self.inner.create_periodic_time(vcpu, pt, period_ns, irq, one_shot, cb)
    }

    /// Unregisters `pt`, synchronously waiting out any in-flight expiry.
    /// A record that was never registered is ignored.
    pub fn destroy_periodic_time(&self, pt: &Arc<PeriodicTime>) {
        self.inner.destroy_periodic_time(pt)
    }

    /// Called before `vcpu` yields its host CPU: stop its host timers and, in
    /// [`TimerMode::DelayForMissedTicks`], freeze its guest time. A blocked
    /// vCPU keeps its timers running so an expiry can wake it.
    pub fn save_timer(&self, vcpu: usize) {
        self.inner.save_timer(vcpu)
    }

    /// Called before `vcpu` resumes on a host CPU: account missed ticks,
    /// rearm the host timers and thaw frozen guest time.
    pub fn restore_timer(&self, vcpu: usize) {
        self.inner.restore_timer(vcpu)
    }

    /// Called on the guest-entry path: picks the eligible timer most behind
    /// on its guest-time schedule, if any, and asserts its line. At most one
    /// line is asserted per call.
    pub fn update_irq(&self, vcpu: usize) {
        self.inner.update_irq(vcpu)
    }

    /// Called once the guest has acknowledged `ack`: matches it to the
    /// issuing timer and consumes the delivered tick. Vectors belonging to
    /// other devices are ignored.
    pub fn intr_post(&self, vcpu: usize, ack: IntAck) {
        self.inner.intr_post(vcpu, ack)
    }

    /// Called on guest reset: forget pending ticks and restart every timer
    /// one period from now.
    pub fn reset(&self, vcpu: usize) {
        self.inner.reset(vcpu)
    }

    /// Called after `vcpu` is rebound to host CPU `processor`: moves its host
    /// timers to that CPU's dispatch worker.
    pub fn migrate(&self, vcpu: usize, processor: usize) {
        self.inner.migrate(vcpu, processor)
    }

    /// The guest-visible time of `vcpu`, in guest cycles.
    pub fn guest_time(&self, vcpu: usize) -> u64 {
        let inner = &self.inner;
        let tm = inner.vcpus[vcpu].tm.lock();
        inner.guest_time_locked(&tm)
    }

    pub fn timer_mode(&self) -> TimerMode {
        *self.inner.mode.lock()
    }

    pub fn set_timer_mode(&self, mode: TimerMode) {
        *self.inner.mode.lock() = mode;
    }

    /// Sets the tick-accounting mode from its raw parameter encoding.
    /// Returns false, changing nothing, if the value does not name a mode.
    pub fn set_timer_mode_param(&self, raw: u64) -> bool {
        match i64::try_from(raw).ok().and_then(TimerMode::n) {
            Some(mode) => {
                self.set_timer_mode(mode);
                true
            }
            None => {
                warn!("ignoring unknown timer mode parameter {}", raw);
                false
            }
        }
    }
}

impl VptInner {
    fn mode(&self) -> TimerMode {
        *self.mode.lock()
    }

    fn to_cycles(&self, ns: u64) -> u64 {
        (ns as u128 * self.cpu_khz as u128 / 1_000_000) as u64
    }

    fn guest_time_locked(&self, tm: &TmState) -> u64 {
        self.to_cycles(self.clock.now_ns())
            .wrapping_add(tm.gtime_offset)
    }

    fn set_guest_time_locked(&self, tm: &mut TmState, gtime: u64) {
        tm.gtime_offset = gtime.wrapping_sub(self.to_cycles(self.clock.now_ns()));
    }

    /// Locks the timer lock of `pt`'s owning vCPU. The owner can change
    /// between reading it and locking it, so recheck and retry. Returns None
    /// for a record that was never registered.
    fn pt_lock(&self, pt: &PeriodicTime) -> Option<(usize, MutexGuard<TmState>)> {
        loop {
            let vcpu = (*pt.owner.lock())?;
            let tm = self.vcpus[vcpu].tm.lock();
            if *pt.owner.lock() == Some(vcpu) {
                return Some((vcpu, tm));
            }
        }
    }

    /// Accounts for host time having run ahead of `scheduled`. In every mode
    /// the schedule is advanced past now; only some modes turn the missed
    /// expiries into pending ticks.
    fn process_missed_ticks(&self, st: &mut PtState) {
        if st.one_shot {
            return;
        }
        let now = self.clock.now_ns();
        if now <= st.scheduled {
            return;
        }
        let missed = (now - st.scheduled) / st.period + 1;
        match self.mode() {
            TimerMode::NoMissedTicksPending => st.do_not_freeze = st.pending_intr_nr == 0,
            TimerMode::DelayForMissedTicks => {}
            TimerMode::OneMissedTickPending | TimerMode::NoDelay => {
                st.pending_intr_nr = st
                    .pending_intr_nr
                    .saturating_add(missed.min(u32::MAX as u64) as u32);
            }
        }
        st.scheduled += missed * st.period;
    }

    /// Host timer expiry. Runs on the dispatch worker of whatever host CPU
    /// the timer is bound to.
    fn timer_fn(&self, pt: &Arc<PeriodicTime>) {
        let Some((vcpu, tm)) = self.pt_lock(pt) else {
            return;
        };
        {
            let mut st = pt.state.lock();
            if self.mode() == TimerMode::NoMissedTicksPending {
                st.pending_intr_nr = 1;
            } else {
                st.pending_intr_nr = st.pending_intr_nr.saturating_add(1);
            }
            if !st.one_shot {
                st.scheduled += st.period;
                self.process_missed_ticks(&mut st);
                if let Some(timer) = pt.timer.lock().as_ref() {
                    timer.set(st.scheduled);
                }
            }
        }
        drop(tm);
        self.sched.kick(vcpu);
    }

    /// Whether the record's line cannot currently reach the guest. An ISA
    /// line is only effectively masked when both the PIC route and the I/O
    /// APIC route are closed.
    fn irq_masked(&self, vcpu: usize, source: TimerSource, irq: u8) -> bool {
        match source {
            TimerSource::Lapic => {
                !self.chip.lapic_enabled(vcpu) || self.chip.lapic_timer_masked(vcpu)
            }
            TimerSource::Isa => {
                let gsi = self.chip.isa_irq_to_gsi(irq);
                (self.chip.pic_masked(irq) || !self.chip.lapic_accepts_pic(vcpu))
                    && self.chip.ioapic_masked(gsi)
            }
        }
    }

    /// The guest-visible vector the record's line produces on `path`.
    fn irq_vector(&self, source: TimerSource, irq: u8, path: InterruptSource) -> u8 {
        match source {
            TimerSource::Lapic => irq,
            TimerSource::Isa => match path {
                InterruptSource::Pic => self.chip.pic_vector_base(irq).wrapping_add(irq & 7),
                InterruptSource::Lapic => {
                    self.chip.ioapic_vector(self.chip.isa_irq_to_gsi(irq))
                }
            },
        }
    }

    fn save_timer(&self, vcpu: usize) {
        // A blocked vCPU keeps its timers running; an expiry is what wakes it.
        if self.sched.is_blocked(vcpu) {
            return;
        }
        let mut tm = self.vcpus[vcpu].tm.lock();
        for pt in &tm.list {
            let st = pt.state.lock();
            if !st.do_not_freeze {
                if let Some(timer) = pt.timer.lock().as_ref() {
                    timer.stop();
                }
            }
        }
        if self.mode() == TimerMode::DelayForMissedTicks {
            tm.guest_time = self.guest_time_locked(&tm);
        }
    }

    fn restore_timer(&self, vcpu: usize) {
        let mut tm = self.vcpus[vcpu].tm.lock();
        for pt in &tm.list {
            let mut st = pt.state.lock();
            self.process_missed_ticks(&mut st);
            if let Some(timer) = pt.timer.lock().as_ref() {
                timer.set(st.scheduled);
            }
        }
        if self.mode() == TimerMode::DelayForMissedTicks && tm.guest_time != 0 {
            let frozen = tm.guest_time;
            self.set_guest_time_locked(&mut tm, frozen);
            tm.guest_time = 0;
        }
    }

    fn update_irq(&self, vcpu: usize) {
        let tm = self.vcpus[vcpu].tm.lock();
        let mut earliest: Option<Arc<PeriodicTime>> = None;
        let mut max_lag = u64::MAX;
        for pt in &tm.list {
            let st = pt.state.lock();
            if st.pending_intr_nr == 0 || self.irq_masked(vcpu, pt.source, st.irq) {
                continue;
            }
            let lag = st.last_plt_gtime.wrapping_add(st.period_cycles);
            if lag < max_lag {
                max_lag = lag;
                earliest = Some(pt.clone());
            }
        }
        let Some(pt) = earliest else {
            return;
        };
        let irq = {
            let mut st = pt.state.lock();
            st.irq_issued = true;
            st.irq
        };
        drop(tm);

        // The controllers take their own locks; assert with ours dropped.
        match pt.source {
            TimerSource::Lapic => self.chip.lapic_set_irq(vcpu, irq),
            TimerSource::Isa => {
                // The 8259 input is level sensitive here; a second assert
                // without an intervening deassert would be collapsed.
                self.chip.isa_irq_deassert(irq);
                self.chip.isa_irq_assert(irq);
            }
        }
    }

    fn intr_post(&self, vcpu: usize, ack: IntAck) {
        let mut tm = self.vcpus[vcpu].tm.lock();
        let mut matched: Option<Arc<PeriodicTime>> = None;
        for pt in &tm.list {
            let st = pt.state.lock();
            if st.pending_intr_nr > 0
                && st.irq_issued
                && ack.vector == self.irq_vector(pt.source, st.irq, ack.source)
            {
                matched = Some(pt.clone());
                break;
            }
        }
        // No match: the vector belongs to some other device.
        let Some(pt) = matched else {
            return;
        };

        let cb;
        {
            let mut st = pt.state.lock();
            st.do_not_freeze = false;
            st.irq_issued = false;

            if st.one_shot {
                if st.on_list {
                    tm.list.retain(|entry| !Arc::ptr_eq(entry, &pt));
                }
                st.on_list = false;
            } else if self.mode() == TimerMode::OneMissedTickPending {
                // Collapse all outstanding ticks into this delivery.
                st.last_plt_gtime = self.guest_time_locked(&tm);
                st.pending_intr_nr = 0;
            } else {
                st.last_plt_gtime = st.last_plt_gtime.wrapping_add(st.period_cycles);
                st.pending_intr_nr -= 1;
            }

            if self.mode() == TimerMode::DelayForMissedTicks
                && self.guest_time_locked(&tm) < st.last_plt_gtime
            {
                // Guest time was being held back; catch it up to the tick
                // the guest just consumed.
                let gtime = st.last_plt_gtime;
                self.set_guest_time_locked(&mut tm, gtime);
            }
            cb = st.cb.clone();
        }
        drop(tm);

        if let Some(cb) = cb {
            cb(vcpu);
        }
    }

    fn reset(&self, vcpu: usize) {
        let tm = self.vcpus[vcpu].tm.lock();
        for pt in &tm.list {
            let mut st = pt.state.lock();
            st.pending_intr_nr = 0;
            st.last_plt_gtime = self.guest_time_locked(&tm);
            st.scheduled = self.clock.now_ns() + st.period;
            if let Some(timer) = pt.timer.lock().as_ref() {
                timer.set(st.scheduled);
            }
        }
    }

    fn migrate(&self, vcpu: usize, processor: usize) {
        assert!(processor < self.pool.num_cpus());
        let mut tm = self.vcpus[vcpu].tm.lock();
        tm.processor = processor;
        for pt in &tm.list {
            if let Some(timer) = pt.timer.lock().as_ref() {
                timer.migrate(processor);
            }
        }
    }

    fn create_periodic_time(
        &self,
        vcpu: usize,
        pt: &Arc<PeriodicTime>,
        period_ns: u64,
        irq: u8,
        one_shot: bool,
        cb: Option<TickCallback>,
    ) {
        assert!(vcpu < self.vcpus.len());

        // Re-registration replaces the old registration.
        self.destroy_periodic_time(pt);

        let mut period = period_ns;
        if period < MIN_PERIOD_NS && !one_shot {
            warn!(
                "periodic timer period {}ns too small, clamping to {}ns",
                period, MIN_PERIOD_NS
            );
            period = MIN_PERIOD_NS;
        }

        let mut tm = self.vcpus[vcpu].tm.lock();
        *pt.owner.lock() = Some(vcpu);
        let scheduled = {
            let mut st = pt.state.lock();
            st.pending_intr_nr = 0;
            st.do_not_freeze = false;
            st.irq_issued = false;
            st.period = period;
            st.period_cycles = self.to_cycles(period);
            st.one_shot = one_shot;
            st.irq = irq;
            st.last_plt_gtime = self.guest_time_locked(&tm);
            st.scheduled = self.clock.now_ns() + period;
            // Offset local APIC ticks from other timer ticks. Guests that use
            // them for process accounting would otherwise see whole runs of
            // ticks land inside the ISA timer's interrupt handler.
            if pt.source == TimerSource::Lapic {
                st.scheduled += period >> 1;
            }
            st.cb = cb;
            st.on_list = true;
            st.scheduled
        };
        tm.list.push(pt.clone());

        let timer = {
            let inner = self.weak_self.clone();
            let record = Arc::downgrade(pt);
            self.pool.add_timer(
                tm.processor,
                Box::new(move || {
                    if let (Some(inner), Some(record)) = (inner.upgrade(), record.upgrade()) {
                        inner.timer_fn(&record);
                    }
                }),
            )
        };
        timer.set(scheduled);
        *pt.timer.lock() = Some(timer);
    }

    fn destroy_periodic_time(&self, pt: &Arc<PeriodicTime>) {
        // Never registered by create_periodic_time?
        if pt.owner.lock().is_none() {
            return;
        }

        if let Some((_vcpu, mut tm)) = self.pt_lock(pt) {
            let mut st = pt.state.lock();
            if st.on_list {
                tm.list.retain(|entry| !Arc::ptr_eq(entry, pt));
            }
            st.on_list = false;
        }

        // The expiry callback can run until this kill returns. It takes the
        // timer lock, so killing with the lock held would deadlock.
        let timer = pt.timer.lock().take();
        if let Some(timer) = timer {
            timer.kill();
        }
    }
}
