// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interfaces to the emulated interrupt controllers and the vCPU scheduler.
//!
//! The timer core never models controller registers itself; it only needs to
//! ask whether a line is masked, resolve a line to a guest-visible vector,
//! and assert lines. The embedder implements these against its local APIC,
//! 8259 pair and I/O APIC models.

/// Which emulated controller a platform timer asserts when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerSource {
    /// The timer's `irq` is a vector injected directly into the owning vCPU's
    /// local APIC.
    Lapic,
    /// The timer's `irq` is an ISA IRQ (0-15), deliverable through the 8259
    /// pair or through the I/O APIC redirection entry at its GSI.
    Isa,
}

/// The delivery path on which the guest observed a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptSource {
    /// ExtINT delivery from the 8259 pair.
    Pic,
    /// Fixed delivery from the local APIC (directly injected or routed via
    /// the I/O APIC).
    Lapic,
}

/// A guest acknowledgement of an interrupt vector.
#[derive(Debug, Clone, Copy)]
pub struct IntAck {
    pub vector: u8,
    pub source: InterruptSource,
}

/// The interrupt-controller surface consumed by the timer core.
///
/// Mask and vector queries may be issued while the core holds a vCPU's timer
/// lock, so implementations must not call back into the timer core from
/// them. Line assertions (`lapic_set_irq`, `isa_irq_assert`,
/// `isa_irq_deassert`) are always made with no timer lock held.
pub trait IrqChip: Send + Sync {
    /// Whether `vcpu_id`'s local APIC is software-enabled.
    fn lapic_enabled(&self, vcpu_id: usize) -> bool;

    /// Mask bit of `vcpu_id`'s local APIC timer LVT entry.
    fn lapic_timer_masked(&self, vcpu_id: usize) -> bool;

    /// Whether `vcpu_id`'s local APIC accepts ExtINT interrupts from the PIC.
    fn lapic_accepts_pic(&self, vcpu_id: usize) -> bool;

    /// Whether ISA IRQ `irq` is masked in the IMR of the 8259 that serves it.
    fn pic_masked(&self, irq: u8) -> bool;

    /// Base vector programmed into the 8259 that serves ISA IRQ `irq`. The
    /// line's vector is this base plus the line's index within that chip.
    fn pic_vector_base(&self, irq: u8) -> u8;

    /// The global system interrupt the I/O APIC receives ISA IRQ `irq` on.
    fn isa_irq_to_gsi(&self, irq: u8) -> usize;

    /// Mask bit of the I/O APIC redirection entry at `gsi`.
    fn ioapic_masked(&self, gsi: usize) -> bool;

    /// Vector field of the I/O APIC redirection entry at `gsi`.
    fn ioapic_vector(&self, gsi: usize) -> u8;

    /// Edge-injects `vector` into `vcpu_id`'s local APIC.
    fn lapic_set_irq(&self, vcpu_id: usize, vector: u8);

    /// Asserts ISA IRQ `irq`.
    fn isa_irq_assert(&self, irq: u8);

    /// Deasserts ISA IRQ `irq`.
    fn isa_irq_deassert(&self, irq: u8);
}

/// The scheduler surface consumed by the timer core.
pub trait VcpuScheduler: Send + Sync {
    /// Wakes `vcpu_id` if it is halted and forces it out of guest execution
    /// so pending timer interrupts get injected on the next entry.
    fn kick(&self, vcpu_id: usize);

    /// Whether `vcpu_id` is blocked waiting for an interrupt.
    fn is_blocked(&self, vcpu_id: usize) -> bool;
}
