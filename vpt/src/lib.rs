// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Virtual platform timer core for a hardware-virtualized guest.
//!
//! Emulates per-vCPU periodic and one-shot interrupt sources whose rate is
//! defined in wall time but whose delivery goes through the guest's emulated
//! interrupt controllers, with selectable accounting of ticks missed while a
//! vCPU was descheduled.

mod irqchip;
mod vpt;

pub use crate::irqchip::IntAck;
pub use crate::irqchip::InterruptSource;
pub use crate::irqchip::IrqChip;
pub use crate::irqchip::TimerSource;
pub use crate::irqchip::VcpuScheduler;
pub use crate::vpt::PeriodicTime;
pub use crate::vpt::TickCallback;
pub use crate::vpt::TimerMode;
pub use crate::vpt::Vpt;
pub use crate::vpt::VptError;
