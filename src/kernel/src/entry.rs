/*
 * Copyright (C) 2025-2026 The Caldera authors
 *
 * This file is part of Caldera (a capability-based microhypervisor for x86-64).
 *
 * Caldera is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License version 2 as
 * published by the Free Software Foundation.
 *
 * Caldera is distributed in the hope that it will be useful, but
 * WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU
 * General Public License version 2 for more details.
 */

//! Kernel entry points
//!
//! The assembly stubs of the boot crate land here after saving the user
//! frame; the hosted test harness calls the same functions directly. Each
//! entry stores the frame into the current EC, runs the handler, and
//! drives the continuation loop until control leaves the kernel again.

use crate::arch::{self, ExcRegs};
use crate::cpu::{self, CpuId, Exit};
use crate::ec::{exc, Cont, RetMode};
use crate::irq;
use crate::nmi::{self, NmiAction};
use crate::sched;
use crate::syscalls;
use crate::timeout;
use crate::Kernel;

/// The hypercall entry
pub fn syscall(k: &Kernel, cpu: CpuId, frame: &ExcRegs) -> Exit {
    {
        let cur = k.cpu(cpu).current();
        *cur.regs() = frame.clone();
    }
    syscalls::handle(k, cpu);
    cpu::run(k, cpu)
}

/// The exception entry (synchronous faults and traps)
pub fn exception(k: &Kernel, cpu: CpuId, frame: &ExcRegs) -> Exit {
    {
        let cur = k.cpu(cpu).current();
        let mut regs = cur.regs();
        *regs = frame.clone();
        regs.dst_portal = frame.vec;
    }
    exc::handle_exc(k, cpu);
    cpu::run(k, cpu)
}

/// The external-interrupt entry
pub fn interrupt(k: &Kernel, cpu: CpuId, vector: usize) -> Exit {
    if vector == arch::VEC_IPI_RKE {
        sched::rke_handler(k, cpu);
    }
    else if vector >= arch::VEC_USER {
        irq::handle_user_irq(k, cpu, vector - arch::VEC_USER);
    }

    // resume the interrupted EC where it was, modulo hazards
    let cur = k.cpu(cpu).current();
    if cur.cont() == Cont::None {
        cur.set_cont(Cont::RetUser(cur.ret_mode()));
    }

    cpu::run(k, cpu)
}

/// The timer entry: expired timeouts wake up, and the quantum check runs
/// at the next dispatch
pub fn timer(k: &Kernel, cpu: CpuId) -> Exit {
    timeout::expire(k, cpu);
    k.cpu(cpu).set_hazard(crate::cpu::hazards::SCHED);

    let cur = k.cpu(cpu).current();
    if cur.cont() == Cont::None {
        cur.set_cont(Cont::RetUser(cur.ret_mode()));
    }

    cpu::run(k, cpu)
}

/// The NMI entry. Runs on the alternate stack and returns directly; the
/// returned action tells the stub how to leave.
pub fn nmi_altstack(k: &Kernel, cpu: CpuId, from_user: bool, rip: usize) -> NmiAction {
    nmi::handle_nmi(k, cpu, from_user, rip)
}

/// The double-fault entry (alternate stack). A #DF means the kernel state
/// is beyond recovery.
pub fn double_fault(cpu: CpuId, rip: usize) -> ! {
    panic!("double fault on CPU {} at RIP {:#x}", cpu, rip);
}

/// The VM-exit entry
pub fn vmexit(k: &Kernel, cpu: CpuId, reason: usize, frame: &ExcRegs) -> Exit {
    {
        let cur = k.cpu(cpu).current();
        *cur.regs() = frame.clone();
    }
    exc::handle_vmexit(k, cpu, reason);
    cpu::run(k, cpu)
}

/// Boot handoff: starts scheduling on this CPU. The boot collaborator has
/// created the root task's PD/EC/SC through the kernel PD before calling
/// this.
pub fn bsp_ready(k: &Kernel, cpu: CpuId) -> Exit {
    k.cpu(cpu).set_hazard(crate::cpu::hazards::SCHED);
    cpu::run(k, cpu)
}
