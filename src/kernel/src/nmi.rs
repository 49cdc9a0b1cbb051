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

//! TLB shootdown over NMIs
//!
//! NMI is the shootdown vector: it is never blocked, so a CPU spinning in
//! kernel mode still acknowledges. The handler runs on an alternate stack
//! and must neither take locks nor touch non-atomic state; everything
//! beyond the acknowledgment counter is deferred to a point where the
//! interrupted context is known good.

use core::sync::atomic::Ordering;

use base::io::LogFlags;
use base::log;

use crate::cpu::CpuId;
use crate::Kernel;

/// What the NMI stub must do before executing iret
#[derive(Debug, Default, Clone, Copy)]
pub struct NmiAction {
    /// skip over the interrupted `hlt` so the STI shadow cannot swallow a
    /// pending wakeup
    pub bump_rip: bool,
}

/// The NMI handler. `from_user` tells whether user (or guest) code was
/// interrupted; `rip` is the interrupted instruction.
pub fn handle_nmi(k: &Kernel, cpu: CpuId, from_user: bool, rip: usize) -> NmiAction {
    do_early_work(k, cpu);

    let mut action = NmiAction::default();

    if from_user {
        // the interrupted context is user space, so no kernel invariants
        // are in flight and the deferred work can run right here
        do_deferred_work(k, cpu);
    }
    else {
        // the kernel was interrupted at an arbitrary point; make the next
        // exit to user space fault so the deferred work runs from a known
        // good context
        if rip == k.machine().idle_hlt_rip() {
            action.bump_rip = true;
        }

        k.machine().gdt_load_kernel_only(cpu);
        k.cpu(cpu).set_hazard(crate::cpu::hazards::TLB);
    }

    action
}

/// Safe anywhere, even on the alternate stack: acknowledge the shootdown
pub fn do_early_work(k: &Kernel, cpu: CpuId) {
    k.cpu(cpu).shootdown_ack.fetch_add(1, Ordering::AcqRel);
}

/// Safe only from a known-good context: flush the host TLB if this PD has
/// stale entries on this CPU
pub fn do_deferred_work(k: &Kernel, cpu: CpuId) {
    let cur = k.cpu(cpu).current();
    if cur.pd().mem().take_stale(cpu) {
        k.machine().flush_local_tlb(cpu);
    }
}

/// Invalidates the TLB on every CPU in `mask` and waits until each one has
/// acknowledged. Establishes the happens-before edge between a revocation
/// and any future translation of the revoked range.
pub fn shootdown(k: &Kernel, cpu: CpuId, mask: u64) {
    let mut pending = [0u64; base::cfg::MAX_CPUS];
    let mut remote = 0u64;

    for c in 0..k.cpus().len() as CpuId {
        if mask & (1 << c) == 0 {
            continue;
        }
        if c == cpu {
            // the local TLB can be flushed synchronously
            let cur = k.cpu(cpu).current();
            cur.pd().mem().take_stale(cpu);
            k.machine().flush_local_tlb(cpu);
            continue;
        }

        pending[c as usize] = k.cpu(c).shootdown_ack.load(Ordering::Acquire);
        if k.machine().send_nmi(c) {
            remote |= 1 << c;
        }
        else {
            // the machine cannot interrupt the target; acknowledge in its
            // stead and leave the flush to its next kernel entry
            do_early_work(k, c);
            k.cpu(c).set_hazard(crate::cpu::hazards::TLB);
        }
    }

    for c in 0..k.cpus().len() as CpuId {
        if remote & (1 << c) == 0 {
            continue;
        }
        while k.cpu(c).shootdown_ack.load(Ordering::Acquire) == pending[c as usize] {
            core::hint::spin_loop();
        }
    }

    log!(LogFlags::KernTlb, "shootdown of {:#x} complete", mask);
}
