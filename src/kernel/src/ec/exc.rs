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

//! Exception handling

use base::hif;

use crate::arch;
use crate::cpu::{hazards, CpuId};
use crate::ec::{ipc, Cont, Ec, RetMode};
use crate::nmi;
use crate::Kernel;

/// Handles a synchronous exception of the current EC. The register frame
/// has already been stored into the EC.
///
/// Kernel-handled vectors resume the EC directly; everything else is
/// delivered to user space through the PD's event portal, and a missing
/// portal kills the EC.
pub fn handle_exc(k: &Kernel, cpu: CpuId) {
    // an NMI that hit the kernel arranges for the next iret-to-user to
    // fault; recognize that case before touching anything else
    if maybe_handle_deferred_nmi_work(k, cpu) {
        return;
    }

    let cur = k.cpu(cpu).current();
    let vec = cur.regs().vec;

    match vec {
        hif::EXC_GP => {
            if handle_exc_gp(k, cpu, &cur) {
                cur.set_cont(Cont::RetUser(RetMode::Iret));
                return;
            }
        },

        hif::EXC_PF => {
            if handle_exc_pf(k, cpu, &cur) {
                cur.set_cont(Cont::RetUser(RetMode::Iret));
                return;
            }
        },

        hif::EXC_MC => {
            k.machine().mca_vector();
        },

        _ => {
        },
    }

    let user = cur.regs().user();
    if user {
        cur.regs().dst_portal = vec;
        ipc::send_msg(k, cpu, RetMode::Iret);
        return;
    }

    ipc::die(k, cpu, "EXC");
}

fn handle_exc_gp(k: &Kernel, cpu: CpuId, cur: &base::rc::Arc<Ec>) -> bool {
    {
        let mut regs = cur.regs();
        if Ec::fixup(k, &mut regs) {
            return true;
        }
    }

    let cl = k.cpu(cpu);
    if cl.hazard() & hazards::TR != 0 {
        cl.clr_hazard(hazards::TR);

        // the VM exit has reset the TR segment limit, which breaks the
        // I/O permission bitmap; restore it
        k.machine().unbusy_tss(cpu);
        k.machine().tss_load(cpu);
        return true;
    }

    false
}

fn handle_exc_pf(k: &Kernel, _cpu: CpuId, cur: &base::rc::Arc<Ec>) -> bool {
    let (addr, err) = {
        let regs = cur.regs();
        (regs.cr2, regs.err)
    };

    if err & arch::PF_ERR_U != 0 {
        // user faults surface through the EXC_PF portal
        return false;
    }

    // all kernel tables are populated eagerly; a kernel fault is a bug
    panic!("kernel #PF at {:#x} (err {:#x})", addr, err);
}

/// Recognizes the #GP that an NMI provoked on the iret-to-user path and
/// runs the deferred NMI work instead. Returns true if this exception was
/// that trap.
pub fn maybe_handle_deferred_nmi_work(k: &Kernel, cpu: CpuId) -> bool {
    let cur = k.cpu(cpu).current();

    let exc_on_iret_to_user = {
        let regs = cur.regs();
        regs.vec == hif::EXC_GP
            && regs.cs == arch::SEL_KERN_CODE
            && regs.rip == k.machine().iret_to_user_rip()
    };

    if !exc_on_iret_to_user {
        return false;
    }

    // restore the full GDT so the retried IRET can reach user space
    k.machine().gdt_load_full(cpu);

    nmi::do_deferred_work(k, cpu);

    // retry the return; the hazard checks run again on the way out
    cur.set_cont(Cont::RetUser(RetMode::Iret));
    true
}

/// Handles a VM exit of the current (guest-mode) EC: the exit reason is
/// the portal index, so exits reuse the IPC engine.
pub fn handle_vmexit(k: &Kernel, cpu: CpuId, reason: usize) {
    let cur = k.cpu(cpu).current();

    if reason == hif::EXC_NMI {
        // an NMI-caused exit is the shootdown knocking; handle it before
        // any guest-visible delivery
        nmi::do_deferred_work(k, cpu);
    }

    cur.regs().dst_portal = reason % hif::NUM_VMI;
    ipc::send_msg(k, cpu, RetMode::VmResume);
}
