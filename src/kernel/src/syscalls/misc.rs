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

//! Per-object control operations

use base::cfg;
use base::errors::{Code, VerboseError};
use base::hif::syscalls::{self, EcCtrl, KpCtrl, MachineCtrl, SmCtrl, VcpuCtrl};
use base::rc::Arc;

use crate::arch;
use crate::cap::{Kp, Pt, Vcpu};
use crate::cpu::{hazards, CpuId};
use crate::ec::{ipc, Cont, Ec, RetMode};
use crate::sched::Sc;
use crate::Kernel;

fn finish(k: &Kernel, cpu: CpuId) -> Result<(), VerboseError> {
    ipc::sys_finish(k, cpu, Code::Success, false);
    Ok(())
}

pub fn sys_ec_ctrl(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let (ec_sel, op) = {
        let regs = cur.regs();
        (regs.sys_sel(), regs.arg1() as u8)
    };

    match EcCtrl::try_from(op) {
        Ok(EcCtrl::Recall) => {
            let ec = get_obj!(cur.pd(), ec_sel, to_ec, Ec::PERM_CTRL, "EC");

            sysc_log!(cpu, "ec_ctrl::recall(ec={:#x})", ec_sel);

            if ec.hazard() & hazards::RECALL == 0 {
                ec.set_hazard(hazards::RECALL);

                // interrupt the target CPU only if the EC is running there
                // right now; otherwise the hazard is seen at its next
                // return to user anyway
                let target = ec.cpu();
                if target != cpu && Arc::ptr_eq(&k.cpu(target).current(), &ec) {
                    k.machine().send_rke_ipi(target);
                }
            }

            finish(k, cpu)
        },
        Err(_) => sysc_err!(Code::BadPar, "Bad ec_ctrl op ({})", op),
    }
}

pub fn sys_sc_ctrl(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let sc_sel = cur.regs().sys_sel();
    let sc = get_obj!(cur.pd(), sc_sel, to_sc, Sc::PERM_CTRL, "SC");

    sysc_log!(cpu, "sc_ctrl(sc={:#x})", sc_sel);

    // report consumed time in milliseconds
    let ms = sc.time() / k.platform().freq_tsc().max(1);
    cur.regs().set_res1(ms as usize);

    finish(k, cpu)
}

pub fn sys_pt_ctrl(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let (pt_sel, id) = {
        let regs = cur.regs();
        (regs.sys_sel(), regs.arg2())
    };

    let pt = get_obj!(cur.pd(), pt_sel, to_pt, Pt::PERM_CTRL, "PT");

    sysc_log!(cpu, "pt_ctrl(pt={:#x}, id={:#x})", pt_sel, id);

    pt.set_id(id);

    finish(k, cpu)
}

pub fn sys_sm_ctrl(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let (sm_sel, flags, op, time) = {
        let regs = cur.regs();
        (
            regs.sys_sel(),
            regs.sys_flags(),
            regs.arg1() as u8,
            regs.arg2() as u64,
        )
    };

    let op = match SmCtrl::try_from(op) {
        Ok(op) => op,
        Err(_) => sysc_err!(Code::BadPar, "Bad sm_ctrl op ({})", op),
    };

    // the permission bit index matches the operation
    let sm = get_obj!(cur.pd(), sm_sel, to_sm, 1 << (op as usize), "SM");

    match op {
        SmCtrl::Up => {
            sysc_log!(cpu, "sm_ctrl::up(sm={:#x})", sm_sel);
            sm.up(k);
            finish(k, cpu)
        },
        SmCtrl::Down => {
            sysc_log!(cpu, "sm_ctrl::down(sm={:#x}, time={})", sm_sel, time);

            // set up the wakeup before blocking: when the down is granted,
            // the EC finishes with success and a cleared timeout
            cur.set_cont(Cont::SysFinish(Code::Success, true));
            let zc = flags & syscalls::SM_ZERO_COPY != 0;
            sm.dn(k, cpu, zc, time);
            Ok(())
        },
    }
}

pub fn sys_kp_ctrl(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let op = cur.regs().arg1() as u8;

    match KpCtrl::try_from(op) {
        Ok(KpCtrl::Map) => sys_kp_ctrl_map(k, cpu, cur),
        Ok(KpCtrl::Unmap) => sys_kp_ctrl_unmap(k, cpu, cur),
        Err(_) => sysc_err!(Code::BadPar, "Bad kp_ctrl op ({})", op),
    }
}

fn sys_kp_ctrl_map(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let (kp_sel, dst_pd_sel, dst_addr) = {
        let regs = cur.regs();
        (regs.sys_sel(), regs.arg2(), regs.arg3())
    };

    sysc_log!(
        cpu,
        "kp_ctrl::map(kp={:#x}, dst-pd={:#x}, dst-addr={:#x})",
        kp_sel,
        dst_pd_sel,
        dst_addr
    );

    let kp = get_obj!(cur.pd(), kp_sel, to_kp, Kp::PERM_CTRL, "KP");
    let user_pd = get_obj!(cur.pd(), dst_pd_sel, to_pd, 0, "PD");

    if dst_addr >= cfg::USER_ADDR || dst_addr & cfg::PAGE_MASK != 0 {
        sysc_err!(Code::BadPar, "Invalid destination address ({:#x})", dst_addr);
    }

    if !kp.add_user_mapping(k, &user_pd, dst_addr >> cfg::PAGE_BITS) {
        sysc_err!(Code::BadPar, "KP is already mapped");
    }

    finish(k, cpu)
}

fn sys_kp_ctrl_unmap(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let kp_sel = cur.regs().sys_sel();

    sysc_log!(cpu, "kp_ctrl::unmap(kp={:#x})", kp_sel);

    let kp = get_obj!(cur.pd(), kp_sel, to_kp, Kp::PERM_CTRL, "KP");

    if !kp.remove_user_mapping(k, cpu) {
        sysc_err!(Code::BadPar, "KP is not mapped");
    }

    finish(k, cpu)
}

pub fn sys_vcpu_ctrl(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let (vcpu_sel, op) = {
        let regs = cur.regs();
        (regs.sys_sel(), regs.arg1() as u8)
    };

    let vcpu = get_obj!(cur.pd(), vcpu_sel, to_vcpu, Vcpu::PERM_CTRL, "VCPU");

    match VcpuCtrl::try_from(op) {
        Ok(VcpuCtrl::Run) => {
            sysc_log!(cpu, "vcpu_ctrl::run(vcpu={:#x})", vcpu_sel);

            let guest = vcpu.ec().clone();

            if guest.cpu() != cpu {
                sysc_err!(Code::BadCpu, "VCPU lives on CPU {}", guest.cpu());
            }

            // run the guest on the caller's donated time; the caller gets
            // control back when the guest is aborted or recalled
            if !guest.claim(Cont::RetUser(RetMode::VmResume)) {
                sysc_err!(Code::ComTim, "VCPU is busy");
            }

            cur.regs().set_status(Code::Success);
            cur.set_cont(Cont::RetUser(RetMode::Sysexit));
            cur.set_partner(&guest);
            k.cpu(cpu).make_current(guest);
            Ok(())
        },
        Ok(VcpuCtrl::Poke) => {
            sysc_log!(cpu, "vcpu_ctrl::poke(vcpu={:#x})", vcpu_sel);

            let guest = vcpu.ec().clone();
            if guest.hazard() & hazards::RECALL == 0 {
                guest.set_hazard(hazards::RECALL);

                let target = guest.cpu();
                if Arc::ptr_eq(&k.cpu(target).current(), &guest) {
                    // kick the guest out of non-root mode
                    k.machine().vcpu_poke(target);
                }
            }

            finish(k, cpu)
        },
        Err(_) => sysc_err!(Code::BadPar, "Bad vcpu_ctrl op ({})", op),
    }
}

pub fn sys_machine_ctrl(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let op = cur.regs().arg1() as u8;

    if !cur.pd().is_passthrough() {
        sysc_err!(Code::BadCap, "PD without passthrough permission called machine_ctrl");
    }

    match MachineCtrl::try_from(op) {
        Ok(MachineCtrl::Suspend) => sys_machine_ctrl_suspend(k, cpu, cur),
        Ok(MachineCtrl::UpdateMicrocode) => sys_machine_ctrl_update_microcode(k, cpu, cur),
        Err(_) => sysc_err!(Code::BadPar, "Bad machine_ctrl op ({})", op),
    }
}

fn sys_machine_ctrl_suspend(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let (slp_typa, slp_typb) = {
        let regs = cur.regs();
        (regs.arg2() as u8, regs.arg3() as u8)
    };

    sysc_log!(cpu, "machine_ctrl::suspend({}, {})", slp_typa, slp_typb);

    cur.regs().set_res1(k.machine().acpi_waking_vector());

    // on a successful suspend we never return from the call below; set up
    // the state the resume path will find
    cur.set_cont(Cont::SysFinish(Code::Success, false));

    if !k.machine().suspend(slp_typa, slp_typb) {
        sysc_err!(Code::BadPar, "Suspend failed");
    }

    Ok(())
}

fn sys_machine_ctrl_update_microcode(
    k: &Kernel,
    cpu: CpuId,
    cur: &Arc<Ec>,
) -> Result<(), VerboseError> {
    let (size, addr) = {
        let regs = cur.regs();
        (regs.arg2(), regs.arg3())
    };

    sysc_log!(cpu, "machine_ctrl::update_microcode(addr={:#x}, size={:#x})", addr, size);

    // stay within what the remap window guarantees to be accessible
    if size > k.machine().remap_guaranteed_size() {
        sysc_err!(Code::BadPar, "Microcode update too large ({:#x})", size);
    }

    let kernel_addr = match k.machine().remap(addr) {
        Some(va) => va + arch::MICROCODE_PAYLOAD_OFFSET,
        None => sysc_err!(Code::BadPar, "Update address not mappable"),
    };

    if !k
        .machine()
        .write_msr(arch::IA32_BIOS_UPDT_TRIG, kernel_addr as u64)
    {
        sysc_err!(Code::BadPar, "Microcode update refused");
    }

    // microcode loads may expose new CPU features
    k.machine().update_features();

    finish(k, cpu)
}
