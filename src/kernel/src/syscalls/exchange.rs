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

//! Capability exchange: revocation, lookup, and direct delegation

use base::errors::{Code, VerboseError};
use base::hif::{syscalls::PdCtrl, Crd, Xfer};
use base::rc::Arc;

use crate::cpu::CpuId;
use crate::ec::{ipc, Ec};
use crate::pd;
use crate::Kernel;

fn finish(k: &Kernel, cpu: CpuId) -> Result<(), VerboseError> {
    ipc::sys_finish(k, cpu, Code::Success, false);
    Ok(())
}

/// Revokes a Crd in the caller's PD, or in a named PD
pub fn sys_revoke(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let (flags, crd, pd_sel) = {
        let regs = cur.regs();
        (regs.sys_flags(), Crd::from_raw(regs.arg1()), regs.arg2())
    };

    sysc_log!(cpu, "revoke(crd={:?}, flags={:#x})", crd, flags);

    let pd = if flags & base::hif::syscalls::REVOKE_REMOTE != 0 {
        get_obj!(cur.pd(), pd_sel, to_pd, 0, "PD")
    }
    else {
        cur.pd().clone()
    };

    pd::rev_crd(
        k,
        cpu,
        &pd,
        crd,
        flags & base::hif::syscalls::REVOKE_SELF != 0,
    );

    finish(k, cpu)
}

pub fn sys_pd_ctrl(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let op = cur.regs().arg1() as u8;

    match PdCtrl::try_from(op) {
        Ok(PdCtrl::Lookup) => pd_ctrl_lookup(k, cpu, cur),
        Ok(PdCtrl::Delegate) => pd_ctrl_delegate(k, cpu, cur),
        Ok(PdCtrl::MsrAccess) => pd_ctrl_msr_access(k, cpu, cur),
        Err(_) => sysc_err!(Code::BadPar, "Bad pd_ctrl op ({})", op),
    }
}

fn pd_ctrl_lookup(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let crd = Crd::from_raw(cur.regs().arg2());

    sysc_log!(cpu, "lookup(crd={:?})", crd);

    let res = cur.pd().lookup_crd(crd);
    cur.regs().set_res2(res.raw());

    finish(k, cpu)
}

/// Transfers one item between two PDs the caller holds capabilities for,
/// outside of any IPC
fn pd_ctrl_delegate(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let (src_sel, dst_sel, crd_raw, hotspot) = {
        let regs = cur.regs();
        (regs.sys_sel(), regs.arg2(), regs.arg3(), regs.arg4())
    };

    sysc_log!(
        cpu,
        "delegate(src={:#x}, dst={:#x}, crd={:#x})",
        src_sel,
        dst_sel,
        crd_raw
    );

    let src_pd = get_obj!(cur.pd(), src_sel, to_pd, 0, "PD");
    let dst_pd = get_obj!(cur.pd(), dst_sel, to_pd, 0, "PD");

    let item = Xfer {
        crd: Crd::from_raw(crd_raw),
        hotspot,
    };

    match pd::xfer_item(k, &src_pd, &dst_pd, Crd::null(), Crd::whole(item.crd.kind()), item) {
        Ok(res) => {
            cur.regs().set_res2(res.crd.raw());
            finish(k, cpu)
        },
        Err(e) => sysc_err!(e.code().to_syscall(), "Delegation failed"),
    }
}

fn pd_ctrl_msr_access(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let (flags, index, value) = {
        let regs = cur.regs();
        (regs.sys_flags(), regs.arg2() as u32, regs.arg3() as u64)
    };
    let is_write = flags & 0x1 != 0;

    if !cur.pd().is_passthrough() {
        sysc_err!(Code::BadCap, "PD without passthrough permission accessed MSRs");
    }

    sysc_log!(cpu, "msr_access(index={:#x}, write={})", index, is_write);

    if is_write {
        if !k.machine().write_msr(index, value) {
            sysc_err!(Code::BadPar, "MSR write refused");
        }
    }
    else {
        match k.machine().read_msr(index) {
            Some(val) => cur.regs().set_res2(val as usize),
            None => sysc_err!(Code::BadPar, "MSR read refused"),
        }
    }

    finish(k, cpu)
}
