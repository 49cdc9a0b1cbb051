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

use base::cfg;
use base::errors::{Code, VerboseError};
use base::hif::{syscalls, Crd, Mtd, Qpd};
use base::mem::VirtAddr;
use base::rc::Arc;

use crate::cap::{KObject, Kp, Pt, Sm, Vcpu, PERM_ALL};
use crate::cpu::CpuId;
use crate::ec::{ipc, Cont, Ec, RetMode};
use crate::pd::{self, Pd};
use crate::platform::Features;
use crate::sched::{self, Sc};
use crate::Kernel;

fn finish(k: &Kernel, cpu: CpuId) -> Result<(), VerboseError> {
    ipc::sys_finish(k, cpu, Code::Success, false);
    Ok(())
}

pub fn create_pd(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let (sel, flags, parent_sel, crd) = {
        let regs = cur.regs();
        (
            regs.sys_sel(),
            regs.sys_flags(),
            regs.arg1(),
            Crd::from_raw(regs.arg2()),
        )
    };

    sysc_log!(cpu, "create_pd(sel={:#x}, parent={:#x})", sel, parent_sel);

    let parent_cap = match cur.pd().lookup_cap(parent_sel) {
        Some(cap) => cap,
        None => sysc_err!(Code::BadCap, "Non-PD CAP ({:#x})", parent_sel),
    };
    let parent = match parent_cap.to_pd(Pd::PERM_OBJ_CREATION) {
        Some(pd) => pd,
        None => sysc_err!(Code::BadCap, "Non-PD CAP ({:#x})", parent_sel),
    };

    let passthrough = flags & syscalls::PD_PASSTHROUGH != 0 && parent.is_passthrough();
    let new_pd = Arc::new(Pd::new(passthrough));

    // the new PD's own capability inherits the permissions of the parent cap
    if cur
        .pd()
        .obj()
        .insert_root(sel, KObject::Pd(new_pd.clone()), parent_cap.perms())
        .is_err()
    {
        sysc_err!(Code::BadCap, "Non-NULL CAP ({:#x})", sel);
    }

    // seed the new PD with the requested part of the creator's object space
    if !crd.is_null() {
        let kind = match pd::space_kind(crd.kind()) {
            Some(kind) => kind,
            None => sysc_err!(Code::BadPar, "Bad initial CRD"),
        };
        if pd::delegate(
            k,
            cur.pd(),
            &new_pd,
            kind,
            crd.base(),
            crd.base(),
            crd.order(),
            crd.attr(),
        )
        .is_err()
        {
            sysc_err!(Code::BadPar, "Failed to delegate into new PD");
        }
    }

    finish(k, cpu)
}

pub fn create_ec(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let (sel, flags, pd_sel, user_page, sp, arg4) = {
        let regs = cur.regs();
        (
            regs.sys_sel(),
            regs.sys_flags(),
            regs.arg1(),
            regs.arg2(),
            regs.arg3(),
            regs.arg4(),
        )
    };
    let evt = arg4 & 0xFFFF_FFFF;
    let target_cpu = (arg4 >> 32) as CpuId;

    sysc_log!(
        cpu,
        "create_ec(sel={:#x}, pd={:#x}, cpu={}, upage={:#x}, evt={:#x})",
        sel,
        pd_sel,
        target_cpu,
        user_page,
        evt
    );

    if !k.platform().cpu_online(target_cpu) {
        sysc_err!(Code::BadCpu, "Invalid CPU ({})", target_cpu);
    }

    let pd = get_obj!(cur.pd(), pd_sel, to_pd, Pd::PERM_OBJ_CREATION, "PD");

    if user_page >= cfg::USER_ADDR || user_page & cfg::PAGE_MASK != 0 {
        sysc_err!(Code::BadPar, "Invalid UPAGE address ({:#x})", user_page);
    }

    let glb = flags & syscalls::EC_GLOBAL != 0;
    let user_page_pd = if flags & syscalls::EC_USER_PAGE_IN_OWNER != 0 {
        cur.pd().clone()
    }
    else {
        pd.clone()
    };

    let ec = Ec::new(
        k,
        pd,
        user_page_pd,
        target_cpu,
        evt,
        VirtAddr::new(user_page),
        sp,
        glb,
        false,
    );

    // a global EC reports in through its STARTUP portal once an SC arrives
    if glb {
        ec.set_cont(Cont::SendMsg(RetMode::Iret));
    }

    if cur
        .pd()
        .obj()
        .insert_root(sel, KObject::Ec(ec), PERM_ALL)
        .is_err()
    {
        sysc_err!(Code::BadCap, "Non-NULL CAP ({:#x})", sel);
    }

    finish(k, cpu)
}

pub fn create_sc(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let (sel, pd_sel, ec_sel, qpd) = {
        let regs = cur.regs();
        (
            regs.sys_sel(),
            regs.arg1(),
            regs.arg2(),
            Qpd::from_raw(regs.arg3()),
        )
    };

    sysc_log!(
        cpu,
        "create_sc(sel={:#x}, ec={:#x}, p={}, q={})",
        sel,
        ec_sel,
        qpd.prio(),
        qpd.quantum()
    );

    let _parent = get_obj!(cur.pd(), pd_sel, to_pd, Pd::PERM_OBJ_CREATION, "PD");
    let ec = get_obj!(cur.pd(), ec_sel, to_ec, Ec::PERM_CREATE_SC, "EC");

    if !ec.glb() {
        sysc_err!(Code::BadCap, "Cannot bind SC to local EC");
    }

    if qpd.prio() == 0 || qpd.quantum() == 0 || qpd.prio() >= cfg::NUM_PRIORITIES {
        sysc_err!(Code::BadPar, "Invalid QPD");
    }

    let target_cpu = ec.cpu();
    let sc = Arc::new(Sc::new(ec, target_cpu, qpd.prio(), qpd.quantum() as u64));

    if cur
        .pd()
        .obj()
        .insert_root(sel, KObject::Sc(sc.clone()), PERM_ALL)
        .is_err()
    {
        sysc_err!(Code::BadCap, "Non-NULL CAP ({:#x})", sel);
    }

    sched::remote_enqueue(k, sc);

    finish(k, cpu)
}

pub fn create_pt(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let (sel, pd_sel, ec_sel, mtd, ip) = {
        let regs = cur.regs();
        (
            regs.sys_sel(),
            regs.arg1(),
            regs.arg2(),
            Mtd::from_bits_truncate(regs.arg3() as u32),
            regs.arg4(),
        )
    };

    sysc_log!(cpu, "create_pt(sel={:#x}, ec={:#x}, ip={:#x})", sel, ec_sel, ip);

    let _parent = get_obj!(cur.pd(), pd_sel, to_pd, Pd::PERM_OBJ_CREATION, "PD");
    let ec = get_obj!(cur.pd(), ec_sel, to_ec, Ec::PERM_CREATE_PT, "EC");

    if ec.glb() {
        sysc_err!(Code::BadCap, "Cannot bind PT to global EC");
    }

    let pt = Arc::new(Pt::new(ec, VirtAddr::new(ip), mtd));

    if cur
        .pd()
        .obj()
        .insert_root(sel, KObject::Pt(pt), PERM_ALL)
        .is_err()
    {
        sysc_err!(Code::BadCap, "Non-NULL CAP ({:#x})", sel);
    }

    finish(k, cpu)
}

pub fn create_sm(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let (sel, pd_sel, count) = {
        let regs = cur.regs();
        (regs.sys_sel(), regs.arg1(), regs.arg2())
    };

    sysc_log!(cpu, "create_sm(sel={:#x}, cnt={})", sel, count);

    let _parent = get_obj!(cur.pd(), pd_sel, to_pd, Pd::PERM_OBJ_CREATION, "PD");

    let sm = Arc::new(Sm::new(count as u64));

    if cur
        .pd()
        .obj()
        .insert_root(sel, KObject::Sm(sm), PERM_ALL)
        .is_err()
    {
        sysc_err!(Code::BadCap, "Non-NULL CAP ({:#x})", sel);
    }

    finish(k, cpu)
}

pub fn create_kp(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let (sel, pd_sel) = {
        let regs = cur.regs();
        (regs.sys_sel(), regs.arg1())
    };

    sysc_log!(cpu, "create_kp(sel={:#x})", sel);

    let _parent = get_obj!(cur.pd(), pd_sel, to_pd, Pd::PERM_OBJ_CREATION, "PD");

    let kp = Arc::new(Kp::new());

    if cur
        .pd()
        .obj()
        .insert_root(sel, KObject::Kp(kp), PERM_ALL)
        .is_err()
    {
        sysc_err!(Code::BadCap, "Non-NULL CAP ({:#x})", sel);
    }

    finish(k, cpu)
}

pub fn create_vcpu(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let (sel, pd_sel, arg4) = {
        let regs = cur.regs();
        (regs.sys_sel(), regs.arg1(), regs.arg4())
    };
    let evt = arg4 & 0xFFFF_FFFF;
    let target_cpu = (arg4 >> 32) as CpuId;

    sysc_log!(cpu, "create_vcpu(sel={:#x}, pd={:#x}, cpu={})", sel, pd_sel, target_cpu);

    if !k.platform().has_feature(Features::VMX) {
        sysc_err!(Code::BadFtr, "VCPUs not supported");
    }

    if !k.platform().cpu_online(target_cpu) {
        sysc_err!(Code::BadCpu, "Invalid CPU ({})", target_cpu);
    }

    let pd = get_obj!(cur.pd(), pd_sel, to_pd, Pd::PERM_OBJ_CREATION, "PD");

    let vmcs = match k.machine().vcpu_create(pd.asid()) {
        Some(vmcs) => vmcs,
        None => sysc_err!(Code::BadFtr, "No VMCS available"),
    };

    let ec = Ec::new(
        k,
        pd.clone(),
        pd,
        target_cpu,
        evt,
        VirtAddr::new(0),
        0,
        false,
        true,
    );

    let vcpu = Arc::new(Vcpu::new(ec, vmcs));

    if cur
        .pd()
        .obj()
        .insert_root(sel, KObject::Vcpu(vcpu), PERM_ALL)
        .is_err()
    {
        sysc_err!(Code::BadCap, "Non-NULL CAP ({:#x})", sel);
    }

    finish(k, cpu)
}
