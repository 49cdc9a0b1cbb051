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

//! Device passthrough: PCI assignment and interrupt routing

use base::errors::{Code, VerboseError};
use base::hif::syscalls::IrqCtrl;
use base::rc::Arc;

use crate::arch;
use crate::cpu::CpuId;
use crate::ec::{ipc, Ec};
use crate::hw::dmar;
use crate::irq::VectorInfo;
use crate::Kernel;

fn finish(k: &Kernel, cpu: CpuId) -> Result<(), VerboseError> {
    ipc::sys_finish(k, cpu, Code::Success, false);
    Ok(())
}

/// Resolves a device page mapped in the caller to its requester id
fn dev_to_rid(k: &Kernel, cur: &Arc<Ec>, dev: usize) -> Option<u16> {
    let (phys, _, _) = cur.pd().mem().lookup(dev)?;
    k.pci.phys_to_rid(phys)
}

/// Binds a PCI device to a PD through a specific DMAR unit
pub fn sys_assign_pci(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let (pd_sel, dev, hint) = {
        let regs = cur.regs();
        (regs.sys_sel(), regs.arg2(), regs.arg3() as u16)
    };

    sysc_log!(cpu, "assign_pci(pd={:#x}, dev={:#x}, hint={:#x})", pd_sel, dev, hint);

    let pd = get_obj!(cur.pd(), pd_sel, to_pd, 0, "PD");

    let rid = match dev_to_rid(k, cur, dev) {
        Some(rid) => rid,
        None => sysc_err!(Code::BadDev, "Non-DEV CAP ({:#x})", dev),
    };

    let unit = match k.dmars.find(hint) {
        Some(unit) => unit,
        None => sysc_err!(Code::BadDev, "Invalid hint ({:#x})", hint),
    };

    if !k.machine().dmar_assign(unit, rid, pd.asid()) {
        sysc_err!(Code::BadDev, "DMAR refused device {:#x}", rid);
    }

    finish(k, cpu)
}

struct VectorArgs {
    vector: usize,
    cpu: CpuId,
    level: bool,
    active_low: bool,
    mask: bool,
}

impl VectorArgs {
    /// vector, CPU and trigger bits are packed into one argument word
    fn unpack(raw: usize) -> Self {
        VectorArgs {
            vector: raw & 0xFF,
            cpu: ((raw >> 8) & 0xFFFF) as CpuId,
            level: raw & (1 << 24) != 0,
            active_low: raw & (1 << 25) != 0,
            mask: raw & (1 << 26) != 0,
        }
    }
}

/// Validates CPU and vector numbers for the routing operations
fn check_vector_cpu(k: &Kernel, args: &VectorArgs) -> Result<(), VerboseError> {
    if args.vector >= crate::NUM_USER_VECTORS {
        sysc_err!(Code::BadPar, "Invalid interrupt vector ({})", args.vector);
    }
    if !k.platform().cpu_online(args.cpu) {
        sysc_err!(Code::BadCpu, "Invalid CPU ({})", args.cpu);
    }
    Ok(())
}

pub fn sys_irq_ctrl(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let op = cur.regs().arg1() as u8;

    if !cur.pd().is_passthrough() {
        sysc_err!(Code::BadCap, "PD without passthrough permission called irq_ctrl");
    }

    match IrqCtrl::try_from(op) {
        Ok(IrqCtrl::ConfigureVector) => irq_ctrl_configure_vector(k, cpu, cur),
        Ok(IrqCtrl::AssignIoapicPin) => irq_ctrl_assign_ioapic_pin(k, cpu, cur),
        Ok(IrqCtrl::MaskIoapicPin) => irq_ctrl_mask_ioapic_pin(k, cpu, cur),
        Ok(IrqCtrl::AssignMsi) => irq_ctrl_assign_msi(k, cpu, cur),
        Ok(IrqCtrl::AssignLvt) => irq_ctrl_assign_lvt(k, cpu, cur),
        Ok(IrqCtrl::MaskLvt) => irq_ctrl_mask_lvt(k, cpu, cur),
        Err(_) => sysc_err!(Code::BadPar, "Bad irq_ctrl op ({})", op),
    }
}

fn irq_ctrl_configure_vector(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let (sm_sel, kp_sel, raw, kp_bit) = {
        let regs = cur.regs();
        (regs.sys_sel(), regs.arg2(), regs.arg3(), (regs.arg4() & 0xFFFF) as u16)
    };
    let args = VectorArgs::unpack(raw);
    check_vector_cpu(k, &args)?;

    sysc_log!(
        cpu,
        "irq_ctrl::configure_vector(cpu={}, vec={}, sm={:#x}, kp={:#x})",
        args.cpu,
        args.vector,
        sm_sel,
        kp_sel
    );

    let sm = cur.pd().lookup_cap(sm_sel).and_then(|c| c.to_sm(0));
    let kp = cur.pd().lookup_cap(kp_sel).and_then(|c| c.to_kp(0));

    let new_info = if sm.is_none() && kp.is_none() {
        if dmar::ire(k) {
            dmar::clear_irt(k, dmar::irt_index(args.cpu, args.vector));
        }
        VectorInfo::disabled()
    }
    else {
        let Some(sm) = sm else {
            sysc_err!(Code::BadCap, "Non-SM CAP ({:#x})", sm_sel);
        };
        let Some(kp) = kp else {
            sysc_err!(Code::BadCap, "Non-KP CAP ({:#x})", kp_sel);
        };
        VectorInfo {
            sm: Some(sm),
            kp: Some(kp),
            kp_bit,
            level_src: None,
        }
    };

    *k.vector_info(args.cpu, args.vector).lock() = new_info;

    finish(k, cpu)
}

fn irq_ctrl_assign_ioapic_pin(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let (ioapic_id, pin, raw) = {
        let regs = cur.regs();
        (regs.sys_sel() as u32, regs.arg2() as u32, regs.arg3())
    };
    let args = VectorArgs::unpack(raw);
    check_vector_cpu(k, &args)?;

    let ioapic = match k.ioapics.by_id(ioapic_id) {
        Some(io) if pin < io.pins => io,
        _ => sysc_err!(Code::BadPar, "Bad IOAPIC {} pin {}", ioapic_id, pin),
    };

    sysc_log!(
        cpu,
        "irq_ctrl::assign_ioapic_pin(ioapic={}, pin={}, cpu={}, vec={})",
        ioapic_id,
        pin,
        args.cpu,
        args.vector
    );

    {
        let mut info = k.vector_info(args.cpu, args.vector).lock();
        info.level_src = args.level.then_some((ioapic_id, pin));
    }

    let aid = k.platform().apic_id(args.cpu);
    let vector = arch::VEC_USER + args.vector;

    if dmar::ire(k) {
        let index = dmar::irt_index(args.cpu, args.vector);
        dmar::set_irt(k, index, ioapic.rid, args.cpu, vector, args.level);
        k.ioapics
            .set_entry_remappable(k, ioapic_id, pin, index, vector, args.level, args.active_low);
    }
    else {
        k.ioapics
            .set_entry_compatibility(k, ioapic_id, pin, aid, vector, args.level, args.active_low);
    }

    finish(k, cpu)
}

fn irq_ctrl_mask_ioapic_pin(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let (ioapic_id, pin, raw) = {
        let regs = cur.regs();
        (regs.sys_sel() as u32, regs.arg2() as u32, regs.arg3())
    };
    let args = VectorArgs::unpack(raw);

    if k.ioapics.by_id(ioapic_id).map(|io| pin < io.pins) != Some(true) {
        sysc_err!(Code::BadPar, "Bad IOAPIC {} pin {}", ioapic_id, pin);
    }

    sysc_log!(cpu, "irq_ctrl::mask_ioapic_pin(ioapic={}, pin={}, mask={})", ioapic_id, pin, args.mask);

    k.ioapics.set_mask(k, ioapic_id, pin, args.mask);

    finish(k, cpu)
}

fn irq_ctrl_assign_msi(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let (dev, raw) = {
        let regs = cur.regs();
        (regs.arg2(), regs.arg3())
    };
    let args = VectorArgs::unpack(raw);
    check_vector_cpu(k, &args)?;

    let rid = match dev_to_rid(k, cur, dev) {
        Some(rid) => rid,
        None => sysc_err!(Code::BadDev, "Non-DEV CAP ({:#x})", dev),
    };

    sysc_log!(
        cpu,
        "irq_ctrl::assign_msi(dev={:#x}, cpu={}, vec={})",
        dev,
        args.cpu,
        args.vector
    );

    let aid = k.platform().apic_id(args.cpu);
    let vector = arch::VEC_USER + args.vector;

    let (msi_addr, msi_data) = if dmar::ire(k) {
        let index = dmar::irt_index(args.cpu, args.vector);
        dmar::set_irt(k, index, rid, args.cpu, vector, false);

        let addr = 0xFEE0_0000usize
            | (1 << 4)
            | ((0x7FFF & index as usize) << 5)
            | ((index as usize >> 15) << 2);
        (addr, 0)
    }
    else {
        (0xFEE0_0000usize | ((aid as usize) << 12), vector)
    };

    {
        let mut regs = cur.regs();
        regs.set_res1(msi_addr);
        regs.set_res2(msi_data);
    }

    finish(k, cpu)
}

/// Only the thermal-sensor LVT entry may be configured, and only if the
/// local APIC actually has one
fn check_lvt_entry(k: &Kernel, entry: usize) -> Result<(), VerboseError> {
    if entry != 0 || k.platform().lvt_max() < 5 {
        sysc_err!(Code::BadPar, "Invalid LVT entry ({})", entry);
    }
    Ok(())
}

fn irq_ctrl_assign_lvt(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let (entry, raw) = {
        let regs = cur.regs();
        (regs.arg2(), regs.arg3())
    };
    let mut args = VectorArgs::unpack(raw);
    // the LVT fires on the calling CPU
    args.cpu = cpu;
    check_vector_cpu(k, &args)?;
    check_lvt_entry(k, entry)?;

    sysc_log!(cpu, "irq_ctrl::assign_lvt(vec={})", args.vector);

    k.machine().set_therm_vector(arch::VEC_USER + args.vector);

    finish(k, cpu)
}

fn irq_ctrl_mask_lvt(k: &Kernel, cpu: CpuId, cur: &Arc<Ec>) -> Result<(), VerboseError> {
    let (entry, raw) = {
        let regs = cur.regs();
        (regs.arg2(), regs.arg3())
    };
    let args = VectorArgs::unpack(raw);
    check_lvt_entry(k, entry)?;

    sysc_log!(cpu, "irq_ctrl::mask_lvt(mask={})", args.mask);

    k.machine().set_therm_mask(args.mask);

    finish(k, cpu)
}
