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

//! Common scaffolding for the unit tests: a hosted kernel, a hand-built
//! root task, and helpers to issue hypercalls the way the entry stubs
//! would.

use base::errors::Code;
use base::hif::syscalls::Hypercall;
use base::hif::CapSel;
use base::mem::VirtAddr;
use base::rc::Arc;

use crate::arch::{ExcRegs, SEL_USER_CODE, SEL_USER_DATA};
use crate::cap::{KObject, PERM_ALL};
use crate::cpu::{CpuId, Exit};
use crate::ec::Ec;
use crate::entry;
use crate::hw::hosted::HostedMachine;
use crate::pd::Pd;
use crate::platform::{CpuInfo, Features, Platform};
use crate::sched::Sc;
use crate::Kernel;

pub const SEL_ROOT_PD: CapSel = 1;
pub const SEL_ROOT_EC: CapSel = 2;
pub const SEL_ROOT_SC: CapSel = 3;

pub fn platform(ncpus: usize, features: Features) -> Platform {
    let cpus = (0..ncpus).map(|i| CpuInfo { apic_id: i as u32 }).collect();
    Platform::new(cpus, features, 1000, 6)
}

pub fn kernel(ncpus: usize) -> Kernel {
    let machine = Arc::new(HostedMachine::new());
    Kernel::new(machine, platform(ncpus, Features::empty()), "")
}

pub fn kernel_vmx(ncpus: usize) -> Kernel {
    let machine = Arc::new(HostedMachine::with_vmx());
    Kernel::new(machine, platform(ncpus, Features::VMX), "")
}

pub fn machine(k: &Kernel) -> &HostedMachine {
    // the test kernels are always built on a hosted machine
    unsafe { &*(k.machine() as *const dyn crate::hw::Machine as *const HostedMachine) }
}

/// A hand-built root task: what the boot collaborator would create before
/// handing over to the scheduler
pub struct Root {
    pub pd: Arc<Pd>,
    pub ec: Arc<Ec>,
    pub sc: Arc<Sc>,
}

pub fn boot_root(k: &Kernel, cpu: CpuId) -> Root {
    let pd = Arc::new(Pd::new(true));
    let ec = Ec::new(
        k,
        pd.clone(),
        pd.clone(),
        cpu,
        0x100,
        VirtAddr::new(0x7000_0000_0000),
        0x7000_0000_1000,
        true,
        false,
    );
    let sc = Arc::new(Sc::new(ec.clone(), cpu, 1, 1000));

    pd.obj()
        .insert_root(SEL_ROOT_PD, KObject::Pd(pd.clone()), PERM_ALL)
        .unwrap();
    pd.obj()
        .insert_root(SEL_ROOT_EC, KObject::Ec(ec.clone()), PERM_ALL)
        .unwrap();
    pd.obj()
        .insert_root(SEL_ROOT_SC, KObject::Sc(sc.clone()), PERM_ALL)
        .unwrap();

    // pretend the root task already runs in user space
    let cl = k.cpu(cpu);
    cl.make_current(ec.clone());
    cl.set_current_sc(sc.clone());

    Root { pd, ec, sc }
}

/// Builds the register frame of a hypercall the way user space would
pub struct SysFrame {
    frame: ExcRegs,
}

impl SysFrame {
    pub fn new(id: Hypercall, flags: usize, sel: CapSel) -> Self {
        let mut frame = ExcRegs {
            cs: SEL_USER_CODE,
            ss: SEL_USER_DATA,
            ..ExcRegs::default()
        };
        frame.rdi = id as usize | (flags << 8) | (sel << 12);
        SysFrame { frame }
    }

    pub fn arg1(mut self, val: usize) -> Self {
        self.frame.rsi = val;
        self
    }

    pub fn arg2(mut self, val: usize) -> Self {
        self.frame.rdx = val;
        self
    }

    pub fn arg3(mut self, val: usize) -> Self {
        self.frame.rax = val;
        self
    }

    pub fn arg4(mut self, val: usize) -> Self {
        self.frame.r8 = val;
        self
    }

    pub fn fire(self, k: &Kernel, cpu: CpuId) -> Exit {
        entry::syscall(k, cpu, &self.frame)
    }
}

/// The status code an EC's last hypercall returned
pub fn status_of(ec: &Arc<Ec>) -> Code {
    Code::from(ec.regs().rdi as u32)
}

/// Expects that the exit resumed the given EC in user mode
pub fn expect_user<'a>(exit: &'a Exit, ec: &Arc<Ec>) -> &'a Arc<Ec> {
    match exit {
        Exit::ToUser { ec: e, .. } => {
            assert!(Arc::ptr_eq(e, ec), "wrong EC resumed");
            e
        },
        Exit::Halted => panic!("CPU halted instead of resuming"),
    }
}
