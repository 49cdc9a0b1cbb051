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

//! Execution contexts

pub mod exc;
pub mod ipc;

use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::boxed::Box;
use alloc::vec::Vec;

use base::cfg;
use base::errors::Code;
use base::hif::{self, Utcb};
use base::io::LogFlags;
use base::log;
use base::mem::VirtAddr;
use base::rc::{Arc, Weak};

use crate::arch::{self, ExcRegs};
use crate::cap::{Kp, Sm};
use crate::cpu::{hazards, CpuId};
use crate::pd::Pd;
use crate::sched::{self, Sc};
use crate::Kernel;

/// How an EC leaves the kernel towards user (or guest) mode
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RetMode {
    Sysexit,
    Iret,
    VmResume,
}

/// The continuation: what the kernel executes next on behalf of this EC
/// when it becomes current. Exactly one is active per EC; `None` means the
/// EC is executing in user space (or is a free local EC).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Cont {
    None,
    Idle,
    RetUser(RetMode),
    /// server side of a portal call: fetch the caller's message
    RecvUser,
    /// server side of an exception portal: fetch the caller's fault state
    RecvKern,
    /// retry a kernel-generated portal send after helping
    SendMsg(RetMode),
    /// retry a user portal call after helping
    SysCall,
    /// finish the current hypercall with a status; the flag clears a
    /// pending timeout
    SysFinish(Code, bool),
    Dead,
}

/// A thread-like execution context, pinned to one CPU
pub struct Ec {
    pd: Arc<Pd>,
    /// where the user page is mapped (the PD itself, or the creator)
    user_page_pd: Arc<Pd>,
    cpu: CpuId,
    /// scheduled on its own SC; local ECs run on donated time only
    glb: bool,
    /// event base: exception portals are looked up at `evt + vector`
    evt: usize,
    user_utcb: VirtAddr,
    utcb: Option<spin::Mutex<Box<Utcb>>>,
    regs: spin::Mutex<ExcRegs>,
    cont: spin::Mutex<Cont>,
    hazard: AtomicUsize,
    /// the EC we donate execution to while an IPC is in flight
    partner: spin::Mutex<Weak<Ec>>,
    /// the caller EC while we service a portal invocation
    rcap: spin::Mutex<Weak<Ec>>,
    /// FPU save area
    fpu: Arc<Kp>,
    /// guest-mode EC backed by a VMCS
    vcpu_mode: bool,
    /// the semaphore this EC is queued on, if any
    blocked_on: spin::Mutex<Weak<Sm>>,
    /// SCs parked on this EC while it is blocked
    parked_scs: spin::Mutex<Vec<Arc<Sc>>>,
    is_idle: bool,
}

impl Ec {
    pub const PERM_CTRL: usize = 1 << 0;
    pub const PERM_CREATE_SC: usize = 1 << 2;
    pub const PERM_CREATE_PT: usize = 1 << 3;

    /// The per-CPU idle EC; never enters user space
    pub(crate) fn new_idle(pd: Arc<Pd>, cpu: CpuId) -> Self {
        Ec {
            user_page_pd: pd.clone(),
            pd,
            cpu,
            glb: true,
            evt: 0,
            user_utcb: VirtAddr::new(0),
            utcb: None,
            regs: spin::Mutex::new(ExcRegs::default()),
            cont: spin::Mutex::new(Cont::Idle),
            hazard: AtomicUsize::new(0),
            partner: spin::Mutex::new(Weak::new()),
            rcap: spin::Mutex::new(Weak::new()),
            fpu: Arc::new(Kp::new()),
            vcpu_mode: false,
            blocked_on: spin::Mutex::new(Weak::new()),
            parked_scs: spin::Mutex::new(Vec::new()),
            is_idle: true,
        }
    }

    /// Creates an EC in `pd`, pinned to `cpu`.
    ///
    /// Global ECs start through their STARTUP portal once an SC is bound;
    /// local ECs wait for portal invocations. The UTCB is mapped at
    /// `user_page` into `user_page_pd` (the target PD, or the creator).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        k: &Kernel,
        pd: Arc<Pd>,
        user_page_pd: Arc<Pd>,
        cpu: CpuId,
        evt: usize,
        user_page: VirtAddr,
        sp: usize,
        glb: bool,
        vcpu: bool,
    ) -> Arc<Self> {
        // make sure we consider the right CPUs for TLB shootdown
        pd.mem().init_cpu(cpu);

        let utcb = (!vcpu).then(|| spin::Mutex::new(Box::new(Utcb::default())));

        let mut regs = ExcRegs::default();
        if glb {
            regs.cs = arch::SEL_USER_CODE;
            regs.ss = arch::SEL_USER_DATA;
            regs.rflags = arch::EFL_IF;
            regs.rsp = sp;
        }
        else {
            regs.set_sp(sp);
        }
        regs.dst_portal = hif::EXC_STARTUP;

        let ec = Arc::new(Ec {
            pd,
            user_page_pd,
            cpu,
            glb,
            evt,
            user_utcb: user_page,
            utcb,
            regs: spin::Mutex::new(regs),
            cont: spin::Mutex::new(Cont::None),
            hazard: AtomicUsize::new(0),
            partner: spin::Mutex::new(Weak::new()),
            rcap: spin::Mutex::new(Weak::new()),
            fpu: Arc::new(Kp::new()),
            vcpu_mode: vcpu,
            blocked_on: spin::Mutex::new(Weak::new()),
            parked_scs: spin::Mutex::new(Vec::new()),
            is_idle: false,
        });

        if user_page.raw() != 0 {
            if let Some(utcb) = &ec.utcb {
                let phys = k.machine().phys_of(utcb.lock().as_ref() as *const Utcb as *mut u8);
                let cleanup = ec.user_page_pd.mem().insert(
                    k,
                    ec.user_page_pd.asid(),
                    user_page.frame(),
                    phys >> cfg::PAGE_BITS,
                    0,
                    base::hif::MemAttr::R | base::hif::MemAttr::W,
                );
                cleanup.ignore_tlb_flush();
            }
        }

        log!(
            LogFlags::KernCaps,
            "EC created (PD:{} CPU:{} UTCB:{} EVT:{:#x} {})",
            ec.pd.asid(),
            cpu,
            user_page,
            evt,
            if glb { "global" } else { "local" }
        );

        ec
    }

    pub fn pd(&self) -> &Arc<Pd> {
        &self.pd
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn glb(&self) -> bool {
        self.glb
    }

    pub fn evt(&self) -> usize {
        self.evt
    }

    pub fn is_idle(&self) -> bool {
        self.is_idle
    }

    pub fn is_vcpu(&self) -> bool {
        self.vcpu_mode
    }

    pub(crate) fn fpu(&self) -> &Arc<Kp> {
        &self.fpu
    }

    /// The mode this EC resumes user (or guest) execution with
    pub fn ret_mode(&self) -> RetMode {
        if self.vcpu_mode {
            RetMode::VmResume
        }
        else {
            RetMode::Iret
        }
    }

    pub fn regs(&self) -> spin::MutexGuard<'_, ExcRegs> {
        self.regs.lock()
    }

    pub fn utcb(&self) -> Option<spin::MutexGuard<'_, Box<Utcb>>> {
        self.utcb.as_ref().map(|u| u.lock())
    }

    pub fn cont(&self) -> Cont {
        *self.cont.lock()
    }

    pub fn set_cont(&self, cont: Cont) {
        *self.cont.lock() = cont;
    }

    /// Atomically claims a free EC for a portal traversal: sets `cont` iff
    /// the EC currently has none
    pub(crate) fn claim(&self, cont: Cont) -> bool {
        let mut cur = self.cont.lock();
        if *cur == Cont::None {
            *cur = cont;
            true
        }
        else {
            false
        }
    }

    pub fn hazard(&self) -> usize {
        self.hazard.load(Ordering::Acquire)
    }

    pub fn set_hazard(&self, bits: usize) {
        self.hazard.fetch_or(bits, Ordering::AcqRel);
    }

    pub fn clr_hazard(&self, bits: usize) {
        self.hazard.fetch_and(!bits, Ordering::AcqRel);
    }

    pub fn partner(&self) -> Option<Arc<Ec>> {
        self.partner.lock().upgrade()
    }

    pub fn rcap(&self) -> Option<Arc<Ec>> {
        self.rcap.lock().upgrade()
    }

    /// Couples caller and server for an in-flight IPC: the caller donates
    /// execution to `srv`, and `srv` remembers whom to reply to
    pub(crate) fn set_partner(self: &Arc<Self>, srv: &Arc<Ec>) {
        *self.partner.lock() = Arc::downgrade(srv);
        *srv.rcap.lock() = Arc::downgrade(self);
    }

    /// Severs the partner link of this (caller) EC; returns true if there
    /// was one
    pub(crate) fn clr_partner(self: &Arc<Self>) -> bool {
        let partner = self.partner.lock().upgrade();
        match partner {
            Some(srv) => {
                *self.partner.lock() = Weak::new();
                let mut rcap = srv.rcap.lock();
                if let Some(r) = rcap.upgrade() {
                    if Arc::ptr_eq(&r, self) {
                        *rcap = Weak::new();
                    }
                }
                true
            },
            None => false,
        }
    }

    pub(crate) fn clr_rcap(&self) {
        *self.rcap.lock() = Weak::new();
    }

    // semaphore blocking

    pub fn blocked(&self) -> bool {
        self.blocked_on.lock().upgrade().is_some()
    }

    pub(crate) fn set_blocked_on(&self, sm: Weak<Sm>) {
        *self.blocked_on.lock() = sm;
    }

    pub(crate) fn park_sc(&self, sc: Arc<Sc>) {
        self.parked_scs.lock().push(sc);
    }

    /// Wakes a blocked EC: leaves the semaphore, cancels a pending timeout
    /// and returns the parked SCs to their ready queues
    pub(crate) fn unblock(self: &Arc<Self>, k: &Kernel) {
        let sm = self.blocked_on.lock().upgrade();
        if let Some(sm) = sm {
            sm.cancel(self);
        }
        *self.blocked_on.lock() = Weak::new();

        crate::timeout::cancel(k, self.cpu, self);

        let scs = {
            let mut parked = self.parked_scs.lock();
            core::mem::take(&mut *parked)
        };
        for sc in scs {
            sched::remote_enqueue(k, sc);
        }
    }

    /// Wakes a blocked EC with a timeout status; called when its semaphore
    /// deadline expires
    pub(crate) fn timeout_expired(self: &Arc<Self>, k: &Kernel) {
        self.set_cont(Cont::SysFinish(Code::ComTim, false));
        self.unblock(k);
    }

    /// Converts a sysexit frame into an iret frame, so that an exception
    /// portal can be delivered instead of the fast return
    pub(crate) fn redirect_to_iret(&self) {
        let mut regs = self.regs.lock();
        regs.cs = arch::SEL_USER_CODE;
        regs.ss = arch::SEL_USER_DATA;
        regs.rflags |= arch::EFL_IF;
    }

    /// Consults the fixup table for a skippable instruction at the fault
    /// address; signals the skip through the carry flag
    pub(crate) fn fixup(k: &Kernel, regs: &mut ExcRegs) -> bool {
        for (fault, cont) in k.machine().fixup_table() {
            if regs.rip == *fault {
                regs.rflags |= arch::EFL_CF;
                regs.rip = *cont;
                return true;
            }
        }
        false
    }

    // FPU handling

    fn save_fpu(&self, k: &Kernel) {
        // the idle EC never runs user code and the kernel does not use the
        // FPU, so skip the expensive state save
        if !self.is_idle {
            k.machine().fpu_save(self.fpu.page_ptr());
        }
    }

    fn load_fpu(&self, k: &Kernel) {
        if !self.is_idle {
            k.machine().fpu_load(self.fpu.page_ptr());
        }
    }

    /// Moves FPU ownership from `from` to `self` on this CPU
    pub(crate) fn transfer_fpu(self: &Arc<Self>, k: &Kernel, from: &Arc<Ec>) {
        if Arc::ptr_eq(from, self) {
            return;
        }

        from.save_fpu(k);
        self.load_fpu(k);
        *k.cpu(self.cpu).fpu_owner.lock() = Arc::downgrade(self);
    }
}

/// Services the deferred-work bits before `func` continues, in the defined
/// precedence: RCU, SCHED, RECALL, STEP, DS_ES, TLB.
pub fn handle_hazard(k: &Kernel, cpu: CpuId, hzd: usize, func: Cont) {
    let cl = k.cpu(cpu);

    if hzd & hazards::RCU != 0 {
        cl.clr_hazard(hazards::RCU);
        k.rcu.quiet(k, cpu);
    }

    if hzd & hazards::SCHED != 0 {
        cl.current().set_cont(func);
        sched::schedule(k, cpu, false);
        return;
    }

    if hzd & hazards::RECALL != 0 {
        let ec = cl.current();
        ec.clr_hazard(hazards::RECALL);

        if func == Cont::RetUser(RetMode::Sysexit) {
            ec.redirect_to_iret();
        }

        ec.regs().dst_portal = hif::EXC_RECALL;
        ipc::send_msg(k, cpu, RetMode::Iret);
        return;
    }

    if hzd & hazards::STEP != 0 {
        let ec = cl.current();
        ec.clr_hazard(hazards::STEP);

        if func == Cont::RetUser(RetMode::Sysexit) {
            ec.redirect_to_iret();
        }

        ec.regs().dst_portal = hif::EXC_DB;
        ipc::send_msg(k, cpu, RetMode::Iret);
        return;
    }

    if hzd & hazards::DS_ES != 0 {
        cl.clr_hazard(hazards::DS_ES);
        k.machine().reload_segments(cpu);
    }

    if hzd & hazards::TLB != 0 {
        cl.clr_hazard(hazards::TLB);
        let ec = cl.current();
        if ec.pd().mem().take_stale(cpu) {
            k.machine().flush_local_tlb(cpu);
        }
    }
}

#[cfg(test)]
mod ec_test;
