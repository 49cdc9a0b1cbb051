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

//! The IPC engine
//!
//! Portal traversal couples two ECs through the partner/rcap pair: the
//! caller donates its execution (and its SC's time) to the server until
//! the server replies. A busy server is helped by transitively activating
//! along the partner chain; help that cannot make progress is broken with
//! a timeout.

use base::cfg;
use base::errors::{Code, Error};
use base::hif::{syscalls, Crd, Mtd, Utcb};
use base::io::LogFlags;
use base::log;
use base::rc::Arc;

use crate::arch::ExcRegs;
use crate::cpu::CpuId;
use crate::ec::{Cont, Ec, RetMode};
use crate::pd;
use crate::sched;
use crate::timeout;
use crate::Kernel;

/// Completes the current hypercall: writes the status and arranges the
/// fast return to user space
pub fn sys_finish(k: &Kernel, cpu: CpuId, status: Code, clear_timeout: bool) {
    let cur = k.cpu(cpu).current();

    if clear_timeout {
        timeout::cancel(k, cpu, &cur);
    }

    cur.regs().set_status(status);
    cur.set_cont(Cont::RetUser(RetMode::Sysexit));
}

/// The user-initiated portal call
pub fn sys_call(k: &Kernel, cpu: CpuId) {
    let cl = k.cpu(cpu);
    let cur = cl.current();

    let (sel, flags) = {
        let regs = cur.regs();
        (regs.sys_sel(), regs.sys_flags())
    };

    let pt = match cur.pd().lookup_cap(sel).and_then(|c| c.to_pt(0)) {
        Some(pt) => pt,
        None => return sys_finish(k, cpu, Code::BadCap, false),
    };

    let srv = pt.ec().clone();

    if srv.cpu() != cur.cpu() {
        return sys_finish(k, cpu, Code::BadCpu, false);
    }

    if srv.claim(Cont::RecvUser) {
        // the status the caller wakes up with unless the reply overrides it
        cur.regs().set_status(Code::Success);
        cur.set_cont(Cont::RetUser(RetMode::Sysexit));
        cur.set_partner(&srv);
        cur.regs().mtd = pt.mtd();

        {
            let mut regs = srv.regs();
            regs.set_pt(pt.id());
            regs.set_ip(pt.ip());
        }

        log!(LogFlags::KernIpc, "call PT:{:#x} -> EC (ip={})", sel, pt.ip());
        cl.make_current(srv);
        return;
    }

    if flags & syscalls::CALL_DISABLE_BLOCKING == 0 && help(k, cpu, &srv, Cont::SysCall) {
        return;
    }

    sys_finish(k, cpu, Code::ComTim, false);
}

/// Kernel-generated portal send: delivers the current EC's pending event
/// (exception, recall, VM exit) through the portal at `evt + dst_portal`.
/// The current EC resumes via `mode` once the handler replies.
pub fn send_msg(k: &Kernel, cpu: CpuId, mode: RetMode) {
    let cl = k.cpu(cpu);
    let cur = cl.current();

    let dst_portal = cur.regs().dst_portal;
    let pt = match cur
        .pd()
        .lookup_cap(cur.evt() + dst_portal)
        .and_then(|c| c.to_pt(0))
    {
        Some(pt) => pt,
        None => return die(k, cpu, "PT not found"),
    };

    let srv = pt.ec().clone();

    if srv.cpu() != cur.cpu() {
        return die(k, cpu, "PT wrong CPU");
    }

    if srv.claim(Cont::RecvKern) {
        cur.set_cont(Cont::RetUser(mode));
        cur.set_partner(&srv);
        cur.regs().mtd = pt.mtd();

        {
            let mut regs = srv.regs();
            regs.set_pt(pt.id());
            regs.set_ip(pt.ip());
        }

        cl.make_current(srv);
        return;
    }

    if help(k, cpu, &srv, Cont::SendMsg(mode)) {
        return;
    }

    die(k, cpu, "IPC timeout");
}

/// Transitive execution donation: the current EC funds `target`'s work by
/// activating along its partner chain, retrying `retry` once the chain
/// unwinds.
///
/// Returns false iff no progress is possible (the target is dead, or the
/// help recursion reached the livelock watermark); the caller then
/// converts that into a timeout. This is the only way help "returns".
pub(crate) fn help(k: &Kernel, cpu: CpuId, target: &Arc<Ec>, retry: Cont) -> bool {
    let cl = k.cpu(cpu);

    if target.cont() == Cont::Dead {
        return false;
    }

    let n = cl.help_ctr.fetch_add(1, core::sync::atomic::Ordering::AcqRel) + 1;
    if n >= cfg::MAX_HELP {
        return false;
    }

    cl.current().set_cont(retry);
    activate(k, cpu, target.clone());
    true
}

/// Walks the partner chain from `ec` to its end and runs the result on the
/// current (possibly donated) SC. A blocked chain end parks the SC until
/// the blocker is woken. A cycle in the chain is broken with a timeout for
/// the activating EC.
pub(crate) fn activate(k: &Kernel, cpu: CpuId, ec: Arc<Ec>) {
    let cl = k.cpu(cpu);

    let mut end = ec;
    let mut links = 0usize;
    while let Some(p) = end.partner() {
        links += 1;
        if links >= cfg::MAX_HELP {
            // partner cycle; charge the activator and give up
            cl.current().set_cont(Cont::SysFinish(Code::ComTim, false));
            return;
        }
        end = p;
    }
    cl.link_ctr.store(links, core::sync::atomic::Ordering::Release);

    if end.blocked() {
        end.park_sc(cl.current_sc());
        sched::schedule(k, cpu, true);
        return;
    }

    cl.make_current(end);
}

/// Server side of a user portal call: copy the caller's message and
/// transfer its typed items
pub fn recv_user(k: &Kernel, cpu: CpuId) {
    let cur = k.cpu(cpu).current();

    let caller = match cur.rcap() {
        Some(ec) => ec,
        None => return die(k, cpu, "recv without caller"),
    };

    let tcnt = {
        let (Some(src), Some(mut dst)) = (caller.utcb(), cur.utcb()) else {
            return die(k, cpu, "recv without UTCB");
        };
        src.save(&mut dst);
        dst.tcnt()
    };

    if tcnt > 0 {
        if let Err(e) = delegate(k, cpu, true) {
            log!(LogFlags::Error, "item transfer in recv failed: {:?}", e);
            return die(k, cpu, "delegation failed");
        }
    }

    cur.set_cont(Cont::RetUser(RetMode::Sysexit));
}

/// Server side of an exception portal: mirror the caller's fault state
/// into the handler's UTCB
pub fn recv_kern(k: &Kernel, cpu: CpuId) {
    let cur = k.cpu(cpu).current();

    let caller = match cur.rcap() {
        Some(ec) => ec,
        None => return die(k, cpu, "recv without caller"),
    };

    let fpu = {
        let Some(mut utcb) = cur.utcb() else {
            return die(k, cpu, "recv without UTCB");
        };
        let regs = caller.regs();
        match caller.cont() {
            Cont::RetUser(RetMode::Iret) => load_exc(&mut utcb, &regs),
            Cont::RetUser(RetMode::VmResume) => load_vmx(&mut utcb, &regs),
            _ => false,
        }
    };

    if fpu {
        caller.transfer_fpu(k, &cur);
    }

    cur.set_cont(Cont::RetUser(RetMode::Sysexit));
}

/// The reply hypercall: wake the caller with the server's message
pub fn sys_reply(k: &Kernel, cpu: CpuId) {
    let cur = k.cpu(cpu).current();
    let mut sm = None;

    if let Some(caller) = cur.rcap() {
        let sm_sel = cur.regs().sys_sel();
        if sm_sel != 0 {
            sm = cur.pd().lookup_cap(sm_sel).and_then(|c| c.to_sm(0));

            // reply-and-wait: the caller re-enters its call once the
            // semaphore grants it
            if sm.is_some() && caller.cont() == Cont::RetUser(RetMode::Sysexit) {
                caller.set_cont(Cont::SysCall);
            }
        }

        let tcnt = cur.utcb().map(|u| u.tcnt()).unwrap_or(0);
        let mut status = Code::Success;
        if tcnt > 0 {
            if let Err(e) = delegate(k, cpu, false) {
                // items transferred so far stay in place; the caller is
                // still woken, but sees the failure
                status = e.code().to_syscall();
            }
        }

        let fpu = match caller.cont() {
            Cont::RetUser(RetMode::Sysexit) | Cont::SysCall => {
                if let (Some(src), Some(mut dst)) = (cur.utcb(), caller.utcb()) {
                    src.save(&mut dst);
                }
                false
            },
            Cont::RetUser(RetMode::Iret) => {
                if let Some(src) = cur.utcb() {
                    let mut regs = caller.regs();
                    save_exc(&src, &mut regs)
                }
                else {
                    false
                }
            },
            Cont::RetUser(RetMode::VmResume) => {
                if let Some(src) = cur.utcb() {
                    let mut regs = caller.regs();
                    save_vmx(&src, &mut regs)
                }
                else {
                    false
                }
            },
            _ => false,
        };

        if fpu {
            cur.transfer_fpu(k, &caller);
        }

        if status != Code::Success && caller.cont() == Cont::RetUser(RetMode::Sysexit) {
            caller.regs().set_status(status);
        }
    }

    reply(k, cpu, Cont::None, sm);
}

/// The common reply tail: release the server, hand the donated time back
/// along the partner chain
pub(crate) fn reply(k: &Kernel, cpu: CpuId, c: Cont, sm: Option<Arc<crate::cap::Sm>>) {
    let cl = k.cpu(cpu);
    let cur = cl.current();

    cur.set_cont(c);

    // a global EC "replying" has no caller to return to; yield its SC
    if cur.glb() && !cur.is_idle() {
        sched::schedule(k, cpu, true);
        return;
    }

    let caller = match cur.rcap() {
        Some(ec) => ec,
        None => {
            // nobody to reply to: give the time back to the SC's owner
            let owner = cl.current_sc().ec().clone();
            activate(k, cpu, owner);
            return;
        },
    };
    cur.clr_rcap();

    let clr = caller.clr_partner();

    // if the borrowed SC belongs to the caller and its capability is gone,
    // this was its last journey
    let sc = cl.current_sc();
    if Arc::ptr_eq(sc.ec(), &caller) && sched::last_ref(&sc) {
        sched::schedule(k, cpu, true);
        return;
    }

    if let Some(sm) = sm {
        if !sm.dn_for(k, &caller) {
            // the caller went to sleep on the semaphore
            let owner = cl.current_sc().ec().clone();
            activate(k, cpu, owner);
            return;
        }
    }

    if !clr {
        // the caller was not waiting for us (e.g. it already timed out)
        let owner = cl.current_sc().ec().clone();
        activate(k, cpu, owner);
        return;
    }

    activate(k, cpu, caller);
}

/// Kills the current EC: a waiting caller is aborted, the EC itself never
/// runs again
pub fn die(k: &Kernel, cpu: CpuId, reason: &str) {
    let cur = k.cpu(cpu).current();

    {
        let regs = cur.regs();
        log!(
            LogFlags::Error,
            "Killed EC on CPU {} V:{:#x} RIP:{:#x} CR2:{:#x} ERR:{:#x} ({})",
            cpu,
            regs.vec,
            regs.rip,
            regs.cr2,
            regs.err,
            reason
        );
    }

    if let Some(caller) = cur.rcap() {
        let cont = if caller.cont() == Cont::RetUser(RetMode::Sysexit) {
            Cont::SysFinish(Code::ComAbt, false)
        }
        else {
            Cont::Dead
        };
        caller.set_cont(cont);
    }

    reply(k, cpu, Cont::Dead, None);
}

/// Transfers the typed items of the in-flight IPC.
///
/// `to_current` selects the direction: true while the server receives
/// (caller -> current), false while it replies (current -> caller).
pub(crate) fn delegate(k: &Kernel, cpu: CpuId, to_current: bool) -> Result<(), Error> {
    let cur = k.cpu(cpu).current();
    let caller = cur.rcap().ok_or_else(|| Error::new(Code::InvalidMapping))?;

    let (src, dst) = if to_current {
        (caller.clone(), cur.clone())
    }
    else {
        (cur.clone(), caller.clone())
    };

    // a receiver in a syscall continuation designates its windows itself;
    // an exception receiver implicitly accepts the faulting page
    let user = to_current || dst.cont() == Cont::RetUser(RetMode::Sysexit);
    let (xlt_win, del_win) = if user {
        match dst.utcb() {
            Some(u) => (u.head.xlt, u.head.del),
            None => (Crd::null(), Crd::null()),
        }
    }
    else {
        let cr2 = if dst.cont() == Cont::RetUser(RetMode::Iret) {
            dst.regs().cr2
        }
        else {
            0
        };
        (Crd::null(), Crd::mem(cr2 >> cfg::PAGE_BITS, 0, base::hif::MemAttr::all()))
    };

    let items: alloc::vec::Vec<_> = match src.utcb() {
        Some(u) => u.typed_items().to_vec(),
        None => return Ok(()),
    };

    let mut out = [base::hif::Xfer::default(); cfg::MAX_XFER_ITEMS];
    let done = pd::xfer_items(
        k,
        src.pd(),
        dst.pd(),
        xlt_win,
        del_win,
        &items,
        &mut out,
    )?;

    if user {
        if let Some(mut u) = dst.utcb() {
            u.items[..done].copy_from_slice(&out[..done]);
            u.head.tcnt = done;
        }
    }

    Ok(())
}

// the architectural state mirrored between register frame and UTCB on
// exception portals; selected by the message transfer descriptor

fn load_exc(utcb: &mut Utcb, regs: &ExcRegs) -> bool {
    let mtd = regs.mtd;

    if mtd.contains(Mtd::GPR) {
        utcb.gpr[0] = regs.rax as u64;
        utcb.gpr[1] = regs.rbx as u64;
        utcb.gpr[2] = regs.rcx as u64;
        utcb.gpr[3] = regs.rdx as u64;
        utcb.gpr[4] = regs.rsi as u64;
        utcb.gpr[5] = regs.rdi as u64;
        utcb.gpr[6] = regs.rbp as u64;
    }
    if mtd.contains(Mtd::GPR_HI) {
        utcb.gpr[7] = regs.r8 as u64;
        utcb.gpr[8] = regs.r9 as u64;
        utcb.gpr[9] = regs.r10 as u64;
        utcb.gpr[10] = regs.r11 as u64;
        utcb.gpr[11] = regs.r12 as u64;
        utcb.gpr[12] = regs.r13 as u64;
        utcb.gpr[13] = regs.r14 as u64;
        utcb.gpr[14] = regs.r15 as u64;
    }
    if mtd.contains(Mtd::RSP) {
        utcb.rsp = regs.rsp as u64;
    }
    if mtd.contains(Mtd::RIP) {
        utcb.rip = regs.rip as u64;
    }
    if mtd.contains(Mtd::RFLAGS) {
        utcb.rflags = regs.rflags as u64;
    }
    if mtd.contains(Mtd::QUAL) {
        utcb.qual[0] = regs.err as u64;
        utcb.qual[1] = regs.cr2 as u64;
    }

    utcb.head.mtd = mtd;
    mtd.contains(Mtd::FPU)
}

fn save_exc(utcb: &Utcb, regs: &mut ExcRegs) -> bool {
    let mtd = utcb.head.mtd;

    if mtd.contains(Mtd::GPR) {
        regs.rax = utcb.gpr[0] as usize;
        regs.rbx = utcb.gpr[1] as usize;
        regs.rcx = utcb.gpr[2] as usize;
        regs.rdx = utcb.gpr[3] as usize;
        regs.rsi = utcb.gpr[4] as usize;
        regs.rdi = utcb.gpr[5] as usize;
        regs.rbp = utcb.gpr[6] as usize;
    }
    if mtd.contains(Mtd::GPR_HI) {
        regs.r8 = utcb.gpr[7] as usize;
        regs.r9 = utcb.gpr[8] as usize;
        regs.r10 = utcb.gpr[9] as usize;
        regs.r11 = utcb.gpr[10] as usize;
        regs.r12 = utcb.gpr[11] as usize;
        regs.r13 = utcb.gpr[12] as usize;
        regs.r14 = utcb.gpr[13] as usize;
        regs.r15 = utcb.gpr[14] as usize;
    }
    if mtd.contains(Mtd::RSP) {
        regs.rsp = utcb.rsp as usize;
    }
    if mtd.contains(Mtd::RIP) {
        regs.rip = utcb.rip as usize;
    }
    if mtd.contains(Mtd::RFLAGS) {
        regs.rflags = utcb.rflags as usize;
    }

    mtd.contains(Mtd::FPU)
}

fn load_vmx(utcb: &mut Utcb, regs: &ExcRegs) -> bool {
    // guest state beyond the GPRs lives in the VMCS and is accessed by the
    // handler through vcpu_ctrl; the frame itself mirrors like exceptions
    let fpu = load_exc(utcb, regs);
    utcb.inst_len = regs.err as u64;
    fpu
}

fn save_vmx(utcb: &Utcb, regs: &mut ExcRegs) -> bool {
    save_exc(utcb, regs)
}

#[cfg(test)]
mod ipc_test;
