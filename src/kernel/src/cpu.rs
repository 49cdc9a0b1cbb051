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

//! Per-CPU state and the continuation dispatch loop

use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use alloc::boxed::Box;
use alloc::vec::Vec;

use base::rc::{Arc, Weak};

use crate::ec::{self, Cont, Ec, RetMode};
use crate::sched::{self, ReadyQueue, Sc};
use crate::timeout::TimeoutQueue;
use crate::Kernel;

pub type CpuId = u16;

/// The deferred-work bits. The per-CPU word is OR'd with the per-EC word
/// and serviced at every return-to-user boundary, in the order RCU,
/// SCHED, RECALL, STEP, DS_ES, TLB.
pub mod hazards {
    /// this CPU must pass through a quiescent state
    pub const RCU: usize = 1 << 0;
    /// a scheduling decision is due
    pub const SCHED: usize = 1 << 1;
    /// user space asked to recall this EC through its event portal
    pub const RECALL: usize = 1 << 2;
    /// single-step trap armed
    pub const STEP: usize = 1 << 3;
    /// data segment registers must be reloaded (sysexit path only)
    pub const DS_ES: usize = 1 << 4;
    /// the TSS must be reloaded after a VM exit clobbered its limit
    pub const TR: usize = 1 << 5;
    /// the host TLB of the current PD may hold stale entries
    pub const TLB: usize = 1 << 6;
}

/// What a CPU was last seen doing; steers whether a remote enqueue needs
/// to interrupt it
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum CpuState {
    Kernel = 0,
    User = 1,
    Idle = 2,
}

/// Why [`run`] handed control back to its caller (only a hosted machine
/// does; on bare metal resuming user space never returns)
pub enum Exit {
    ToUser { ec: Arc<Ec>, mode: RetMode },
    Halted,
}

struct RemoteNode {
    sc: Arc<Sc>,
    next: *mut RemoteNode,
}

/// The lock-free inbox for SCs enqueued by other CPUs
#[derive(Default)]
pub struct RemoteQueue {
    head: AtomicPtr<RemoteNode>,
}

impl RemoteQueue {
    pub fn push(&self, sc: Arc<Sc>) {
        let node = Box::into_raw(Box::new(RemoteNode {
            sc,
            next: core::ptr::null_mut(),
        }));
        loop {
            let head = self.head.load(Ordering::Acquire);
            unsafe { (*node).next = head };
            if self
                .head
                .compare_exchange(head, node, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Takes all queued SCs, oldest first
    pub fn drain(&self) -> Vec<Arc<Sc>> {
        let mut head = self.head.swap(core::ptr::null_mut(), Ordering::AcqRel);
        let mut scs = Vec::new();
        while !head.is_null() {
            let node = unsafe { Box::from_raw(head) };
            head = node.next;
            scs.push(node.sc);
        }
        scs.reverse();
        scs
    }
}

impl Drop for RemoteQueue {
    fn drop(&mut self) {
        self.drain();
    }
}

/// The per-CPU kernel state
pub struct CpuLocal {
    id: CpuId,
    hazard: AtomicUsize,
    state: AtomicUsize,
    current: spin::Mutex<Option<Arc<Ec>>>,
    current_sc: spin::Mutex<Option<Arc<Sc>>>,
    idle: spin::Once<Arc<Ec>>,
    idle_sc: spin::Once<Arc<Sc>>,
    pub(crate) rq: spin::Mutex<ReadyQueue>,
    pub(crate) remote: RemoteQueue,
    /// incremented by the early NMI work; read by shootdown initiators
    pub(crate) shootdown_ack: AtomicU64,
    pub(crate) fpu_owner: spin::Mutex<Weak<Ec>>,
    pub(crate) timeouts: spin::Mutex<TimeoutQueue>,
    /// TSC timestamp at which the current SC was switched in
    pub(crate) sc_started: AtomicU64,
    /// length of the partner chain walked by the last activation
    pub(crate) link_ctr: AtomicUsize,
    /// help recursions charged against the livelock watermark
    pub(crate) help_ctr: AtomicUsize,
}

impl CpuLocal {
    pub(crate) fn new(id: CpuId) -> Self {
        CpuLocal {
            id,
            hazard: AtomicUsize::new(0),
            state: AtomicUsize::new(CpuState::Kernel as usize),
            current: spin::Mutex::new(None),
            current_sc: spin::Mutex::new(None),
            idle: spin::Once::new(),
            idle_sc: spin::Once::new(),
            rq: spin::Mutex::new(ReadyQueue::default()),
            remote: RemoteQueue::default(),
            shootdown_ack: AtomicU64::new(0),
            fpu_owner: spin::Mutex::new(Weak::new()),
            timeouts: spin::Mutex::new(TimeoutQueue::default()),
            sc_started: AtomicU64::new(0),
            link_ctr: AtomicUsize::new(0),
            help_ctr: AtomicUsize::new(0),
        }
    }

    /// Creates the idle EC/SC pair of this CPU and makes it current
    pub(crate) fn init_idle(&self, k: &Kernel) {
        let idle = Arc::new(Ec::new_idle(k.kern_pd().clone(), self.id));
        let idle_sc = Arc::new(Sc::new_idle(idle.clone(), self.id));
        self.idle.call_once(|| idle.clone());
        self.idle_sc.call_once(|| idle_sc.clone());
        *self.current.lock() = Some(idle);
        *self.current_sc.lock() = Some(idle_sc);
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    pub fn idle_ec(&self) -> &Arc<Ec> {
        self.idle.get().unwrap()
    }

    pub(crate) fn idle_sc(&self) -> &Arc<Sc> {
        self.idle_sc.get().unwrap()
    }

    pub fn current(&self) -> Arc<Ec> {
        self.current.lock().as_ref().unwrap().clone()
    }

    pub(crate) fn make_current(&self, ec: Arc<Ec>) {
        *self.current.lock() = Some(ec);
    }

    pub fn current_sc(&self) -> Arc<Sc> {
        self.current_sc.lock().as_ref().unwrap().clone()
    }

    pub(crate) fn set_current_sc(&self, sc: Arc<Sc>) {
        *self.current_sc.lock() = Some(sc);
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

    pub fn state(&self) -> CpuState {
        match self.state.load(Ordering::Acquire) {
            1 => CpuState::User,
            2 => CpuState::Idle,
            _ => CpuState::Kernel,
        }
    }

    pub(crate) fn set_state(&self, state: CpuState) {
        self.state.store(state as usize, Ordering::Release);
    }
}

/// Advances the continuation state machine of the given CPU until control
/// leaves the kernel.
///
/// Every state transition of the IPC engine, the scheduler and the hazard
/// machinery funnels through this loop: the handlers update the current
/// EC's continuation (and possibly the current EC itself) and return, and
/// the loop dispatches whatever comes next.
pub fn run(k: &Kernel, cpu: CpuId) -> Exit {
    loop {
        let cl = k.cpu(cpu);
        let ec = cl.current();

        match ec.cont() {
            Cont::Idle => {
                let hzd = cl.hazard() & (hazards::RCU | hazards::SCHED);
                if hzd != 0 {
                    ec::handle_hazard(k, cpu, hzd, Cont::Idle);
                    continue;
                }

                // idle time drives grace periods forward
                k.rcu.update(k, cpu);

                cl.help_ctr.store(0, Ordering::Release);
                cl.set_state(CpuState::Idle);
                let resumed = k.machine().halt(cpu);
                cl.set_state(CpuState::Kernel);
                if !resumed {
                    return Exit::Halted;
                }
            },

            Cont::RetUser(mode) => {
                let mask = match mode {
                    // IRET reloads the data segments anyway
                    RetMode::Iret => {
                        hazards::RCU
                            | hazards::SCHED
                            | hazards::RECALL
                            | hazards::STEP
                            | hazards::TLB
                    },
                    _ => {
                        hazards::RCU
                            | hazards::SCHED
                            | hazards::RECALL
                            | hazards::STEP
                            | hazards::DS_ES
                            | hazards::TLB
                    },
                };
                let hzd = (cl.hazard() | ec.hazard()) & mask;
                if hzd != 0 {
                    ec::handle_hazard(k, cpu, hzd, Cont::RetUser(mode));
                    continue;
                }

                ec.set_cont(Cont::None);
                cl.help_ctr.store(0, Ordering::Release);
                cl.set_state(CpuState::User);
                let reentered = {
                    let mut regs = ec.regs();
                    k.machine().resume_user(cpu, mode, &mut regs)
                };
                cl.set_state(CpuState::Kernel);
                if !reentered {
                    return Exit::ToUser { ec, mode };
                }
            },

            Cont::RecvUser => ec::ipc::recv_user(k, cpu),
            Cont::RecvKern => ec::ipc::recv_kern(k, cpu),
            Cont::SysCall => ec::ipc::sys_call(k, cpu),
            Cont::SendMsg(mode) => ec::ipc::send_msg(k, cpu, mode),
            Cont::SysFinish(status, clr) => ec::ipc::sys_finish(k, cpu, status, clr),

            Cont::Dead => sched::schedule(k, cpu, true),

            // a current EC always has a continuation; None is only valid
            // while the EC executes in user space
            Cont::None => unreachable!("dispatch on EC without continuation"),
        }
    }
}
