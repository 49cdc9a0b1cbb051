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

//! Scheduling contexts and the per-CPU scheduler

pub mod rcu;

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::vec::Vec;

use base::cfg;
use base::col::VecDeque;
use base::io::LogFlags;
use base::log;
use base::rc::Arc;

use crate::cpu::{CpuId, CpuState};
use crate::ec::{ipc, Ec};
use crate::Kernel;

/// A scheduling context: a (priority, quantum, bound EC) triple with a
/// residual budget and an account of consumed time
pub struct Sc {
    ec: Arc<Ec>,
    cpu: CpuId,
    prio: usize,
    quantum: u64,
    left: AtomicU64,
    time: AtomicU64,
    is_idle: bool,
}

impl Sc {
    pub const PERM_CTRL: usize = 1 << 0;

    pub fn new(ec: Arc<Ec>, cpu: CpuId, prio: usize, quantum: u64) -> Self {
        Sc {
            ec,
            cpu,
            prio,
            quantum,
            left: AtomicU64::new(quantum),
            time: AtomicU64::new(0),
            is_idle: false,
        }
    }

    pub(crate) fn new_idle(ec: Arc<Ec>, cpu: CpuId) -> Self {
        Sc {
            ec,
            cpu,
            prio: 0,
            quantum: u64::MAX,
            left: AtomicU64::new(u64::MAX),
            time: AtomicU64::new(0),
            is_idle: true,
        }
    }

    pub fn ec(&self) -> &Arc<Ec> {
        &self.ec
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn prio(&self) -> usize {
        self.prio
    }

    pub fn quantum(&self) -> u64 {
        self.quantum
    }

    pub fn left(&self) -> u64 {
        self.left.load(Ordering::Acquire)
    }

    /// Consumed CPU time in TSC ticks
    pub fn time(&self) -> u64 {
        self.time.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.is_idle
    }

    fn charge(&self, delta: u64) {
        self.time.fetch_add(delta, Ordering::AcqRel);
        let left = self.left.load(Ordering::Acquire);
        self.left.store(left.saturating_sub(delta), Ordering::Release);
    }

    fn refresh(&self) {
        self.left.store(self.quantum, Ordering::Release);
    }
}

/// The only references that always exist for a running SC are the per-CPU
/// current slot and the caller's local clone; anything beyond that is a
/// capability keeping the SC alive
pub(crate) fn last_ref(sc: &Arc<Sc>) -> bool {
    Arc::strong_count(sc) <= 2
}

/// The per-CPU ready set: one FIFO per priority plus an occupancy bitmap
pub struct ReadyQueue {
    queues: Vec<VecDeque<Arc<Sc>>>,
    bitmap: u128,
}

impl Default for ReadyQueue {
    fn default() -> Self {
        let mut queues = Vec::with_capacity(cfg::NUM_PRIORITIES);
        for _ in 0..cfg::NUM_PRIORITIES {
            queues.push(VecDeque::new());
        }
        ReadyQueue { queues, bitmap: 0 }
    }
}

base::const_assert!(cfg::NUM_PRIORITIES <= 128);

impl ReadyQueue {
    pub fn enqueue(&mut self, sc: Arc<Sc>) {
        let prio = sc.prio().min(cfg::NUM_PRIORITIES - 1);
        self.queues[prio].push_back(sc);
        self.bitmap |= 1 << prio;
    }

    pub fn highest(&self) -> Option<usize> {
        if self.bitmap == 0 {
            None
        }
        else {
            Some(127 - self.bitmap.leading_zeros() as usize)
        }
    }

    pub fn dequeue(&mut self) -> Option<Arc<Sc>> {
        let prio = self.highest()?;
        let sc = self.queues[prio].pop_front();
        if self.queues[prio].is_empty() {
            self.bitmap &= !(1 << prio);
        }
        sc
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap == 0
    }
}

/// Makes `sc` runnable on its CPU.
///
/// Cross-CPU insertions go through the lock-free inbox; the target is
/// interrupted only if it cannot notice the new work on its own (running
/// user code or halted).
pub fn remote_enqueue(k: &Kernel, sc: Arc<Sc>) {
    let target = sc.cpu();
    let cl = k.cpu(target);

    log!(LogFlags::KernSched, "enqueue SC prio={} on CPU {}", sc.prio(), target);

    cl.remote.push(sc);
    cl.set_hazard(crate::cpu::hazards::SCHED);

    match cl.state() {
        CpuState::User | CpuState::Idle => k.machine().send_rke_ipi(target),
        CpuState::Kernel => {
        },
    }
}

/// Picks the next SC to run on `cpu`.
///
/// Charges the elapsed time to the outgoing SC, re-enqueues it round-robin
/// (unless `suspend` parks it or its last capability is gone), reprograms
/// the preemption timer, and activates the incoming SC's EC.
pub fn schedule(k: &Kernel, cpu: CpuId, suspend: bool) {
    let cl = k.cpu(cpu);

    cl.clr_hazard(crate::cpu::hazards::SCHED);
    cl.help_ctr.store(0, Ordering::Release);

    // adopt SCs other CPUs pushed at us
    for sc in cl.remote.drain() {
        cl.rq.lock().enqueue(sc);
    }

    let now = k.machine().now_tsc();
    let prev = cl.current_sc();
    let started = cl.sc_started.swap(now, Ordering::AcqRel);
    prev.charge(now.saturating_sub(started));

    if !suspend && !prev.is_idle() {
        if last_ref(&prev) {
            // the capability is gone; this SC retires here
            log!(LogFlags::KernSched, "dropping orphaned SC on CPU {}", cpu);
        }
        else {
            if prev.left() == 0 {
                prev.refresh();
            }
            cl.rq.lock().enqueue(prev);
        }
    }

    let next = {
        let mut rq = cl.rq.lock();
        rq.dequeue().unwrap_or_else(|| cl.idle_sc().clone())
    };

    k.machine().set_timer(cpu, now.saturating_add(next.left()));

    log!(
        LogFlags::KernSched,
        "CPU {} schedules prio={} (idle={})",
        cpu,
        next.prio(),
        next.is_idle()
    );

    let ec = next.ec().clone();
    cl.set_current_sc(next);

    // the chosen EC may be mid-IPC; run whoever it donates to
    ipc::activate(k, cpu, ec);
}

/// The RKE IPI handler: adopt remotely enqueued SCs at the next dispatch
pub fn rke_handler(k: &Kernel, cpu: CpuId) {
    k.cpu(cpu).set_hazard(crate::cpu::hazards::SCHED);
}
