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

//! Quiescent-state reclamation
//!
//! Revoked capabilities may still be referenced by a CPU that looked them
//! up before the revocation. Their final drop is deferred until every CPU
//! has passed a return-to-user boundary (a quiescent state) after the
//! batch started.

use alloc::vec::Vec;

use base::io::LogFlags;
use base::log;

use crate::cap::KObject;
use crate::cpu::{hazards, CpuId};
use crate::Kernel;

struct RcuGlobal {
    /// completed grace periods
    batch: u64,
    /// CPUs that still need to report quiescence for the active batch
    pending: u64,
    active: bool,
}

#[derive(Default)]
struct RcuCpu {
    /// deferred after the active batch started; waits for the next one
    next: Vec<KObject>,
    /// covered by the active batch
    curr: Vec<KObject>,
}

/// The reclamation state: a global batch counter plus per-CPU callback
/// lists
pub struct Rcu {
    global: spin::Mutex<RcuGlobal>,
    cpus: Vec<spin::Mutex<RcuCpu>>,
}

impl Rcu {
    pub fn new(ncpus: usize) -> Self {
        let mut cpus = Vec::with_capacity(ncpus);
        for _ in 0..ncpus {
            cpus.push(spin::Mutex::new(RcuCpu::default()));
        }
        Rcu {
            global: spin::Mutex::new(RcuGlobal {
                batch: 0,
                pending: 0,
                active: false,
            }),
            cpus,
        }
    }

    /// Defers the (potential) final drop of `obj` past the next grace
    /// period
    pub fn defer(&self, cpu: CpuId, obj: KObject) {
        self.cpus[cpu as usize].lock().next.push(obj);
    }

    /// Announces a quiescent state of `cpu` for the active batch
    pub fn quiet(&self, k: &Kernel, cpu: CpuId) {
        let mut global = self.global.lock();
        if !global.active {
            return;
        }

        global.pending &= !(1 << cpu);
        if global.pending == 0 {
            self.finish_batch(k, &mut global);
        }
    }

    /// Drives batches forward; called from the idle loop and after
    /// deferrals
    pub fn update(&self, k: &Kernel, cpu: CpuId) {
        let mut global = self.global.lock();

        if global.active {
            // idling is quiescent by definition
            global.pending &= !(1 << cpu);
            if global.pending == 0 {
                self.finish_batch(k, &mut global);
            }
            return;
        }

        let work = self.cpus.iter().any(|c| !c.lock().next.is_empty());
        if work {
            self.start_batch(k, &mut global);
        }
    }

    fn start_batch(&self, k: &Kernel, global: &mut RcuGlobal) {
        global.active = true;
        global.pending = match k.cpus().len() {
            64.. => u64::MAX,
            n => (1u64 << n) - 1,
        };

        for c in &self.cpus {
            let mut c = c.lock();
            let next = core::mem::take(&mut c.next);
            c.curr.extend(next);
        }

        for cl in k.cpus() {
            cl.set_hazard(hazards::RCU);
        }

        log!(LogFlags::KernRcu, "grace period {} started", global.batch + 1);
    }

    fn finish_batch(&self, k: &Kernel, global: &mut RcuGlobal) {
        global.active = false;
        global.batch += 1;

        let mut dropped = 0;
        for c in &self.cpus {
            let mut c = c.lock();
            dropped += c.curr.len();
            c.curr.clear();
        }

        if dropped > 0 {
            log!(
                LogFlags::KernRcu,
                "grace period {} reclaimed {} objects",
                global.batch,
                dropped
            );
        }

        // back-to-back deferrals keep the machinery running
        let more = self.cpus.iter().any(|c| !c.lock().next.is_empty());
        if more {
            self.start_batch(k, global);
        }
    }
}
