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

//! Per-CPU absolute timeouts for blocking semaphore downs

use alloc::vec::Vec;

use base::rc::{Arc, Weak};

use crate::cpu::CpuId;
use crate::ec::Ec;
use crate::Kernel;

/// A deadline-ordered list of waiters; small enough that a sorted vector
/// beats anything fancier
#[derive(Default)]
pub struct TimeoutQueue {
    entries: Vec<(u64, Weak<Ec>)>,
}

impl TimeoutQueue {
    fn insert(&mut self, deadline: u64, ec: Weak<Ec>) {
        let pos = self
            .entries
            .iter()
            .position(|(d, _)| *d > deadline)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, (deadline, ec));
    }

    fn remove(&mut self, ec: &Arc<Ec>) {
        self.entries.retain(|(_, w)| match w.upgrade() {
            Some(e) => !Arc::ptr_eq(&e, ec),
            None => false,
        });
    }

    fn earliest(&self) -> Option<u64> {
        self.entries.first().map(|(d, _)| *d)
    }

    fn expire(&mut self, now: u64) -> Vec<Arc<Ec>> {
        let mut expired = Vec::new();
        while let Some((d, _)) = self.entries.first() {
            if *d > now {
                break;
            }
            let (_, w) = self.entries.remove(0);
            if let Some(ec) = w.upgrade() {
                expired.push(ec);
            }
        }
        expired
    }
}

/// Arms an absolute TSC deadline for the given EC on `cpu`
pub fn enqueue(k: &Kernel, cpu: CpuId, deadline: u64, ec: &Arc<Ec>) {
    let cl = k.cpu(cpu);
    let earliest = {
        let mut tq = cl.timeouts.lock();
        tq.insert(deadline, Arc::downgrade(ec));
        tq.earliest()
    };
    if earliest == Some(deadline) {
        k.machine().set_timer(cpu, deadline);
    }
}

/// Disarms any pending deadline of the given EC
pub fn cancel(k: &Kernel, cpu: CpuId, ec: &Arc<Ec>) {
    k.cpu(cpu).timeouts.lock().remove(ec);
}

/// Wakes every waiter whose deadline passed; they finish their blocked
/// down with a timeout status
pub fn expire(k: &Kernel, cpu: CpuId) {
    let now = k.machine().now_tsc();
    let expired = k.cpu(cpu).timeouts.lock().expire(now);
    for ec in expired {
        ec.timeout_expired(k);
    }
}
