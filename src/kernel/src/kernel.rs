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

//! The Caldera microhypervisor kernel
//!
//! The kernel has no threads of its own: each CPU advances a continuation
//! driven state machine on behalf of whichever execution context is current
//! (see [`cpu::run`]). The boot collaborator owns the entry stubs, the
//! allocator and the panic handler; it hands control to the functions in
//! [`entry`] whenever the CPU re-enters the kernel.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod syscalls;

pub mod arch;
pub mod args;
pub mod cap;
pub mod cpu;
pub mod ec;
pub mod entry;
pub mod hw;
pub mod irq;
pub mod mdb;
pub mod nmi;
pub mod pd;
pub mod platform;
pub mod sched;
pub mod spaces;
pub mod timeout;

#[cfg(test)]
pub(crate) mod test_utils;

use alloc::vec::Vec;

use core::sync::atomic::{AtomicUsize, Ordering};

use base::cfg;
use base::io::{self, LogFlags};
use base::log;
use base::rc::Arc;

use crate::cpu::{CpuId, CpuLocal};
use crate::irq::VectorInfo;
use crate::hw::Machine;
use crate::pd::Pd;
use crate::platform::Platform;
use crate::sched::rcu::Rcu;

/// Number of user interrupt vectors per CPU
pub const NUM_USER_VECTORS: usize = 192;

/// The process-wide kernel context.
///
/// Everything that would traditionally live in mutable statics is owned
/// here and handed to the code that needs it, so that only true hardware
/// singletons remain global.
pub struct Kernel {
    machine: Arc<dyn Machine>,
    platform: Platform,
    cpus: Vec<CpuLocal>,
    /// serializes all delegation-graph surgery; ordered before space locks
    pub(crate) mdb_lock: spin::Mutex<()>,
    pub(crate) rcu: Rcu,
    kern_pd: Arc<Pd>,
    /// per-CPU, per-vector interrupt routing set up through `irq_ctrl`
    pub(crate) vectors: Vec<spin::Mutex<VectorInfo>>,
    pub(crate) pci: hw::pci::Registry,
    pub(crate) dmars: hw::dmar::Registry,
    pub(crate) ioapics: hw::ioapic::Registry,
}

static NEXT_ASID: AtomicUsize = AtomicUsize::new(1);

pub(crate) fn alloc_asid() -> usize {
    NEXT_ASID.fetch_add(1, Ordering::Relaxed)
}

impl Kernel {
    /// Creates the kernel context for the given machine and topology and
    /// brings up the per-CPU state, including the idle ECs.
    pub fn new(machine: Arc<dyn Machine>, platform: Platform, cmdline: &str) -> Self {
        let cmd = args::parse(cmdline);
        if let Some(flags) = cmd.log {
            io::log::set_flags(flags);
        }

        let platform = cmd.apply(platform);

        let ncpus = platform.num_cpus();
        let mut cpus = Vec::with_capacity(ncpus);
        for id in 0..ncpus {
            cpus.push(CpuLocal::new(id as CpuId));
        }

        let mut vectors = Vec::with_capacity(ncpus * NUM_USER_VECTORS);
        for _ in 0..ncpus * NUM_USER_VECTORS {
            vectors.push(spin::Mutex::new(VectorInfo::default()));
        }

        let kern_pd = Arc::new(Pd::new_kernel());

        let k = Kernel {
            machine,
            platform,
            cpus,
            mdb_lock: spin::Mutex::new(()),
            rcu: Rcu::new(ncpus),
            kern_pd,
            vectors,
            pci: hw::pci::Registry::default(),
            dmars: hw::dmar::Registry::default(),
            ioapics: hw::ioapic::Registry::default(),
        };

        for id in 0..ncpus {
            k.cpu(id as CpuId).init_idle(&k);
        }

        log!(
            LogFlags::Info,
            "Caldera is ready: {} CPUs, features {:?}",
            ncpus,
            k.platform.features()
        );

        k
    }

    pub fn machine(&self) -> &dyn Machine {
        &*self.machine
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn cpu(&self, id: CpuId) -> &CpuLocal {
        &self.cpus[id as usize]
    }

    pub fn cpus(&self) -> &[CpuLocal] {
        &self.cpus
    }

    /// The PD that owns all boot-time resources; delegation of physical
    /// memory to the root task originates here.
    pub fn kern_pd(&self) -> &Arc<Pd> {
        &self.kern_pd
    }

    pub(crate) fn vector_info(
        &self,
        cpu: CpuId,
        vector: usize,
    ) -> &spin::Mutex<VectorInfo> {
        &self.vectors[cpu as usize * NUM_USER_VECTORS + vector]
    }
}

base::const_assert!(cfg::MAX_CPUS <= 64);
