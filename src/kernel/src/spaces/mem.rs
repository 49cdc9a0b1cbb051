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

use core::sync::atomic::{AtomicU64, Ordering};

use base::hif::MemAttr;

use crate::cpu::CpuId;
use crate::mdb::{MdbNode, SpaceKind, SpaceTree};
use crate::spaces::TlbCleanup;
use crate::Kernel;

/// A memory subspace: host page table (HPT) or guest page table (EPT)
/// together with the mapping database that describes it
pub struct SpaceMem {
    kind: SpaceKind,
    pub(crate) tree: spin::Mutex<SpaceTree>,
    /// CPUs this PD has ever been loaded on; the shootdown targets
    cpus: AtomicU64,
    /// per-CPU bits of possibly stale translations
    stale_tlb: AtomicU64,
}

impl SpaceMem {
    pub fn new(kind: SpaceKind) -> Self {
        SpaceMem {
            kind,
            tree: spin::Mutex::new(SpaceTree::default()),
            cpus: AtomicU64::new(0),
            stale_tlb: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    /// Records that this PD runs on `cpu`, so later updates know which
    /// TLBs to shoot down
    pub fn init_cpu(&self, cpu: CpuId) {
        self.cpus.fetch_or(1 << cpu, Ordering::AcqRel);
    }

    pub fn cpu_mask(&self) -> u64 {
        self.cpus.load(Ordering::Acquire)
    }

    /// Returns and clears the stale bit of `cpu`
    pub fn take_stale(&self, cpu: CpuId) -> bool {
        self.stale_tlb.fetch_and(!(1 << cpu), Ordering::AcqRel) & (1 << cpu) != 0
    }

    pub fn stale(&self, cpu: CpuId) -> bool {
        self.stale_tlb.load(Ordering::Acquire) & (1 << cpu) != 0
    }

    pub(crate) fn mark_stale(&self, mask: u64) {
        self.stale_tlb.fetch_or(mask, Ordering::AcqRel);
    }

    /// Translates the page frame `v` to its backing frame and rights
    pub fn lookup(&self, v: usize) -> Option<(usize, MemAttr, u32)> {
        let tree = self.tree.lock();
        let id = tree.lookup(v)?;
        let node = tree.node(id);
        Some((
            node.phys + (v - node.base),
            MemAttr::from_bits_truncate(node.attr),
            node.order,
        ))
    }

    /// Installs a root mapping of `2^order` frames `v -> p` and programs the
    /// page table accordingly. Used to seed the kernel PD and to map kernel
    /// pages (UTCB, KP) into user PDs.
    pub fn insert(
        &self,
        k: &Kernel,
        asid: usize,
        v: usize,
        p: usize,
        order: u32,
        attr: MemAttr,
    ) -> TlbCleanup {
        {
            let mut tree = self.tree.lock();
            tree.insert(MdbNode::new(v, order, attr.bits(), p, None)).ok();
        }
        k.machine().pt_update(asid, self.kind, v, p, order, attr.bits(), true);

        let mut cleanup = TlbCleanup::none();
        let mask = self.cpu_mask();
        self.mark_stale(mask);
        cleanup.add_cpus(mask);
        cleanup
    }

    /// Removes the mapping rooted at frame `v` from page table and MDB
    pub fn remove(&self, k: &Kernel, asid: usize, v: usize) -> TlbCleanup {
        let removed = {
            let mut tree = self.tree.lock();
            match tree.lookup(v) {
                Some(id) => {
                    let node = tree.remove(id);
                    Some((node.base, node.phys, node.order, node.attr))
                },
                None => None,
            }
        };

        let mut cleanup = TlbCleanup::none();
        if let Some((base, phys, order, attr)) = removed {
            k.machine().pt_update(asid, self.kind, base, phys, order, attr, false);
            let mask = self.cpu_mask();
            self.mark_stale(mask);
            cleanup.add_cpus(mask);
        }
        cleanup
    }
}

#[cfg(test)]
mod mem_test;
