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

//! The space layer: the four subspaces behind one interface
//!
//! Updates that may leave stale TLB entries hand back a [`TlbCleanup`]
//! token. The token must be consumed explicitly, either by flushing or by
//! stating that no flush is needed, so that bulk operations can coalesce
//! shootdowns.

mod io;
mod mem;
mod obj;

pub use self::io::SpaceIo;
pub use self::mem::SpaceMem;
pub use self::obj::SpaceObj;

use base::io::LogFlags;
use base::log;

use crate::cpu::CpuId;
use crate::nmi;
use crate::Kernel;

/// Tracks which CPUs may hold stale translations after a space update
#[must_use]
pub struct TlbCleanup {
    cpus: u64,
    consumed: bool,
}

impl TlbCleanup {
    pub fn none() -> Self {
        TlbCleanup {
            cpus: 0,
            consumed: false,
        }
    }

    pub(crate) fn add_cpus(&mut self, mask: u64) {
        self.cpus |= mask;
    }

    pub fn need_flush(&self) -> bool {
        self.cpus != 0
    }

    pub fn cpu_mask(&self) -> u64 {
        self.cpus
    }

    /// Invalidates the TLB on all affected CPUs and waits for their
    /// acknowledgments
    pub fn flush(mut self, k: &Kernel, cpu: CpuId) {
        self.consumed = true;
        if self.cpus != 0 {
            nmi::shootdown(k, cpu, self.cpus);
        }
    }

    /// States that no flush is needed (e.g. the PD has not run yet)
    pub fn ignore_tlb_flush(mut self) {
        self.consumed = true;
    }
}

impl Drop for TlbCleanup {
    fn drop(&mut self) {
        if !self.consumed && self.cpus != 0 {
            log!(LogFlags::Error, "TLB cleanup dropped without being consumed");
        }
    }
}
