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

//! The hypervisor interface
//!
//! Everything in this module is part of the contract with user space:
//! capability range descriptors, the hypercall ids and their register
//! encodings, the message transfer descriptor, and the UTCB layout.

mod crd;
pub mod syscalls;
mod utcb;

pub use self::crd::{Crd, CrdKind, MemAttr};
pub use self::utcb::{Utcb, UtcbHead, Xfer, XferKind};

use bitflags::bitflags;

/// A capability selector
pub type CapSel = usize;

/// Number of exception events per EC (the event base spans this range)
pub const NUM_EXC: usize = 32;
/// Number of VM-exit events per vCPU
pub const NUM_VMI: usize = 64;

/// Exception event vectors, looked up at `event base + vector`
pub const EXC_DB: usize = 1;
pub const EXC_NMI: usize = 2;
pub const EXC_GP: usize = 13;
pub const EXC_PF: usize = 14;
pub const EXC_MC: usize = 18;
pub const EXC_STARTUP: usize = 30;
pub const EXC_RECALL: usize = 31;

bitflags! {
    /// The message transfer descriptor: selects which architectural state a
    /// portal traversal copies between register frame and UTCB
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Mtd : u32 {
        /// rax, rbx, rcx, rdx, rsi, rdi, rbp
        const GPR     = 1 << 0;
        /// r8..r15
        const GPR_HI  = 1 << 1;
        /// rsp
        const RSP     = 1 << 2;
        /// rip
        const RIP     = 1 << 3;
        /// rflags
        const RFLAGS  = 1 << 4;
        /// exception qualification (error code, cr2)
        const QUAL    = 1 << 5;
        /// transfer FPU ownership along with the message
        const FPU     = 1 << 6;
        /// flush the guest TLB on vmresume
        const TLB     = 1 << 7;
        /// guest interruptibility / injection state
        const INJ     = 1 << 8;
    }
}

impl Default for Mtd {
    fn default() -> Self {
        Mtd::empty()
    }
}

/// A scheduling parameter: priority and time quantum
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct Qpd(usize);

impl Qpd {
    pub const fn new(prio: usize, quantum: usize) -> Self {
        Qpd(prio | (quantum << 12))
    }

    pub const fn from_raw(raw: usize) -> Self {
        Qpd(raw)
    }

    pub const fn raw(self) -> usize {
        self.0
    }

    /// The priority (0 is lowest)
    pub const fn prio(self) -> usize {
        self.0 & 0xFFF
    }

    /// The quantum in timer ticks
    pub const fn quantum(self) -> usize {
        self.0 >> 12
    }
}
