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

//! A software machine for running the kernel as an ordinary process
//!
//! Resuming user space and halting hand control back to the embedder, so
//! that development builds and the unit tests can drive the kernel in a
//! loop. Time is a simple tick counter that the embedder advances.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::arch::ExcRegs;
use crate::cpu::CpuId;
use crate::ec::RetMode;
use crate::hw::Machine;
use crate::mdb::SpaceKind;

/// Well-known marker addresses standing in for the return-path labels
pub const IRET_TO_USER_RIP: usize = 0xFFFF_FFFF_8000_1000;
pub const IDLE_HLT_RIP: usize = 0xFFFF_FFFF_8000_2000;

/// The hosted machine
#[derive(Default)]
pub struct HostedMachine {
    tsc: AtomicU64,
    pub rke_ipis: AtomicUsize,
    pub nmis: AtomicUsize,
    pub pt_updates: AtomicUsize,
    pub tlb_flushes: AtomicUsize,
    pub timer_deadline: AtomicU64,
    pub pokes: AtomicUsize,
    next_vmcs: AtomicUsize,
    vmx: bool,
}

impl HostedMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// A hosted machine that pretends to support VMX
    pub fn with_vmx() -> Self {
        HostedMachine {
            vmx: true,
            ..Self::default()
        }
    }

    /// Advances the fake timestamp counter
    pub fn tick(&self, ticks: u64) {
        self.tsc.fetch_add(ticks, Ordering::AcqRel);
    }
}

impl Machine for HostedMachine {
    fn resume_user(&self, _cpu: CpuId, _mode: RetMode, _regs: &mut ExcRegs) -> bool {
        // hand control back to the embedder; re-entry happens through the
        // entry functions
        false
    }

    fn halt(&self, _cpu: CpuId) -> bool {
        false
    }

    fn send_rke_ipi(&self, _cpu: CpuId) {
        self.rke_ipis.fetch_add(1, Ordering::AcqRel);
    }

    fn send_nmi(&self, _cpu: CpuId) -> bool {
        self.nmis.fetch_add(1, Ordering::AcqRel);
        false
    }

    fn now_tsc(&self) -> u64 {
        self.tsc.load(Ordering::Acquire)
    }

    fn set_timer(&self, _cpu: CpuId, deadline: u64) {
        self.timer_deadline.store(deadline, Ordering::Release);
    }

    fn pt_update(
        &self,
        _asid: usize,
        _kind: SpaceKind,
        _virt: usize,
        _phys: usize,
        _order: u32,
        _attr: usize,
        _map: bool,
    ) {
        self.pt_updates.fetch_add(1, Ordering::AcqRel);
    }

    fn flush_local_tlb(&self, _cpu: CpuId) {
        self.tlb_flushes.fetch_add(1, Ordering::AcqRel);
    }

    fn phys_of(&self, ptr: *mut u8) -> usize {
        // identity: the process address space is our "physical" memory
        ptr as usize
    }

    fn remap(&self, phys: usize) -> Option<usize> {
        Some(phys)
    }

    fn iret_to_user_rip(&self) -> usize {
        IRET_TO_USER_RIP
    }

    fn idle_hlt_rip(&self) -> usize {
        IDLE_HLT_RIP
    }

    fn read_msr(&self, _msr: u32) -> Option<u64> {
        Some(0)
    }

    fn write_msr(&self, _msr: u32, _val: u64) -> bool {
        true
    }

    fn vcpu_create(&self, _asid: usize) -> Option<usize> {
        if !self.vmx {
            return None;
        }
        Some(self.next_vmcs.fetch_add(1, Ordering::AcqRel) + 1)
    }

    fn vcpu_poke(&self, _cpu: CpuId) {
        self.pokes.fetch_add(1, Ordering::AcqRel);
    }
}

