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

//! The machine interface
//!
//! Everything the kernel core needs from the CPU-facing world is collected
//! in the [`Machine`] trait: entry/return stubs, APIC access, page-table
//! walkers, descriptor-table tricks, FPU state, power management. The boot
//! crate supplies the bare-metal implementation; [`hosted::HostedMachine`]
//! is a software rendition in the spirit of running the kernel as an
//! ordinary process for development and tests.

pub mod dmar;
pub mod hosted;
pub mod ioapic;
pub mod pci;

use crate::arch::ExcRegs;
use crate::cpu::CpuId;
use crate::ec::RetMode;
use crate::mdb::SpaceKind;

/// The CPU-facing side of the kernel.
///
/// Methods with a default body are inert on a hosted machine; a bare-metal
/// implementation overrides all of them.
pub trait Machine: Send + Sync {
    /// Leaves the kernel towards user or guest mode.
    ///
    /// On bare metal this does not return: the next kernel entry comes
    /// through the entry stubs. A hosted machine returns false to hand
    /// control back to whoever drives the kernel.
    fn resume_user(&self, cpu: CpuId, mode: RetMode, regs: &mut ExcRegs) -> bool;

    /// `sti; hlt; cli` under the STI shadow; returns false if the hosted
    /// environment wants the dispatch loop to stop instead
    fn halt(&self, cpu: CpuId) -> bool;

    /// Sends the rescheduling IPI
    fn send_rke_ipi(&self, cpu: CpuId);

    /// Sends the shootdown NMI.
    ///
    /// Returns false if the machine cannot interrupt the target (a hosted
    /// machine has no second hardware thread); the initiator then performs
    /// the acknowledgment on the target's behalf.
    fn send_nmi(&self, cpu: CpuId) -> bool;

    /// The current timestamp counter
    fn now_tsc(&self) -> u64;

    /// Programs the one-shot preemption/timeout deadline of `cpu`
    fn set_timer(&self, cpu: CpuId, deadline: u64) {
        let _ = (cpu, deadline);
    }

    /// Maps or unmaps `2^order` frames `virt -> phys` in the page table of
    /// the given address space (host or guest)
    fn pt_update(
        &self,
        asid: usize,
        kind: SpaceKind,
        virt: usize,
        phys: usize,
        order: u32,
        attr: usize,
        map: bool,
    ) {
        let _ = (asid, kind, virt, phys, order, attr, map);
    }

    /// Opens or closes `2^order` ports in the I/O permission bitmap
    fn io_bitmap_update(&self, asid: usize, port: usize, order: u32, allow: bool) {
        let _ = (asid, port, order, allow);
    }

    /// Invalidates this CPU's TLB for the current address space
    fn flush_local_tlb(&self, cpu: CpuId) {
        let _ = cpu;
    }

    /// Translates a kernel pointer to its physical address
    fn phys_of(&self, ptr: *mut u8) -> usize;

    /// Makes a physical range temporarily accessible to the kernel
    fn remap(&self, phys: usize) -> Option<usize> {
        let _ = phys;
        None
    }

    /// Size of the remap window; callers must not remap more than this
    fn remap_guaranteed_size(&self) -> usize {
        128 * base::cfg::PAGE_SIZE
    }

    // descriptor-table handling for the NMI-deferred-work path

    /// Restores the full GDT so iret can reach user space again
    fn gdt_load_full(&self, cpu: CpuId) {
        let _ = cpu;
    }

    /// Shrinks the GDT limit below the user selectors, so the next
    /// iret-to-user faults into the kernel
    fn gdt_load_kernel_only(&self, cpu: CpuId) {
        let _ = cpu;
    }

    /// Reloads the data segment selectors on the sysexit path
    fn reload_segments(&self, cpu: CpuId) {
        let _ = cpu;
    }

    /// Clears the busy bit of the TSS descriptor
    fn unbusy_tss(&self, cpu: CpuId) {
        let _ = cpu;
    }

    fn tss_load(&self, cpu: CpuId) {
        let _ = cpu;
    }

    /// The address of the iret instruction of the return path; the
    /// NMI-provoked #GP is recognized by this value
    fn iret_to_user_rip(&self) -> usize {
        0
    }

    /// The address of the `hlt` in the idle loop
    fn idle_hlt_rip(&self) -> usize {
        0
    }

    /// (fault-rip, continue-rip) pairs of skippable instructions
    fn fixup_table(&self) -> &[(usize, usize)] {
        &[]
    }

    // FPU state

    fn fpu_save(&self, area: *mut u8) {
        let _ = area;
    }

    fn fpu_load(&self, area: *const u8) {
        let _ = area;
    }

    // MSRs and machine control

    /// Reads a white-listed MSR; None if refused
    fn read_msr(&self, msr: u32) -> Option<u64> {
        let _ = msr;
        None
    }

    /// Writes a white-listed MSR; false if refused or faulted
    fn write_msr(&self, msr: u32, val: u64) -> bool {
        let _ = (msr, val);
        false
    }

    /// Re-reads CPUID after a microcode update may have exposed features
    fn update_features(&self) {
    }

    fn acpi_waking_vector(&self) -> usize {
        0
    }

    /// Enters the given ACPI sleep state; returns false if that failed
    fn suspend(&self, slp_typa: u8, slp_typb: u8) -> bool {
        let _ = (slp_typa, slp_typb);
        false
    }

    /// Feeds a machine-check event to the aggregator
    fn mca_vector(&self) {
    }

    // local APIC thermal LVT

    fn set_therm_vector(&self, vector: usize) {
        let _ = vector;
    }

    fn set_therm_mask(&self, mask: bool) {
        let _ = mask;
    }

    // raw IOAPIC / DMAR programming (the tables live in the kernel, the
    // register writes here)

    fn ioapic_route(&self, ioapic: u32, pin: u32, rte_hi: u32, rte_lo: u32) {
        let _ = (ioapic, pin, rte_hi, rte_lo);
    }

    fn ioapic_set_mask(&self, ioapic: u32, pin: u32, masked: bool) {
        let _ = (ioapic, pin, masked);
    }

    fn dmar_set_irt(&self, unit: u32, index: u16, rid: u16, apic_id: u32, vector: usize, level: bool) {
        let _ = (unit, index, rid, apic_id, vector, level);
    }

    fn dmar_clear_irt(&self, unit: u32, index: u16) {
        let _ = (unit, index);
    }

    /// Points the DMAR context entry of `rid` at the address space `asid`
    fn dmar_assign(&self, unit: u32, rid: u16, asid: usize) -> bool {
        let _ = (unit, rid, asid);
        false
    }

    // VMX

    /// Allocates a VMCS for a new vCPU in the given guest address space
    fn vcpu_create(&self, asid: usize) -> Option<usize> {
        let _ = asid;
        None
    }

    /// Forces a running guest on `cpu` out of non-root mode
    fn vcpu_poke(&self, cpu: CpuId) {
        let _ = cpu;
    }
}
