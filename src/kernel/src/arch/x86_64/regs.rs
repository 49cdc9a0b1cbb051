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

use core::fmt;

use base::errors::Code;
use base::hif::{CapSel, Mtd};
use base::mem::VirtAddr;

/// The register frame of an execution context.
///
/// The entry stubs push this layout on kernel entry; the same frame doubles
/// as the system-call argument/result area (see `base::hif::syscalls` for
/// the register encoding).
#[derive(Clone, Default)]
#[repr(C, align(16))]
pub struct ExcRegs {
    pub rax: usize,
    pub rbx: usize,
    pub rcx: usize,
    pub rdx: usize,
    pub rsi: usize,
    pub rdi: usize,
    pub rbp: usize,
    pub r8: usize,
    pub r9: usize,
    pub r10: usize,
    pub r11: usize,
    pub r12: usize,
    pub r13: usize,
    pub r14: usize,
    pub r15: usize,

    /// exception vector; on portal delivery the event index
    pub vec: usize,
    pub err: usize,
    pub cr2: usize,

    // the iret frame, pushed by the CPU
    pub rip: usize,
    pub cs: usize,
    pub rflags: usize,
    pub rsp: usize,
    pub ss: usize,

    /// the portal index the next `send_msg` delivers to
    pub dst_portal: usize,
    /// the message transfer descriptor of the portal being traversed
    pub mtd: Mtd,
}

impl ExcRegs {
    // hypercall argument accessors (see base::hif::syscalls)

    pub fn sys_id(&self) -> u8 {
        self.rdi as u8
    }

    pub fn sys_flags(&self) -> usize {
        (self.rdi >> 8) & 0xF
    }

    pub fn sys_sel(&self) -> CapSel {
        self.rdi >> 12
    }

    pub fn arg1(&self) -> usize {
        self.rsi
    }

    pub fn arg2(&self) -> usize {
        self.rdx
    }

    pub fn arg3(&self) -> usize {
        self.rax
    }

    pub fn arg4(&self) -> usize {
        self.r8
    }

    pub fn set_status(&mut self, status: Code) {
        self.rdi = status as usize;
    }

    /// Writes a result value into the given argument register
    pub fn set_res1(&mut self, val: usize) {
        self.rsi = val;
    }

    pub fn set_res2(&mut self, val: usize) {
        self.rdx = val;
    }

    // portal delivery

    /// Loads the portal id into the handler's frame
    pub fn set_pt(&mut self, id: usize) {
        self.rdi = id;
    }

    pub fn set_ip(&mut self, ip: VirtAddr) {
        self.rip = ip.raw();
    }

    pub fn set_sp(&mut self, sp: usize) {
        self.rsp = sp;
    }

    /// Returns true if the frame was pushed while running in user mode
    pub fn user(&self) -> bool {
        self.cs & 3 == 3
    }
}

impl fmt::Debug for ExcRegs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  vec: {:#x} err: {:#x} cr2: {:#x}", self.vec, self.err, self.cr2)?;
        writeln!(f, "  rip: {:#x} cs: {:#x} rflags: {:#x}", self.rip, self.cs, self.rflags)?;
        writeln!(f, "  rsp: {:#x} ss: {:#x}", self.rsp, self.ss)?;
        writeln!(
            f,
            "  rax: {:#x} rbx: {:#x} rcx: {:#x} rdx: {:#x}",
            self.rax, self.rbx, self.rcx, self.rdx
        )?;
        writeln!(f, "  rsi: {:#x} rdi: {:#x} rbp: {:#x}", self.rsi, self.rdi, self.rbp)
    }
}
