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

//! The hypercall ids and their register encodings
//!
//! A hypercall passes its arguments in registers. The first argument word
//! combines the hypercall id, per-call flags, and the primary selector:
//!
//! ```text
//! arg0 (rdi): | 63.....12 | 11..8 | 7..0 |
//!             | selector  | flags |  id  |
//! ```
//!
//! Arguments two to five live in rsi, rdx, rax and r8. The status code is
//! returned in rdi.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The hypercall ids
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Hypercall {
    Call = 0,
    Reply = 1,
    CreatePd = 2,
    CreateEc = 3,
    CreateSc = 4,
    CreatePt = 5,
    CreateSm = 6,
    CreateKp = 7,
    CreateVcpu = 8,
    Revoke = 9,
    PdCtrl = 10,
    EcCtrl = 11,
    ScCtrl = 12,
    PtCtrl = 13,
    SmCtrl = 14,
    KpCtrl = 15,
    VcpuCtrl = 16,
    MachineCtrl = 17,
    AssignPci = 18,
    IrqCtrl = 19,
}

/// Per-call flag bits (arg0 bits 8..12)

/// `Call`: give up instead of blocking when the portal's EC is busy
pub const CALL_DISABLE_BLOCKING: usize = 1 << 0;

/// `CreateEc`: the EC gets its own SC bound later (global EC)
pub const EC_GLOBAL: usize = 1 << 0;
/// `CreateEc`: map the user page into the creator instead of the target PD
pub const EC_USER_PAGE_IN_OWNER: usize = 1 << 1;

/// `CreatePd`: the new PD inherits passthrough permission
pub const PD_PASSTHROUGH: usize = 1 << 0;

/// `Revoke`: also revoke the node named by the Crd itself, not only the
/// mappings delegated from it
pub const REVOKE_SELF: usize = 1 << 0;
/// `Revoke`: revoke in the PD named by arg1 instead of the caller's
pub const REVOKE_REMOTE: usize = 1 << 1;

/// `SmCtrl` down: zero-copy (leave the count untouched on wakeup)
pub const SM_ZERO_COPY: usize = 1 << 1;

/// The sub-operations of `PdCtrl`
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PdCtrl {
    /// Look up the mapping-database node covering a Crd
    Lookup = 0,
    /// Transfer one item between two PDs the caller holds capabilities for
    Delegate = 1,
    /// Read or write a white-listed MSR (passthrough PDs only)
    MsrAccess = 2,
}

/// The sub-operations of `EcCtrl`
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum EcCtrl {
    /// Force the EC through its recall portal at the next user entry
    Recall = 0,
}

/// The sub-operations of `SmCtrl`
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum SmCtrl {
    Up = 0,
    Down = 1,
}

/// The sub-operations of `KpCtrl`
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum KpCtrl {
    Map = 0,
    Unmap = 1,
}

/// The sub-operations of `VcpuCtrl`
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum VcpuCtrl {
    Run = 0,
    Poke = 1,
}

/// The sub-operations of `MachineCtrl`
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MachineCtrl {
    Suspend = 0,
    UpdateMicrocode = 1,
}

/// The sub-operations of `IrqCtrl`
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum IrqCtrl {
    ConfigureVector = 0,
    AssignIoapicPin = 1,
    MaskIoapicPin = 2,
    AssignMsi = 3,
    AssignLvt = 4,
    MaskLvt = 5,
}
