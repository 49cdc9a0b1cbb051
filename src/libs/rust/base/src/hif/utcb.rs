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

use crate::cfg;
use crate::hif::{Crd, Mtd};

/// The kind of a typed item
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum XferKind {
    /// The receiver sees the sender's existing mapping under its own selector
    Translate = 0,
    /// The receiver gets a new child mapping delegated from the sender
    Delegate = 1,
    /// An uninterpreted payload word
    Scalar = 2,
}

/// A typed item: a Crd plus a hotspot word
///
/// The hotspot selects where in the receiver's window the item lands; its
/// low bits carry the item kind:
///
/// ```text
/// hotspot: | 63......12 | 11..2 | 1..0 |
///          |    base    |   0   | kind |
/// ```
#[derive(Copy, Clone, Default)]
#[repr(C)]
pub struct Xfer {
    pub crd: Crd,
    pub hotspot: usize,
}

impl Xfer {
    pub fn new(crd: Crd, kind: XferKind, hotspot_base: usize) -> Self {
        Xfer {
            crd,
            hotspot: kind as usize | (hotspot_base << 12),
        }
    }

    pub fn kind(&self) -> Option<XferKind> {
        match self.hotspot & 0x3 {
            0 => Some(XferKind::Translate),
            1 => Some(XferKind::Delegate),
            2 => Some(XferKind::Scalar),
            _ => None,
        }
    }

    pub fn hotspot_base(&self) -> usize {
        self.hotspot >> 12
    }
}

/// The head of the UTCB
#[derive(Copy, Clone, Default)]
#[repr(C)]
pub struct UtcbHead {
    /// The receive window for translated items
    pub xlt: Crd,
    /// The receive window for delegated items
    pub del: Crd,
    /// Number of typed items in `items`
    pub tcnt: usize,
    /// The message transfer descriptor of the last traversal
    pub mtd: Mtd,
}

/// Number of untyped message words
pub const NUM_MSG_REGS: usize = 8;

/// The user thread control block: one page per EC, shared between the EC
/// and the kernel. Portal traversals copy architectural state and typed
/// items through it.
#[repr(C, align(4096))]
pub struct Utcb {
    pub head: UtcbHead,

    // architectural state, mirrored on exception portals
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub gpr: [u64; 16],
    /// error code and faulting address
    pub qual: [u64; 2],
    pub inst_len: u64,
    pub intr_state: u64,

    /// untyped message payload
    pub mr: [u64; NUM_MSG_REGS],
    /// typed items
    pub items: [Xfer; cfg::MAX_XFER_ITEMS],
}

crate::const_assert!(core::mem::size_of::<Utcb>() <= cfg::PAGE_SIZE);

impl Default for Utcb {
    fn default() -> Self {
        Utcb {
            head: UtcbHead::default(),
            rip: 0,
            rsp: 0,
            rflags: 0,
            gpr: [0; 16],
            qual: [0; 2],
            inst_len: 0,
            intr_state: 0,
            mr: [0; NUM_MSG_REGS],
            items: [Xfer::default(); cfg::MAX_XFER_ITEMS],
        }
    }
}

impl Utcb {
    /// Number of typed items, clamped to the item array
    pub fn tcnt(&self) -> usize {
        self.head.tcnt.min(cfg::MAX_XFER_ITEMS)
    }

    /// The typed items of the current message
    pub fn typed_items(&self) -> &[Xfer] {
        &self.items[..self.tcnt()]
    }

    /// Copies the message content (head, state, payload, items) to `dst`
    pub fn save(&self, dst: &mut Utcb) {
        dst.head = self.head;
        dst.rip = self.rip;
        dst.rsp = self.rsp;
        dst.rflags = self.rflags;
        dst.gpr = self.gpr;
        dst.qual = self.qual;
        dst.inst_len = self.inst_len;
        dst.intr_state = self.intr_state;
        dst.mr = self.mr;
        dst.items = self.items;
    }
}
