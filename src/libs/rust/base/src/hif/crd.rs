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

use bitflags::bitflags;

use core::fmt;

/// The subspace a [`Crd`] refers to
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CrdKind {
    Null = 0,
    Mem = 1,
    Io = 2,
    Obj = 3,
}

impl From<usize> for CrdKind {
    fn from(val: usize) -> Self {
        match val & 0x3 {
            1 => CrdKind::Mem,
            2 => CrdKind::Io,
            3 => CrdKind::Obj,
            _ => CrdKind::Null,
        }
    }
}

bitflags! {
    /// Attributes of a memory mapping
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct MemAttr : usize {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
    }
}

impl Default for MemAttr {
    fn default() -> Self {
        MemAttr::empty()
    }
}

/// A capability range descriptor
///
/// A Crd names the naturally aligned region `[base << order, (base + 1) <<
/// order)` of a subspace, together with up to five attribute bits (memory
/// rights or object permissions). Everything is packed into one register:
///
/// ```text
/// | 63........12 | 11.....7 | 6.....2 | 1..0 |
/// |     base     |  order   |  attr   | kind |
/// ```
#[derive(Copy, Clone, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Crd(usize);

impl Crd {
    pub const ATTR_ALL: usize = 0x1F;

    pub const fn null() -> Self {
        Crd(0)
    }

    pub const fn from_raw(raw: usize) -> Self {
        Crd(raw)
    }

    const fn build(kind: usize, base: usize, order: u32, attr: usize) -> Self {
        Crd(kind | ((attr & 0x1F) << 2) | (((order as usize) & 0x1F) << 7) | (base << 12))
    }

    /// A Crd for the memory range of `2^order` pages at page number `base`
    pub const fn mem(base: usize, order: u32, attr: MemAttr) -> Self {
        Self::build(CrdKind::Mem as usize, base, order, attr.bits())
    }

    /// A Crd for `2^order` I/O ports starting at `base`
    pub const fn io(base: usize, order: u32) -> Self {
        Self::build(CrdKind::Io as usize, base, order, Self::ATTR_ALL)
    }

    /// A Crd for `2^order` object selectors starting at `base`
    pub const fn obj(base: usize, order: u32, perms: usize) -> Self {
        Self::build(CrdKind::Obj as usize, base, order, perms)
    }

    /// A whole-subspace Crd of the given kind
    pub const fn whole(kind: CrdKind) -> Self {
        Self::build(kind as usize, 0, 0x1F, Self::ATTR_ALL)
    }

    pub fn kind(self) -> CrdKind {
        CrdKind::from(self.0)
    }

    pub const fn attr(self) -> usize {
        (self.0 >> 2) & 0x1F
    }

    pub const fn order(self) -> u32 {
        ((self.0 >> 7) & 0x1F) as u32
    }

    pub const fn base(self) -> usize {
        self.0 >> 12
    }

    pub const fn raw(self) -> usize {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.kind() == CrdKind::Null
    }

    /// The memory rights of this Crd
    pub fn mem_attr(self) -> MemAttr {
        MemAttr::from_bits_truncate(self.attr())
    }
}

impl fmt::Debug for Crd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Crd[{:?} base={:#x} order={} attr={:#x}]",
            self.kind(),
            self.base(),
            self.order(),
            self.attr()
        )
    }
}
