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

//! Address types

use core::fmt;
use core::ops::{Add, Sub};

use crate::cfg;

pub use core::mem::{align_of, replace, size_of, take};

/// A virtual address in some address space
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct VirtAddr(usize);

/// A host-physical address
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct PhysAddr(usize);

macro_rules! addr_impl {
    ($name:ident) => {
        impl $name {
            pub const fn new(addr: usize) -> Self {
                Self(addr)
            }

            pub const fn raw(self) -> usize {
                self.0
            }

            /// Returns the page frame number of this address
            pub const fn frame(self) -> usize {
                self.0 >> cfg::PAGE_BITS
            }

            /// Returns the address of the page frame `pfn`
            pub const fn from_frame(pfn: usize) -> Self {
                Self(pfn << cfg::PAGE_BITS)
            }

            pub const fn is_page_aligned(self) -> bool {
                self.0 & cfg::PAGE_MASK == 0
            }

            pub const fn offset(self) -> usize {
                self.0 & cfg::PAGE_MASK
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            fn add(self, rhs: usize) -> Self {
                Self(self.0 + rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            fn sub(self, rhs: $name) -> usize {
                self.0 - rhs.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

addr_impl!(VirtAddr);
addr_impl!(PhysAddr);
