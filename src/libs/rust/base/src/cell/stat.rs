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

use core::cell::Cell;
use core::fmt;

/// A cell for statics that are only mutated in single-threaded phases
/// (boot, or per-CPU data owned by exactly one CPU)
pub struct StaticCell<T: Sized> {
    inner: Cell<T>,
}

unsafe impl<T: Sized> Sync for StaticCell<T> {
}

impl<T: Sized> StaticCell<T> {
    /// Creates a new static cell with given value
    pub const fn new(val: T) -> Self {
        StaticCell {
            inner: Cell::new(val),
        }
    }

    /// Sets the inner value to `val` and returns the old value
    pub fn set(&self, val: T) -> T {
        self.inner.replace(val)
    }
}

impl<T: Copy> StaticCell<T> {
    /// Returns the inner value
    pub fn get(&self) -> T {
        self.inner.get()
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for StaticCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.get())
    }
}
