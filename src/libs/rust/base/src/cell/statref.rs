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

use core::cell::{Ref, RefCell, RefMut};

/// Like [`StaticCell`](super::StaticCell), but with runtime borrow checking
pub struct StaticRefCell<T: Sized> {
    inner: RefCell<T>,
}

unsafe impl<T: Sized> Sync for StaticRefCell<T> {
}

impl<T: Sized> StaticRefCell<T> {
    /// Creates a new static cell with given value
    pub const fn new(val: T) -> Self {
        StaticRefCell {
            inner: RefCell::new(val),
        }
    }

    /// Returns a reference to the inner value
    pub fn borrow(&self) -> Ref<'_, T> {
        self.inner.borrow()
    }

    /// Returns a mutable reference to the inner value
    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        self.inner.borrow_mut()
    }

    /// Replaces the inner value with `val` and returns the old value
    pub fn replace(&self, val: T) -> T {
        self.inner.replace(val)
    }
}
