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

use crate::cell::StaticCell;

/// A [`StaticCell`] that is initialized at some point after construction
pub struct LazyStaticCell<T: Copy> {
    inner: StaticCell<Option<T>>,
}

impl<T: Copy> LazyStaticCell<T> {
    pub const fn default() -> Self {
        Self {
            inner: StaticCell::new(None),
        }
    }

    /// Returns true if the value has been set
    pub fn is_some(&self) -> bool {
        self.inner.get().is_some()
    }

    /// Returns the inner value; panics if it was not set
    pub fn get(&self) -> T {
        self.inner.get().unwrap()
    }

    /// Sets the inner value to `val` and returns the old value
    pub fn set(&self, val: T) -> Option<T> {
        self.inner.set(Some(val))
    }
}

/// A [`StaticRefCell`](super::StaticRefCell) that is initialized at some point
/// after construction
pub struct LazyStaticRefCell<T> {
    inner: RefCell<Option<T>>,
}

unsafe impl<T> Sync for LazyStaticRefCell<T> {
}

impl<T> LazyStaticRefCell<T> {
    pub const fn default() -> Self {
        Self {
            inner: RefCell::new(None),
        }
    }

    /// Returns true if the value has been set
    pub fn is_some(&self) -> bool {
        self.inner.borrow().is_some()
    }

    /// Returns a reference to the inner value; panics if it was not set
    pub fn borrow(&self) -> Ref<'_, T> {
        Ref::map(self.inner.borrow(), |v| v.as_ref().unwrap())
    }

    /// Returns a mutable reference to the inner value; panics if it was not set
    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        RefMut::map(self.inner.borrow_mut(), |v| v.as_mut().unwrap())
    }

    /// Sets the inner value to `val` and returns the old value
    pub fn set(&self, val: T) -> Option<T> {
        self.inner.replace(Some(val))
    }

    /// Removes the inner value and returns the old value
    pub fn unset(&self) -> Option<T> {
        self.inner.replace(None)
    }
}
