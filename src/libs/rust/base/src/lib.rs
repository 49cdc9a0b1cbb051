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

//! The support library of the Caldera microhypervisor.
//!
//! `base` collects everything that is not kernel policy: cell types for
//! statics, collections, error codes, the logger, address arithmetic, and
//! the user-visible hypercall interface definitions (`hif`).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

// make core available under a fixed name for the macros below
#[doc(hidden)]
pub use core as _core;

pub mod boxed {
    pub use alloc::boxed::Box;
}

pub mod cell;
pub mod cfg;
pub mod col;
pub mod errors;
pub mod hif;
pub mod io;
pub mod math;
pub mod mem;
pub mod rc;
pub mod util;

pub use alloc::format;

/// Asserts at compile time
#[macro_export]
macro_rules! const_assert {
    ($cond:expr) => {
        const _: () = assert!($cond);
    };
}
