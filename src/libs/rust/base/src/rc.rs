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

//! Reference counting
//!
//! Kernel objects are shared between CPUs, so the atomically counted `Arc`
//! is the reference type throughout the kernel. Back-pointers (IPC partner
//! links, waiter lists that must not keep an object alive) use `Weak`.

pub use alloc::sync::{Arc, Weak};
