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

//! Global configuration constants

/// The number of bits of a 4 KiB page
pub const PAGE_BITS: u32 = 12;
/// The size of a page in bytes
pub const PAGE_SIZE: usize = 1 << PAGE_BITS;
/// The mask for the offset within a page
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Maximum number of CPUs the kernel is built for
pub const MAX_CPUS: usize = 64;

/// Number of scheduling priorities
pub const NUM_PRIORITIES: usize = 128;

/// Watermark for transitive help along the partner chain. Reaching it is
/// treated as a livelock and the helper finishes with a timeout.
pub const MAX_HELP: usize = 100;

/// Last user-addressable byte + 1. One page below the canonical boundary so
/// that a sysret target can never be non-canonical.
pub const USER_ADDR: usize = 0x0000_7fff_ffff_f000;

/// Maximum number of typed items per message transfer
pub const MAX_XFER_ITEMS: usize = 32;
