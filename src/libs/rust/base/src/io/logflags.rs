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

use core::str;

bitflags! {
    /// All log flags used in Caldera
    ///
    /// Logging is controlled at boot time via the `log=` kernel argument.
    /// `Info` and `Error` are enabled by default; the per-subsystem flags
    /// are meant for debugging a specific part of the kernel.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct LogFlags : u32 {
        /// General: informational output (enabled by default)
        const Info      = 1 << 0;
        /// General: debugging output (disabled by default)
        const Debug     = 1 << 1;
        /// General: error output (enabled by default)
        const Error     = 1 << 2;

        /// Kernel: system calls
        const KernSysc  = 1 << 3;
        /// Kernel: capability operations
        const KernCaps  = 1 << 4;
        /// Kernel: mapping database operations
        const KernMdb   = 1 << 5;
        /// Kernel: scheduling decisions
        const KernSched = 1 << 6;
        /// Kernel: portal traversal and replies
        const KernIpc   = 1 << 7;
        /// Kernel: interrupt routing
        const KernIrq   = 1 << 8;
        /// Kernel: guest entries/exits
        const KernVmx   = 1 << 9;
        /// Kernel: grace periods and deferred frees
        const KernRcu   = 1 << 10;
        /// Kernel: TLB shootdowns
        const KernTlb   = 1 << 11;
    }
}

impl str::FromStr for LogFlags {
    type Err = bitflags::parser::ParseError;

    fn from_str(flags: &str) -> Result<Self, Self::Err> {
        Ok(Self(flags.parse()?))
    }
}
