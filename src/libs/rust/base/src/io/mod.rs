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

//! Contains the modules for serial output and logging

pub mod log;
mod logflags;
mod serial;

pub use self::logflags::LogFlags;
pub use self::serial::Serial;

use core::fmt;
use core::fmt::Write;

use self::log::Log;

/// Macro for logging (includes a trailing newline)
///
/// The arguments are printed if `$flag` is enabled (see
/// [`LogFlags`](crate::io::LogFlags)).
///
/// # Examples
///
/// ```ignore
/// log!(LogFlags::KernSysc, "my log entry: {}, {}", 1, "test");
/// ```
#[macro_export]
macro_rules! log {
    ($flag:expr, $fmt:expr)                   => (
        $crate::log!(@log_impl $flag, concat!($fmt, "\n"))
    );

    ($flag:expr, $fmt:expr, $($arg:tt)*)      => (
        $crate::log!(@log_impl $flag, concat!($fmt, "\n"), $($arg)*)
    );

    (@log_impl $flag:expr, $($args:tt)*)      => ({
        if $crate::util::unlikely($crate::io::should_log($flag)) {
            $crate::io::log_str(format_args!($($args)*));
        }
    });
}

/// Returns whether a log statement with given flag should be executed
///
/// In bench mode only `Info` and `Error` survive; otherwise this depends on
/// the flags chosen on the kernel command line.
#[inline(always)]
pub fn should_log(flag: LogFlags) -> bool {
    #[cfg(feature = "bench")]
    let res = flag == LogFlags::Info || flag == LogFlags::Error;
    #[cfg(not(feature = "bench"))]
    let res = log::flags().contains(flag);
    res
}

/// Helper for the log macro to keep the amount of additional code for logging
/// at a minimum
#[cold]
#[inline(never)]
pub fn log_str(fmt: fmt::Arguments<'_>) {
    if let Some(mut l) = Log::get() {
        l.write_fmt(fmt).unwrap();
    }
}

/// Initializes the I/O module for the given CPU
pub fn init(cpu: usize, name: &str) {
    log::init(cpu, name);
}
