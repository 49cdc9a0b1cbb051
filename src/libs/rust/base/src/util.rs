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

//! Small helpers

/// Hints that `b` is unlikely to be true
#[inline(always)]
pub fn unlikely(b: bool) -> bool {
    // cold-path marker; the optimizer treats calls to a #[cold] fn as unlikely
    #[cold]
    fn cold() {
    }

    if b {
        cold();
    }
    b
}

/// Hints that `b` is likely to be true
#[inline(always)]
pub fn likely(b: bool) -> bool {
    !unlikely(!b)
}
