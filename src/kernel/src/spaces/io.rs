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

use crate::mdb::SpaceTree;
use crate::Kernel;

/// The I/O port subspace, describing the PD's I/O permission bitmap
pub struct SpaceIo {
    pub(crate) tree: spin::Mutex<SpaceTree>,
}

impl SpaceIo {
    pub fn new() -> Self {
        SpaceIo {
            tree: spin::Mutex::new(SpaceTree::default()),
        }
    }

    /// Returns true if the PD may access `port`
    pub fn lookup(&self, port: usize) -> bool {
        self.tree.lock().lookup(port).is_some()
    }

    pub(crate) fn update(&self, k: &Kernel, asid: usize, port: usize, order: u32, allow: bool) {
        k.machine().io_bitmap_update(asid, port, order, allow);
    }
}

impl Default for SpaceIo {
    fn default() -> Self {
        Self::new()
    }
}
