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

//! PCI device registry
//!
//! Bus enumeration is the boot collaborator's business; it registers each
//! device's config-space page here so the kernel can resolve a device
//! capability (a memory mapping of that page) back to a requester id.

use base::col::BTreeMap;

/// Maps config-space page frames to requester ids
#[derive(Default)]
pub struct Registry {
    devs: spin::Mutex<BTreeMap<usize, u16>>,
}

impl Registry {
    /// Registers a device: its config-space page frame and requester id
    pub fn register(&self, frame: usize, rid: u16) {
        self.devs.lock().insert(frame, rid);
    }

    /// Resolves a physical page frame to the requester id of the device
    /// whose config space lives there
    pub fn phys_to_rid(&self, frame: usize) -> Option<u16> {
        self.devs.lock().get(&frame).copied()
    }
}
