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

//! IOAPIC routing
//!
//! The redirection-table entries are composed here; the raw register
//! writes go through the machine interface.

use alloc::vec::Vec;

use crate::Kernel;

/// One discovered IOAPIC
#[derive(Copy, Clone, Debug)]
pub struct Ioapic {
    pub id: u32,
    pub rid: u16,
    pub pins: u32,
}

/// The registered IOAPICs
#[derive(Default)]
pub struct Registry {
    units: spin::Mutex<Vec<Ioapic>>,
}

// redirection-table entry bits
const RTE_LEVEL: u32 = 1 << 15;
const RTE_ACTIVE_LOW: u32 = 1 << 13;
const RTE_REMAPPABLE_HI: u32 = 1 << 16;

impl Registry {
    pub fn register(&self, ioapic: Ioapic) {
        self.units.lock().push(ioapic);
    }

    pub fn by_id(&self, id: u32) -> Option<Ioapic> {
        self.units.lock().iter().find(|i| i.id == id).copied()
    }

    /// Routes a pin in compatibility format: destination APIC id plus
    /// vector straight in the entry
    pub fn set_entry_compatibility(
        &self,
        k: &Kernel,
        id: u32,
        pin: u32,
        apic_id: u32,
        vector: usize,
        level: bool,
        active_low: bool,
    ) {
        let lo = vector as u32
            | if level { RTE_LEVEL } else { 0 }
            | if active_low { RTE_ACTIVE_LOW } else { 0 };
        let hi = apic_id << 24;
        k.machine().ioapic_route(id, pin, hi, lo);
    }

    /// Routes a pin through the interrupt-remapping table: the entry
    /// carries the IRT index instead of destination and vector
    pub fn set_entry_remappable(
        &self,
        k: &Kernel,
        id: u32,
        pin: u32,
        irt_index: u16,
        vector: usize,
        level: bool,
        active_low: bool,
    ) {
        let lo = vector as u32
            | if level { RTE_LEVEL } else { 0 }
            | if active_low { RTE_ACTIVE_LOW } else { 0 };
        let hi = ((irt_index as u32) << 17) | RTE_REMAPPABLE_HI;
        k.machine().ioapic_route(id, pin, hi, lo);
    }

    /// Masks or unmasks a pin. Unmasking a never-configured pin is benign:
    /// its entry is invalid and cannot fire.
    pub fn set_mask(&self, k: &Kernel, id: u32, pin: u32, masked: bool) {
        k.machine().ioapic_set_mask(id, pin, masked);
    }
}
