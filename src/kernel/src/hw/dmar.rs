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

//! DMA remapping units
//!
//! DMAR discovery is ACPI business and stays outside the kernel; the boot
//! collaborator registers each unit and its claimed devices. Without any
//! registered unit the IOMMU feature stays off and interrupt remapping
//! falls back to compatibility format.

use alloc::vec::Vec;

use base::col::BTreeMap;
use base::io::LogFlags;
use base::log;

use crate::cpu::CpuId;
use crate::Kernel;

/// The registered remapping hardware
#[derive(Default)]
pub struct Registry {
    units: spin::Mutex<Vec<u32>>,
    claims: spin::Mutex<BTreeMap<u16, u32>>,
}

impl Registry {
    pub fn register_unit(&self, unit: u32) {
        self.units.lock().push(unit);
    }

    /// Records that `unit` translates requests of device `rid`
    pub fn claim_dev(&self, unit: u32, rid: u16) {
        self.claims.lock().insert(rid, unit);
    }

    /// The unit responsible for `rid`, if any was registered
    pub fn find(&self, rid: u16) -> Option<u32> {
        let claims = self.claims.lock();
        if let Some(unit) = claims.get(&rid) {
            return Some(*unit);
        }
        // fall back to the first unit, which covers unclaimed devices
        self.units.lock().first().copied()
    }

    pub fn has_units(&self) -> bool {
        !self.units.lock().is_empty()
    }
}

/// Whether interrupt remapping is in effect
pub fn ire(k: &Kernel) -> bool {
    k.platform().has_feature(crate::platform::Features::IOMMU) && k.dmars.has_units()
}

/// The interrupt-remapping-table index of (cpu, vector)
pub fn irt_index(cpu: CpuId, vector: usize) -> u16 {
    (cpu as usize * crate::NUM_USER_VECTORS + vector) as u16
}

/// Installs an IRT entry routing (rid) to (cpu, vector)
pub fn set_irt(k: &Kernel, index: u16, rid: u16, cpu: CpuId, vector: usize, level: bool) {
    let unit = match k.dmars.find(rid) {
        Some(unit) => unit,
        None => return,
    };
    let aid = k.platform().apic_id(cpu);
    k.machine().dmar_set_irt(unit, index, rid, aid, vector, level);
    log!(
        LogFlags::KernIrq,
        "IRT[{}] = rid {:#x} -> CPU {} vector {:#x}",
        index,
        rid,
        cpu,
        vector
    );
}

/// Clears an IRT entry on every unit
pub fn clear_irt(k: &Kernel, index: u16) {
    for unit in k.dmars.units.lock().iter() {
        k.machine().dmar_clear_irt(*unit, index);
    }
}
