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

//! The boot-discovered platform description
//!
//! This is the kernel's view of what the boot collaborator found: CPU
//! topology, APIC ids, timer calibration, and the feature word. User space
//! sees the same data through the hypervisor information page.

use bitflags::bitflags;

use alloc::vec::Vec;

use crate::cpu::CpuId;

bitflags! {
    /// Platform feature bits
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Features : u32 {
        /// VMX is available and enabled; vCPUs can be created
        const VMX   = 1 << 0;
        /// DMAR units were registered; interrupt remapping is active
        const IOMMU = 1 << 1;
    }
}

/// Per-CPU boot information
#[derive(Copy, Clone, Debug)]
pub struct CpuInfo {
    pub apic_id: u32,
}

/// The platform description handed to [`Kernel::new`](crate::Kernel::new)
pub struct Platform {
    cpus: Vec<CpuInfo>,
    features: Features,
    /// TSC ticks per millisecond
    freq_tsc: u64,
    /// number of usable LVT entries of the local APICs
    lvt_max: u32,
}

impl Platform {
    pub fn new(cpus: Vec<CpuInfo>, features: Features, freq_tsc: u64, lvt_max: u32) -> Self {
        Platform {
            cpus,
            features,
            freq_tsc,
            lvt_max,
        }
    }

    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    pub fn cpu_online(&self, cpu: CpuId) -> bool {
        (cpu as usize) < self.cpus.len()
    }

    pub fn apic_id(&self, cpu: CpuId) -> u32 {
        self.cpus[cpu as usize].apic_id
    }

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn has_feature(&self, feature: Features) -> bool {
        self.features.contains(feature)
    }

    pub(crate) fn clear_feature(&mut self, feature: Features) {
        self.features &= !feature;
    }

    pub fn freq_tsc(&self) -> u64 {
        self.freq_tsc
    }

    pub fn lvt_max(&self) -> u32 {
        self.lvt_max
    }
}
