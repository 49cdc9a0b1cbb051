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

//! User interrupt delivery
//!
//! `irq_ctrl` binds a (semaphore, kernel page, bit) triple to a per-CPU
//! vector; when the vector fires, the bit records which source it was and
//! the semaphore wakes the driver.

use base::io::LogFlags;
use base::log;
use base::rc::Arc;

use crate::cap::{Kp, Sm};
use crate::cpu::CpuId;
use crate::Kernel;

/// The routing state of one user vector on one CPU
#[derive(Default)]
pub struct VectorInfo {
    pub sm: Option<Arc<Sm>>,
    pub kp: Option<Arc<Kp>>,
    pub kp_bit: u16,
    /// a level-triggered IOAPIC pin stays masked until re-armed
    pub level_src: Option<(u32, u32)>,
}

impl VectorInfo {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.sm.is_some()
    }
}

/// Delivers the user vector `vector` that fired on `cpu`
pub fn handle_user_irq(k: &Kernel, cpu: CpuId, vector: usize) {
    if vector >= crate::NUM_USER_VECTORS {
        return;
    }

    let (sm, kp, bit, level) = {
        let info = k.vector_info(cpu, vector).lock();
        (
            info.sm.clone(),
            info.kp.clone(),
            info.kp_bit,
            info.level_src,
        )
    };

    let Some(sm) = sm else {
        log!(LogFlags::KernIrq, "spurious user vector {} on CPU {}", vector, cpu);
        return;
    };

    if let Some(kp) = kp {
        kp.set_bit(bit as usize);
    }

    // a level-triggered source would fire again immediately; keep it
    // masked until the driver re-arms the pin
    if let Some((ioapic, pin)) = level {
        k.ioapics.set_mask(k, ioapic, pin, true);
    }

    sm.up(k);
}
