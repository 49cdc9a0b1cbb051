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

use base::hif::MemAttr;

use crate::spaces::SpaceMem;
use crate::mdb::SpaceKind;
use crate::test_utils;

#[test]
fn insert_lookup_remove() {
    let k = test_utils::kernel(1);
    let space = SpaceMem::new(SpaceKind::Host);

    let cleanup = space.insert(&k, 42, 0x100, 0x900, 2, MemAttr::R | MemAttr::W);
    cleanup.ignore_tlb_flush();

    // translation walks into the covering node
    assert_eq!(space.lookup(0x102), Some((0x902, MemAttr::R | MemAttr::W, 2)));
    assert_eq!(space.lookup(0x104), None);

    let cleanup = space.remove(&k, 42, 0x100);
    cleanup.ignore_tlb_flush();
    assert_eq!(space.lookup(0x102), None);
}

#[test]
fn updates_track_stale_cpus() {
    let k = test_utils::kernel(2);
    let space = SpaceMem::new(SpaceKind::Host);

    // nobody ran this PD yet: no TLB can be stale
    let cleanup = space.insert(&k, 7, 0x10, 0x20, 0, MemAttr::R);
    assert!(!cleanup.need_flush());
    cleanup.ignore_tlb_flush();

    space.init_cpu(1);
    let cleanup = space.remove(&k, 7, 0x10);
    assert_eq!(cleanup.cpu_mask(), 1 << 1);
    assert!(space.stale(1));
    assert!(!space.stale(0));
    cleanup.flush(&k, 0);
}

#[test]
fn take_stale_clears_the_bit() {
    let space = SpaceMem::new(SpaceKind::Host);
    space.init_cpu(0);
    space.mark_stale(0b1);

    assert!(space.take_stale(0));
    assert!(!space.take_stale(0));
}
