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

use base::rc::Arc;

use crate::cap::{Kp, Sm};
use crate::test_utils;

#[test]
fn up_without_waiters_counts() {
    let k = test_utils::kernel(1);
    let sm = Arc::new(Sm::new(2));

    sm.up(&k);
    sm.up(&k);
    assert_eq!(sm.counter(), 4);
}

#[test]
fn dn_for_consumes_counts() {
    let k = test_utils::kernel(1);
    let root = test_utils::boot_root(&k, 0);
    let sm = Arc::new(Sm::new(1));

    assert!(sm.dn_for(&k, &root.ec));
    assert_eq!(sm.counter(), 0);

    // no count left: the EC queues up
    assert!(!sm.dn_for(&k, &root.ec));
    assert!(root.ec.blocked());

    // an up grants the queued down instead of counting
    sm.up(&k);
    assert_eq!(sm.counter(), 0);
    assert!(!root.ec.blocked());
}

#[test]
fn cancel_removes_a_waiter() {
    let k = test_utils::kernel(1);
    let root = test_utils::boot_root(&k, 0);
    let sm = Arc::new(Sm::new(0));

    assert!(!sm.dn_for(&k, &root.ec));
    assert!(sm.cancel(&root.ec));
    assert!(!sm.cancel(&root.ec));

    // the abandoned down must not eat a later up
    sm.up(&k);
    assert_eq!(sm.counter(), 1);
}

#[test]
fn kp_bits_accumulate() {
    let kp = Kp::new();
    kp.set_bit(3);
    kp.set_bit(64);
    kp.set_bit(64);

    let ptr = kp.page_ptr();
    let w0 = unsafe { core::ptr::read(ptr as *const u64) };
    let w1 = unsafe { core::ptr::read((ptr as *const u64).add(1)) };
    assert_eq!(w0, 1 << 3);
    assert_eq!(w1, 1 << 0);
}

#[test]
fn kp_single_user_mapping() {
    let k = test_utils::kernel(1);
    let root = test_utils::boot_root(&k, 0);
    let kp = Kp::new();

    assert!(kp.add_user_mapping(&k, &root.pd, 0x5000));
    // a KP maps into at most one PD at a time
    assert!(!kp.add_user_mapping(&k, &root.pd, 0x6000));

    assert!(kp.remove_user_mapping(&k, 0));
    assert!(!kp.remove_user_mapping(&k, 0));

    // free again after the unmap
    assert!(kp.add_user_mapping(&k, &root.pd, 0x6000));
}
