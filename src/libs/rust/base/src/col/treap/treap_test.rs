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

use super::Treap;

#[test]
fn insert_get_remove() {
    let mut t: Treap<u32, &str> = Treap::new();
    assert!(t.is_empty());

    for (k, v) in [(4, "four"), (1, "one"), (9, "nine"), (6, "six")] {
        t.insert(k, v);
    }

    assert_eq!(t.get(&1), Some(&"one"));
    assert_eq!(t.get(&6), Some(&"six"));
    assert_eq!(t.get(&5), None);

    assert_eq!(t.remove(&6), Some("six"));
    assert_eq!(t.get(&6), None);
    assert_eq!(t.remove(&6), None);

    assert_eq!(t.remove(&4), Some("four"));
    assert_eq!(t.remove(&1), Some("one"));
    assert_eq!(t.remove(&9), Some("nine"));
    assert!(t.is_empty());
}

#[test]
fn ordered_iteration() {
    let mut t: Treap<u32, u32> = Treap::new();
    for k in [5, 3, 8, 1, 9, 7, 2] {
        t.insert(k, k * 10);
    }

    let mut keys = alloc::vec::Vec::new();
    t.for_each(|k, v| {
        keys.push(*k);
        assert_eq!(*v, k * 10);
    });
    assert_eq!(keys, [1, 2, 3, 5, 7, 8, 9]);
}

#[test]
fn successor_queries() {
    let mut t: Treap<u32, u32> = Treap::new();
    for k in [10, 20, 30] {
        t.insert(k, k);
    }

    assert_eq!(t.get_or_next(&10), Some((&10, &10)));
    assert_eq!(t.get_or_next(&11), Some((&20, &20)));
    assert_eq!(t.get_or_next(&25), Some((&30, &30)));
    assert_eq!(t.get_or_next(&31), None);
}

#[test]
fn many_elements_stay_consistent() {
    let mut t: Treap<u32, u32> = Treap::new();
    for k in 0..512 {
        // scatter the keys to exercise the rotations
        t.insert((k * 37) % 512, k);
    }
    for k in 0..512 {
        assert!(t.get(&k).is_some());
    }
    for k in (0..512).step_by(2) {
        assert!(t.remove(&k).is_some());
    }
    for k in 0..512 {
        assert_eq!(t.get(&k).is_some(), k % 2 == 1);
    }
}
