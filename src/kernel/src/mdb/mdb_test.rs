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

use super::*;

fn node(base: usize, order: u32) -> MdbNode {
    MdbNode::new(base, order, 0x7, base + 0x1000, None)
}

#[test]
fn ranges_overlap_iff_equal() {
    // aligned power-of-two ranges either nest or are disjoint
    assert_eq!(Range::new(0x10, 4).cmp(&Range::unit(0x17)), core::cmp::Ordering::Equal);
    assert_eq!(Range::new(0x10, 4).cmp(&Range::new(0x10, 2)), core::cmp::Ordering::Equal);
    assert!(Range::new(0x10, 4) < Range::new(0x20, 4));
    assert!(Range::new(0x20, 4) > Range::new(0x10, 4));
    assert!(Range::new(0x10, 4).contains(&Range::new(0x14, 2)));
    assert!(!Range::new(0x10, 2).contains(&Range::new(0x10, 4)));
}

#[test]
fn insert_rejects_overlap() {
    let mut tree = SpaceTree::default();
    tree.insert(node(0x10, 4)).unwrap();

    // same range, sub-range, super-range: all collide
    assert!(tree.insert(node(0x10, 4)).is_err());
    assert!(tree.insert(node(0x14, 0)).is_err());
    assert!(tree.insert(node(0x00, 6)).is_err());

    // disjoint neighbours are fine
    tree.insert(node(0x00, 4)).unwrap();
    tree.insert(node(0x20, 4)).unwrap();
}

#[test]
fn lookup_covering_and_next() {
    let mut tree = SpaceTree::default();
    let a = tree.insert(node(0x10, 4)).unwrap();
    let b = tree.insert(node(0x40, 2)).unwrap();

    assert_eq!(tree.lookup(0x10), Some(a));
    assert_eq!(tree.lookup(0x1F), Some(a));
    assert_eq!(tree.lookup(0x20), None);
    assert_eq!(tree.lookup_next(0x20), Some(b));
    assert_eq!(tree.lookup_next(0x44), None);
}

#[test]
fn addreg_decomposes_greedily() {
    let mut tree = SpaceTree::default();
    // [0x3, 0x3 + 0xD): must fall apart into aligned power-of-two chunks
    tree.addreg(0x3, 0xD, 0x7, 0x103);

    let mut ranges = alloc::vec::Vec::new();
    tree.for_each_in(Range::new(0, 8), |id| {
        let n = tree.node(id);
        ranges.push((n.base, n.order, n.phys));
    });

    assert_eq!(ranges, [(0x3, 0, 0x103), (0x4, 2, 0x104), (0x8, 3, 0x108)]);
}

#[test]
fn delreg_restores_the_flanks() {
    let mut tree = SpaceTree::default();
    tree.addreg(0x10, 0x10, 0x7, 0x110);
    assert!(tree.lookup(0x17).is_some());

    assert!(tree.delreg(0x17));
    assert!(tree.lookup(0x17).is_none());

    // every other unit of the former region is still covered, with the
    // physical backing shifted accordingly
    for unit in 0x10..0x20 {
        if unit == 0x17 {
            continue;
        }
        let id = tree.lookup(unit).expect("flank lost");
        let n = tree.node(id);
        assert_eq!(n.phys + (unit - n.base), 0x100 + unit);
        assert_eq!(n.attr, 0x7);
    }

    // removing a non-existing unit reports failure
    assert!(!tree.delreg(0x17));
}

#[test]
fn addreg_delreg_round_trip() {
    let mut tree = SpaceTree::default();
    tree.addreg(0x40, 0x10, 0x3, 0x40);

    assert!(tree.delreg(0x48));
    // re-adding the hole restores full coverage
    tree.addreg(0x48, 1, 0x3, 0x48);

    for unit in 0x40..0x50 {
        let id = tree.lookup(unit).expect("coverage lost");
        let n = tree.node(id);
        assert_eq!(n.phys + (unit - n.base), unit);
    }
}

#[test]
fn arena_reuses_slots() {
    let mut tree = SpaceTree::default();
    let a = tree.insert(node(0x10, 0)).unwrap();
    tree.remove(a);
    let b = tree.insert(node(0x20, 0)).unwrap();
    assert_eq!(a, b);
    assert_eq!(tree.node(b).base, 0x20);
}
