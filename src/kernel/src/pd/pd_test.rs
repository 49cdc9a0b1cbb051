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

use base::errors::Code;
use base::hif::{Crd, CrdKind, MemAttr};
use base::rc::Arc;

use super::*;
use crate::cap::{KObject, Sm};
use crate::mdb::SpaceKind;
use crate::test_utils;

fn pd_with_mem(range_base: usize, pages: usize) -> Arc<Pd> {
    let pd = Arc::new(Pd::new(false));
    pd.mem()
        .tree
        .lock()
        .addreg(range_base, pages, (MemAttr::R | MemAttr::W | MemAttr::X).bits(), range_base);
    pd
}

#[test]
fn delegate_creates_a_child_mapping() {
    let k = test_utils::kernel(1);
    let donor = pd_with_mem(0x1000, 0x10);
    let child = Arc::new(Pd::new(false));

    delegate(&k, &donor, &child, SpaceKind::Host, 0x1004, 0x20, 2, MemAttr::R.bits())
        .unwrap()
        .ignore_tlb_flush();

    // the child sees the sub-range with narrowed rights
    assert_eq!(child.mem().lookup(0x21), Some((0x1005, MemAttr::R, 2)));
    // the donor is untouched
    assert_eq!(donor.mem().lookup(0x1004).map(|(p, _, _)| p), Some(0x1004));
}

#[test]
fn delegate_validates_the_donor() {
    let k = test_utils::kernel(1);
    let donor = pd_with_mem(0x1000, 0x10);
    let child = Arc::new(Pd::new(false));

    // outside of anything the donor holds
    let res = delegate(&k, &donor, &child, SpaceKind::Host, 0x2000, 0x20, 0, 0x7);
    assert_eq!(res.err().map(|e| e.code()), Some(Code::InvalidMapping));

    // rights must intersect
    let donor_ro = Arc::new(Pd::new(false));
    donor_ro
        .mem()
        .tree
        .lock()
        .addreg(0x3000, 4, MemAttr::R.bits(), 0x3000);
    let res = delegate(
        &k,
        &donor_ro,
        &child,
        SpaceKind::Host,
        0x3000,
        0x30,
        0,
        MemAttr::W.bits(),
    );
    assert_eq!(res.err().map(|e| e.code()), Some(Code::InvalidMapping));

    // occupied destination
    delegate(&k, &donor, &child, SpaceKind::Host, 0x1000, 0x40, 0, 0x7)
        .unwrap()
        .ignore_tlb_flush();
    let res = delegate(&k, &donor, &child, SpaceKind::Host, 0x1001, 0x40, 0, 0x7);
    assert_eq!(res.err().map(|e| e.code()), Some(Code::InvalidMapping));
}

#[test]
fn revoke_cascades_through_donees() {
    let k = test_utils::kernel(2);
    let root = pd_with_mem(0x1000, 0x10);
    let child = Arc::new(Pd::new(false));
    let grandchild = Arc::new(Pd::new(false));

    // both downstream PDs have run somewhere
    child.mem().init_cpu(1);
    grandchild.mem().init_cpu(1);

    delegate(&k, &root, &child, SpaceKind::Host, 0x1001, 0x10, 0, 0x7)
        .unwrap()
        .ignore_tlb_flush();
    delegate(&k, &child, &grandchild, SpaceKind::Host, 0x10, 0x20, 0, 0x7)
        .unwrap()
        .ignore_tlb_flush();

    assert!(child.mem().lookup(0x10).is_some());
    assert!(grandchild.mem().lookup(0x20).is_some());

    let acks_before = k.cpu(1).shootdown_ack.load(core::sync::atomic::Ordering::Acquire);

    rev_crd(&k, 0, &root, Crd::mem(0x1001, 0, MemAttr::all()), false);

    // every downstream translation is gone, the donor's own stays
    assert!(child.mem().lookup(0x10).is_none());
    assert!(grandchild.mem().lookup(0x20).is_none());
    assert!(root.mem().lookup(0x1001).is_some());

    // the CPUs that ran the donees acknowledged the shootdown
    let acks_after = k.cpu(1).shootdown_ack.load(core::sync::atomic::Ordering::Acquire);
    assert!(acks_after > acks_before);
}

#[test]
fn revoke_self_removes_the_named_node() {
    let k = test_utils::kernel(1);
    let root = pd_with_mem(0x1000, 0x10);
    let child = Arc::new(Pd::new(false));

    delegate(&k, &root, &child, SpaceKind::Host, 0x1002, 0x50, 1, 0x7)
        .unwrap()
        .ignore_tlb_flush();

    rev_crd(&k, 0, &child, Crd::mem(0x50, 1, MemAttr::all()), true);

    assert!(child.mem().lookup(0x50).is_none());
    // the donor keeps its mapping and no longer lists the child
    assert!(root.mem().lookup(0x1002).is_some());

    // delegating the same range again works, so the child list is clean
    delegate(&k, &root, &child, SpaceKind::Host, 0x1002, 0x50, 1, 0x7)
        .unwrap()
        .ignore_tlb_flush();
    assert!(child.mem().lookup(0x50).is_some());
}

#[test]
fn delegation_then_revocation_restores_the_tree() {
    let k = test_utils::kernel(1);
    let donor = pd_with_mem(0x4000, 0x10);
    let child = Arc::new(Pd::new(false));

    delegate(&k, &donor, &child, SpaceKind::Host, 0x4000, 0x80, 4, 0x7)
        .unwrap()
        .ignore_tlb_flush();

    rev_crd(&k, 0, &donor, Crd::mem(0x4000, 4, MemAttr::all()), false);

    // the recipient has no access and the donor's shape is unchanged
    for unit in 0x80..0x90 {
        assert!(child.mem().lookup(unit).is_none());
    }
    assert_eq!(donor.mem().lookup(0x4005).map(|(p, _, _)| p), Some(0x4005));
}

#[test]
fn object_delegation_and_revocation() {
    let k = test_utils::kernel(1);
    let donor = Arc::new(Pd::new(false));
    let child = Arc::new(Pd::new(false));

    let sm = Arc::new(Sm::new(0));
    donor
        .obj()
        .insert_root(0x10, KObject::Sm(sm.clone()), crate::cap::PERM_ALL)
        .unwrap();

    delegate(&k, &donor, &child, SpaceKind::Obj, 0x10, 0x33, 0, Sm::PERM_UP)
        .unwrap()
        .ignore_tlb_flush();

    // the child holds the same object with narrowed permissions
    let cap = child.lookup_cap(0x33).unwrap();
    assert!(cap.to_sm(Sm::PERM_UP).is_some());
    assert!(cap.to_sm(Sm::PERM_DOWN).is_none());

    rev_crd(&k, 0, &donor, Crd::obj(0x10, 0, Crd::ATTR_ALL), false);
    assert!(child.lookup_cap(0x33).is_none());
    assert!(donor.lookup_cap(0x10).is_some());
}

#[test]
fn translate_finds_the_receivers_name() {
    let k = test_utils::kernel(1);
    let donor = Arc::new(Pd::new(false));
    let receiver = Arc::new(Pd::new(false));

    let sm = Arc::new(Sm::new(0));
    donor
        .obj()
        .insert_root(0x10, KObject::Sm(sm.clone()), crate::cap::PERM_ALL)
        .unwrap();
    receiver
        .obj()
        .insert_root(0x77, KObject::Sm(sm), crate::cap::PERM_ALL)
        .unwrap();

    let item = base::hif::Xfer::new(
        Crd::obj(0x10, 0, Crd::ATTR_ALL),
        base::hif::XferKind::Translate,
        0,
    );
    let res = xfer_item(
        &k,
        &donor,
        &receiver,
        Crd::whole(CrdKind::Obj),
        Crd::null(),
        item,
    )
    .unwrap();

    assert_eq!(res.crd.base(), 0x77);

    // an unrelated object translates to nothing
    let other = Arc::new(Sm::new(0));
    donor
        .obj()
        .insert_root(0x11, KObject::Sm(other), crate::cap::PERM_ALL)
        .unwrap();
    let item = base::hif::Xfer::new(
        Crd::obj(0x11, 0, Crd::ATTR_ALL),
        base::hif::XferKind::Translate,
        0,
    );
    let res = xfer_item(
        &k,
        &donor,
        &receiver,
        Crd::whole(CrdKind::Obj),
        Crd::null(),
        item,
    )
    .unwrap();
    assert!(res.crd.is_null());
}
