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
use base::mem::VirtAddr;
use base::rc::Arc;

use super::*;
use crate::cpu::hazards;
use crate::pd::Pd;
use crate::test_utils;

fn local_ec(k: &crate::Kernel, pd: &Arc<Pd>, utcb: usize) -> Arc<Ec> {
    Ec::new(
        k,
        pd.clone(),
        pd.clone(),
        0,
        0x200,
        VirtAddr::new(utcb),
        0x9000,
        false,
        false,
    )
}

#[test]
fn creation_maps_the_utcb() {
    let k = test_utils::kernel(1);
    let pd = Arc::new(Pd::new(false));
    let ec = local_ec(&k, &pd, 0x4000_0000);

    // the user page appears in the PD, readable and writable
    let (_, attr, order) = pd.mem().lookup(0x4000_0000 >> base::cfg::PAGE_BITS).unwrap();
    assert_eq!(attr, MemAttr::R | MemAttr::W);
    assert_eq!(order, 0);

    assert!(!ec.glb());
    assert_eq!(ec.cont(), Cont::None);
    assert_eq!(ec.regs().dst_portal, base::hif::EXC_STARTUP);
}

#[test]
fn claim_is_exclusive() {
    let k = test_utils::kernel(1);
    let pd = Arc::new(Pd::new(false));
    let ec = local_ec(&k, &pd, 0);

    assert!(ec.claim(Cont::RecvUser));
    assert!(!ec.claim(Cont::RecvUser));
    ec.set_cont(Cont::None);
    assert!(ec.claim(Cont::RecvKern));
}

#[test]
fn partner_links_are_weak() {
    let k = test_utils::kernel(1);
    let pd = Arc::new(Pd::new(false));
    let caller = local_ec(&k, &pd, 0);
    let srv = local_ec(&k, &pd, 0x5000_0000);

    caller.set_partner(&srv);
    assert!(Arc::ptr_eq(&caller.partner().unwrap(), &srv));
    assert!(Arc::ptr_eq(&srv.rcap().unwrap(), &caller));

    // severing clears both directions
    assert!(caller.clr_partner());
    assert!(caller.partner().is_none());
    assert!(srv.rcap().is_none());
    assert!(!caller.clr_partner());
}

#[test]
fn dead_partner_does_not_stay_alive() {
    let k = test_utils::kernel(1);
    let pd = Arc::new(Pd::new(false));
    let caller = local_ec(&k, &pd, 0);

    {
        let srv = local_ec(&k, &pd, 0x5000_0000);
        caller.set_partner(&srv);
    }

    // the back-pointer must not have kept the server alive
    assert!(caller.partner().is_none());
}

#[test]
fn recall_without_portal_kills_the_ec() {
    let k = test_utils::kernel(1);
    let root = test_utils::boot_root(&k, 0);

    // recall with no portal installed kills the EC
    root.ec.set_hazard(hazards::RECALL);
    root.ec.set_cont(Cont::RetUser(RetMode::Sysexit));
    let exit = crate::cpu::run(&k, 0);

    assert_eq!(root.ec.cont(), Cont::Dead);
    assert_eq!(root.ec.hazard() & hazards::RECALL, 0);
    match exit {
        crate::cpu::Exit::Halted => {
        },
        _ => panic!("expected the CPU to go idle after the kill"),
    }
}

#[test]
fn redirect_to_iret_builds_a_user_frame() {
    let k = test_utils::kernel(1);
    let pd = Arc::new(Pd::new(false));
    let ec = local_ec(&k, &pd, 0);

    ec.redirect_to_iret();
    let regs = ec.regs();
    assert_eq!(regs.cs, crate::arch::SEL_USER_CODE);
    assert_eq!(regs.ss, crate::arch::SEL_USER_DATA);
    assert_ne!(regs.rflags & crate::arch::EFL_IF, 0);
}
