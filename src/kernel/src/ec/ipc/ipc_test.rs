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
use base::hif::syscalls::{Hypercall, CALL_DISABLE_BLOCKING};
use base::hif::Mtd;
use base::mem::VirtAddr;
use base::rc::Arc;

use crate::cap::{KObject, Pt, PERM_ALL};
use crate::cpu::Exit;
use crate::ec::{Cont, Ec, RetMode};
use crate::test_utils::{self, expect_user, status_of, SysFrame};

const SEL_PT: usize = 0x20;
const PT_IP: usize = 0x40_0000;
const PT_ID: usize = 0x1234;

struct CallSetup {
    root: test_utils::Root,
    srv: Arc<Ec>,
}

fn call_setup(k: &crate::Kernel) -> CallSetup {
    let root = test_utils::boot_root(k, 0);

    // a local EC in the same PD, reachable through a portal
    let srv = Ec::new(
        k,
        root.pd.clone(),
        root.pd.clone(),
        0,
        0x200,
        VirtAddr::new(0x6000_0000_0000),
        0x6000_0000_2000,
        false,
        false,
    );

    let pt = Arc::new(Pt::new(srv.clone(), VirtAddr::new(PT_IP), Mtd::GPR));
    pt.set_id(PT_ID);
    root.pd
        .obj()
        .insert_root(SEL_PT, KObject::Pt(pt), PERM_ALL)
        .unwrap();

    CallSetup { root, srv }
}

#[test]
fn call_transfers_to_the_handler() {
    let k = test_utils::kernel(1);
    let s = call_setup(&k);

    let exit = SysFrame::new(Hypercall::Call, 0, SEL_PT).fire(&k, 0);
    expect_user(&exit, &s.srv);

    // the handler starts at the portal entry with the portal id loaded
    {
        let regs = s.srv.regs();
        assert_eq!(regs.rip, PT_IP);
        assert_eq!(regs.rdi, PT_ID);
    }

    // partner coupling: the caller waits, the server knows whom to answer
    assert!(Arc::ptr_eq(&s.srv.rcap().unwrap(), &s.root.ec));
    assert!(Arc::ptr_eq(&s.root.ec.partner().unwrap(), &s.srv));
    assert_eq!(s.root.ec.cont(), Cont::RetUser(RetMode::Sysexit));

    // time is donated: the caller's SC keeps running
    assert!(Arc::ptr_eq(&k.cpu(0).current_sc(), &s.root.sc));
}

#[test]
fn reply_echoes_the_message() {
    let k = test_utils::kernel(1);
    let s = call_setup(&k);

    // the caller sends a payload
    s.root.ec.utcb().unwrap().mr[0] = 0xDEAD_BEEF;
    let exit = SysFrame::new(Hypercall::Call, 0, SEL_PT).fire(&k, 0);
    expect_user(&exit, &s.srv);

    // the message arrived in the server's UTCB
    assert_eq!(s.srv.utcb().unwrap().mr[0], 0xDEAD_BEEF);

    // the handler replies without touching anything
    let exit = SysFrame::new(Hypercall::Reply, 0, 0).fire(&k, 0);
    expect_user(&exit, &s.root.ec);

    assert_eq!(status_of(&s.root.ec), Code::Success);
    assert_eq!(s.root.ec.utcb().unwrap().mr[0], 0xDEAD_BEEF);

    // the linkage is gone
    assert!(s.root.ec.partner().is_none());
    assert!(s.srv.rcap().is_none());
    assert_eq!(s.srv.cont(), Cont::None);
}

#[test]
fn bad_portal_capability() {
    let k = test_utils::kernel(1);
    let s = call_setup(&k);

    let exit = SysFrame::new(Hypercall::Call, 0, 0x99).fire(&k, 0);
    expect_user(&exit, &s.root.ec);
    assert_eq!(status_of(&s.root.ec), Code::BadCap);
}

#[test]
fn cross_cpu_call_is_rejected() {
    let k = test_utils::kernel(2);
    let root = test_utils::boot_root(&k, 0);

    // portal bound to a local EC on the other CPU
    let srv = Ec::new(
        &k,
        root.pd.clone(),
        root.pd.clone(),
        1,
        0x200,
        VirtAddr::new(0),
        0,
        false,
        false,
    );
    let pt = Arc::new(Pt::new(srv, VirtAddr::new(PT_IP), Mtd::empty()));
    root.pd
        .obj()
        .insert_root(SEL_PT, KObject::Pt(pt), PERM_ALL)
        .unwrap();

    let exit = SysFrame::new(Hypercall::Call, 0, SEL_PT).fire(&k, 0);
    expect_user(&exit, &root.ec);
    assert_eq!(status_of(&root.ec), Code::BadCpu);
}

#[test]
fn nonblocking_call_to_busy_server_times_out() {
    let k = test_utils::kernel(1);
    let s = call_setup(&k);

    // the server is mid-handler
    s.srv.set_cont(Cont::RetUser(RetMode::Sysexit));

    let exit = SysFrame::new(Hypercall::Call, CALL_DISABLE_BLOCKING, SEL_PT).fire(&k, 0);
    expect_user(&exit, &s.root.ec);

    assert_eq!(status_of(&s.root.ec), Code::ComTim);
    // caller state is unchanged: no partner was ever set
    assert!(s.root.ec.partner().is_none());
}

#[test]
fn blocking_call_helps_the_busy_server() {
    let k = test_utils::kernel(1);
    let s = call_setup(&k);

    s.srv.set_cont(Cont::RetUser(RetMode::Sysexit));

    // helping runs the server on the caller's time and parks the retry
    let exit = SysFrame::new(Hypercall::Call, 0, SEL_PT).fire(&k, 0);
    expect_user(&exit, &s.srv);
    assert_eq!(s.root.ec.cont(), Cont::SysCall);
    assert!(Arc::ptr_eq(&k.cpu(0).current_sc(), &s.root.sc));

    // once the server finishes its work, the caller's retry goes through
    let exit = SysFrame::new(Hypercall::Reply, 0, 0).fire(&k, 0);
    expect_user(&exit, &s.srv);
    assert!(Arc::ptr_eq(&s.srv.rcap().unwrap(), &s.root.ec));
    assert_eq!(s.srv.regs().rip, PT_IP);
}

#[test]
fn partner_cycles_break_with_a_timeout() {
    let k = test_utils::kernel(1);
    let s = call_setup(&k);

    // an artificial A <-> B cycle
    let a = s.srv.clone();
    let b = Ec::new(
        &k,
        s.root.pd.clone(),
        s.root.pd.clone(),
        0,
        0,
        VirtAddr::new(0),
        0,
        false,
        false,
    );
    a.set_partner(&b);
    b.set_partner(&a);

    super::activate(&k, 0, a);

    assert_eq!(s.root.ec.cont(), Cont::SysFinish(Code::ComTim, false));
    let exit = crate::cpu::run(&k, 0);
    expect_user(&exit, &s.root.ec);
    assert_eq!(status_of(&s.root.ec), Code::ComTim);
}

#[test]
fn dying_server_aborts_the_caller() {
    let k = test_utils::kernel(1);
    let s = call_setup(&k);

    let exit = SysFrame::new(Hypercall::Call, 0, SEL_PT).fire(&k, 0);
    expect_user(&exit, &s.srv);

    // the handler crashes instead of replying
    super::die(&k, 0, "test crash");
    let exit = crate::cpu::run(&k, 0);
    expect_user(&exit, &s.root.ec);

    assert_eq!(status_of(&s.root.ec), Code::ComAbt);
    assert_eq!(s.srv.cont(), Cont::Dead);

    // a dead server cannot be called anymore
    let exit = SysFrame::new(Hypercall::Call, 0, SEL_PT).fire(&k, 0);
    expect_user(&exit, &s.root.ec);
    assert_eq!(status_of(&s.root.ec), Code::ComTim);
}

#[test]
fn exception_delivery_uses_the_event_portal() {
    let k = test_utils::kernel(1);
    let root = test_utils::boot_root(&k, 0);

    // handler for #PF at event base + 14
    let handler = Ec::new(
        &k,
        root.pd.clone(),
        root.pd.clone(),
        0,
        0,
        VirtAddr::new(0x6000_0000_0000),
        0,
        false,
        false,
    );
    let pt = Arc::new(Pt::new(
        handler.clone(),
        VirtAddr::new(0x50_0000),
        Mtd::GPR | Mtd::QUAL | Mtd::RIP,
    ));
    root.pd
        .obj()
        .insert_root(root.ec.evt() + base::hif::EXC_PF, KObject::Pt(pt), PERM_ALL)
        .unwrap();

    // a user page fault arrives
    let mut frame = crate::arch::ExcRegs {
        cs: crate::arch::SEL_USER_CODE,
        vec: base::hif::EXC_PF,
        err: crate::arch::PF_ERR_U,
        cr2: 0x1234_5000,
        rip: 0x7777,
        ..Default::default()
    };
    frame.rax = 0xAB;
    let exit = crate::entry::exception(&k, 0, &frame);
    expect_user(&exit, &handler);

    // the handler sees the fault state in its UTCB
    {
        let utcb = handler.utcb().unwrap();
        assert_eq!(utcb.qual[1], 0x1234_5000);
        assert_eq!(utcb.rip, 0x7777);
        assert_eq!(utcb.gpr[0], 0xAB);
    }

    // the faulter resumes via iret once the handler replies
    assert_eq!(root.ec.cont(), Cont::RetUser(RetMode::Iret));
    let exit = SysFrame::new(Hypercall::Reply, 0, 0).fire(&k, 0);
    expect_user(&exit, &root.ec);
}

#[test]
fn missing_exception_portal_kills_the_ec() {
    let k = test_utils::kernel(1);
    let root = test_utils::boot_root(&k, 0);

    let frame = crate::arch::ExcRegs {
        cs: crate::arch::SEL_USER_CODE,
        vec: base::hif::EXC_PF,
        err: crate::arch::PF_ERR_U,
        cr2: 0xDEAD_0000,
        ..Default::default()
    };
    let exit = crate::entry::exception(&k, 0, &frame);

    assert_eq!(root.ec.cont(), Cont::Dead);
    match exit {
        Exit::Halted => {
        },
        _ => panic!("expected idle after killing the faulter"),
    }
}
