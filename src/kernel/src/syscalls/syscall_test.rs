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

use core::sync::atomic::Ordering;

use base::errors::Code;
use base::hif::syscalls::{
    EcCtrl, Hypercall, KpCtrl, PdCtrl, SmCtrl, VcpuCtrl, EC_GLOBAL, REVOKE_SELF,
};
use base::hif::{Crd, CrdKind, MemAttr, Qpd, Xfer, XferKind};
use base::rc::Arc;

use crate::cap::Sm;
use crate::cpu::{hazards, Exit};
use crate::ec::{Cont, RetMode};
use crate::test_utils::{self, expect_user, status_of, SysFrame, SEL_ROOT_PD};

const SEL_PD: usize = 0x10;
const SEL_EC: usize = 0x11;
const SEL_SC: usize = 0x12;
const SEL_PT: usize = 0x13;
const SEL_SM: usize = 0x14;
const SEL_KP: usize = 0x15;
const SEL_VCPU: usize = 0x16;

fn ec_args(evt: usize, cpu: usize) -> usize {
    evt | (cpu << 32)
}

#[test]
fn unknown_hypercall() {
    let k = test_utils::kernel(1);
    let root = test_utils::boot_root(&k, 0);

    let mut frame = crate::arch::ExcRegs::default();
    frame.rdi = 0xFF;
    let exit = crate::entry::syscall(&k, 0, &frame);
    expect_user(&exit, &root.ec);
    assert_eq!(status_of(&root.ec), Code::BadHyp);
}

#[test]
fn create_and_call_through_a_new_pd() {
    let k = test_utils::kernel(1);
    let root = test_utils::boot_root(&k, 0);

    // PD
    let exit = SysFrame::new(Hypercall::CreatePd, 0, SEL_PD)
        .arg1(SEL_ROOT_PD)
        .arg2(Crd::null().raw())
        .fire(&k, 0);
    expect_user(&exit, &root.ec);
    assert_eq!(status_of(&root.ec), Code::Success);

    // local EC in the new PD, UTCB mapped in the owner for convenience
    let exit = SysFrame::new(
        Hypercall::CreateEc,
        base::hif::syscalls::EC_USER_PAGE_IN_OWNER,
        SEL_EC,
    )
    .arg1(SEL_PD)
    .arg2(0x5000_0000_0000)
    .arg3(0x5000_0000_2000)
    .arg4(ec_args(0x300, 0))
    .fire(&k, 0);
    expect_user(&exit, &root.ec);
    assert_eq!(status_of(&root.ec), Code::Success);

    // portal bound to it
    let exit = SysFrame::new(Hypercall::CreatePt, 0, SEL_PT)
        .arg1(SEL_ROOT_PD)
        .arg2(SEL_EC)
        .arg3(0)
        .arg4(0x40_0000)
        .fire(&k, 0);
    expect_user(&exit, &root.ec);
    assert_eq!(status_of(&root.ec), Code::Success);

    // and a call through it lands in the handler
    let exit = SysFrame::new(Hypercall::Call, 0, SEL_PT).fire(&k, 0);
    let srv = root
        .pd
        .lookup_cap(SEL_EC)
        .unwrap()
        .to_ec(0)
        .unwrap();
    expect_user(&exit, &srv);
    assert_eq!(srv.regs().rip, 0x40_0000);
    assert!(Arc::ptr_eq(&srv.rcap().unwrap(), &root.ec));
}

#[test]
fn create_ec_validates_its_arguments() {
    let k = test_utils::kernel(1);
    let root = test_utils::boot_root(&k, 0);

    // offline CPU
    let exit = SysFrame::new(Hypercall::CreateEc, 0, SEL_EC)
        .arg1(SEL_ROOT_PD)
        .arg2(0x5000_0000_0000)
        .arg4(ec_args(0, 7))
        .fire(&k, 0);
    expect_user(&exit, &root.ec);
    assert_eq!(status_of(&root.ec), Code::BadCpu);

    // unaligned user page
    let exit = SysFrame::new(Hypercall::CreateEc, 0, SEL_EC)
        .arg1(SEL_ROOT_PD)
        .arg2(0x5000_0000_0123)
        .arg4(ec_args(0, 0))
        .fire(&k, 0);
    expect_user(&exit, &root.ec);
    assert_eq!(status_of(&root.ec), Code::BadPar);

    // not a PD capability
    let exit = SysFrame::new(Hypercall::CreateEc, 0, SEL_EC)
        .arg1(test_utils::SEL_ROOT_EC)
        .arg2(0x5000_0000_0000)
        .arg4(ec_args(0, 0))
        .fire(&k, 0);
    expect_user(&exit, &root.ec);
    assert_eq!(status_of(&root.ec), Code::BadCap);

    // nothing was created along the way
    assert!(root.pd.lookup_cap(SEL_EC).is_none());
}

#[test]
fn create_sc_schedules_the_ec() {
    let k = test_utils::kernel(1);
    let root = test_utils::boot_root(&k, 0);

    // global EC whose startup event lands in a local handler
    let exit = SysFrame::new(Hypercall::CreateEc, EC_GLOBAL, SEL_EC)
        .arg1(SEL_ROOT_PD)
        .arg2(0x5000_0000_0000)
        .arg3(0x5000_0000_2000)
        .arg4(ec_args(0x300, 0))
        .fire(&k, 0);
    expect_user(&exit, &root.ec);
    assert_eq!(status_of(&root.ec), Code::Success);

    let new_ec = root.pd.lookup_cap(SEL_EC).unwrap().to_ec(0).unwrap();
    assert_eq!(new_ec.cont(), Cont::SendMsg(RetMode::Iret));

    let handler = crate::ec::Ec::new(
        &k,
        root.pd.clone(),
        root.pd.clone(),
        0,
        0,
        base::mem::VirtAddr::new(0x6000_0000_0000),
        0,
        false,
        false,
    );
    let pt = Arc::new(crate::cap::Pt::new(
        handler.clone(),
        base::mem::VirtAddr::new(0x70_0000),
        base::hif::Mtd::RIP,
    ));
    root.pd
        .obj()
        .insert_root(
            0x300 + base::hif::EXC_STARTUP,
            crate::cap::KObject::Pt(pt),
            crate::cap::PERM_ALL,
        )
        .unwrap();

    // zero quantum is refused
    let exit = SysFrame::new(Hypercall::CreateSc, 0, 0x60)
        .arg1(SEL_ROOT_PD)
        .arg2(SEL_EC)
        .arg3(Qpd::new(5, 0).raw())
        .fire(&k, 0);
    expect_user(&exit, &root.ec);
    assert_eq!(status_of(&root.ec), Code::BadPar);

    // a valid SC makes the EC runnable: the higher priority preempts the
    // root task and the startup event reaches the handler within the same
    // kernel passage
    let exit = SysFrame::new(Hypercall::CreateSc, 0, SEL_SC)
        .arg1(SEL_ROOT_PD)
        .arg2(SEL_EC)
        .arg3(Qpd::new(32, 10_000).raw())
        .fire(&k, 0);
    expect_user(&exit, &handler);

    assert!(Arc::ptr_eq(&handler.rcap().unwrap(), &new_ec));
    assert_eq!(new_ec.cont(), Cont::RetUser(RetMode::Iret));
    let sc = root.pd.lookup_cap(SEL_SC).unwrap().to_sc(0).unwrap();
    assert!(Arc::ptr_eq(&k.cpu(0).current_sc(), &sc));
}

#[test]
fn occupied_selector_is_refused() {
    let k = test_utils::kernel(1);
    let root = test_utils::boot_root(&k, 0);

    let exit = SysFrame::new(Hypercall::CreateSm, 0, SEL_SM)
        .arg1(SEL_ROOT_PD)
        .arg2(3)
        .fire(&k, 0);
    expect_user(&exit, &root.ec);
    assert_eq!(status_of(&root.ec), Code::Success);

    let exit = SysFrame::new(Hypercall::CreateSm, 0, SEL_SM)
        .arg1(SEL_ROOT_PD)
        .arg2(1)
        .fire(&k, 0);
    expect_user(&exit, &root.ec);
    assert_eq!(status_of(&root.ec), Code::BadCap);

    // the original object is untouched
    let sm = root.pd.lookup_cap(SEL_SM).unwrap().to_sm(0).unwrap();
    assert_eq!(sm.counter(), 3);
}

#[test]
fn sm_down_blocks_until_up() {
    let k = test_utils::kernel(1);
    let root = test_utils::boot_root(&k, 0);

    let exit = SysFrame::new(Hypercall::CreateSm, 0, SEL_SM)
        .arg1(SEL_ROOT_PD)
        .arg2(0)
        .fire(&k, 0);
    expect_user(&exit, &root.ec);

    // the down finds no count and puts the CPU to sleep
    let exit = SysFrame::new(Hypercall::SmCtrl, 0, SEL_SM)
        .arg1(SmCtrl::Down as usize)
        .arg2(0)
        .fire(&k, 0);
    match exit {
        Exit::Halted => {
        },
        _ => panic!("expected the CPU to idle while the root blocks"),
    }
    assert!(root.ec.blocked());

    // an up releases the waiter and its parked SC
    let sm = root.pd.lookup_cap(SEL_SM).unwrap().to_sm(0).unwrap();
    sm.up(&k);
    assert!(!root.ec.blocked());

    let exit = crate::entry::bsp_ready(&k, 0);
    expect_user(&exit, &root.ec);
    assert_eq!(status_of(&root.ec), Code::Success);
    assert_eq!(sm.counter(), 0);
}

#[test]
fn sm_down_times_out() {
    let k = test_utils::kernel(1);
    let root = test_utils::boot_root(&k, 0);
    let m = test_utils::machine(&k);

    let exit = SysFrame::new(Hypercall::CreateSm, 0, SEL_SM)
        .arg1(SEL_ROOT_PD)
        .arg2(0)
        .fire(&k, 0);
    expect_user(&exit, &root.ec);

    let exit = SysFrame::new(Hypercall::SmCtrl, 0, SEL_SM)
        .arg1(SmCtrl::Down as usize)
        .arg2(500)
        .fire(&k, 0);
    match exit {
        Exit::Halted => {
        },
        _ => panic!("expected idle"),
    }

    // the deadline passes and the timer fires
    m.tick(1000);
    let exit = crate::entry::timer(&k, 0);
    expect_user(&exit, &root.ec);
    assert_eq!(status_of(&root.ec), Code::ComTim);
    assert!(!root.ec.blocked());

    // the abandoned down does not consume a later up
    let sm = root.pd.lookup_cap(SEL_SM).unwrap().to_sm(0).unwrap();
    sm.up(&k);
    assert_eq!(sm.counter(), 1);
}

#[test]
fn revoke_removes_delegated_objects() {
    let k = test_utils::kernel(1);
    let root = test_utils::boot_root(&k, 0);

    let exit = SysFrame::new(Hypercall::CreateSm, 0, SEL_SM)
        .arg1(SEL_ROOT_PD)
        .arg2(0)
        .fire(&k, 0);
    expect_user(&exit, &root.ec);

    // new PD seeded with the semaphore capability
    let exit = SysFrame::new(Hypercall::CreatePd, 0, SEL_PD)
        .arg1(SEL_ROOT_PD)
        .arg2(Crd::obj(SEL_SM, 0, Crd::ATTR_ALL).raw())
        .fire(&k, 0);
    expect_user(&exit, &root.ec);
    assert_eq!(status_of(&root.ec), Code::Success);

    let child = root.pd.lookup_cap(SEL_PD).unwrap().to_pd(0).unwrap();
    assert!(child.lookup_cap(SEL_SM).is_some());

    // revoking the donor's Crd takes the child's copy with it
    let exit = SysFrame::new(Hypercall::Revoke, 0, 0)
        .arg1(Crd::obj(SEL_SM, 0, Crd::ATTR_ALL).raw())
        .fire(&k, 0);
    expect_user(&exit, &root.ec);
    assert_eq!(status_of(&root.ec), Code::Success);

    assert!(child.lookup_cap(SEL_SM).is_none());
    assert!(root.pd.lookup_cap(SEL_SM).is_some());

    // with the self flag, the donor loses it as well
    let exit = SysFrame::new(Hypercall::Revoke, REVOKE_SELF, 0)
        .arg1(Crd::obj(SEL_SM, 0, Crd::ATTR_ALL).raw())
        .fire(&k, 0);
    expect_user(&exit, &root.ec);
    assert!(root.pd.lookup_cap(SEL_SM).is_none());
}

#[test]
fn pd_ctrl_lookup_reports_the_covering_node() {
    let k = test_utils::kernel(1);
    let root = test_utils::boot_root(&k, 0);

    root.pd
        .mem()
        .tree
        .lock()
        .addreg(0x2000, 0x10, MemAttr::R.bits(), 0x2000);

    let exit = SysFrame::new(Hypercall::PdCtrl, 0, 0)
        .arg1(PdCtrl::Lookup as usize)
        .arg2(Crd::mem(0x2005, 0, MemAttr::all()).raw())
        .fire(&k, 0);
    expect_user(&exit, &root.ec);
    assert_eq!(status_of(&root.ec), Code::Success);

    let res = Crd::from_raw(root.ec.regs().arg2());
    assert_eq!(res.kind(), CrdKind::Mem);
    assert_eq!(res.base(), 0x2000);
    assert_eq!(res.order(), 4);

    // a miss yields the null Crd
    let exit = SysFrame::new(Hypercall::PdCtrl, 0, 0)
        .arg1(PdCtrl::Lookup as usize)
        .arg2(Crd::mem(0x9999, 0, MemAttr::all()).raw())
        .fire(&k, 0);
    expect_user(&exit, &root.ec);
    assert!(Crd::from_raw(root.ec.regs().arg2()).is_null());
}

#[test]
fn pd_ctrl_delegate_moves_memory_between_pds() {
    let k = test_utils::kernel(1);
    let root = test_utils::boot_root(&k, 0);

    root.pd
        .mem()
        .tree
        .lock()
        .addreg(0x3000, 0x10, (MemAttr::R | MemAttr::W).bits(), 0x3000);

    let exit = SysFrame::new(Hypercall::CreatePd, 0, SEL_PD)
        .arg1(SEL_ROOT_PD)
        .arg2(Crd::null().raw())
        .fire(&k, 0);
    expect_user(&exit, &root.ec);

    let item = Xfer::new(
        Crd::mem(0x3004, 2, MemAttr::R | MemAttr::W),
        XferKind::Delegate,
        0x80,
    );
    let exit = SysFrame::new(Hypercall::PdCtrl, 0, SEL_ROOT_PD)
        .arg1(PdCtrl::Delegate as usize)
        .arg2(SEL_PD)
        .arg3(item.crd.raw())
        .arg4(item.hotspot)
        .fire(&k, 0);
    expect_user(&exit, &root.ec);
    assert_eq!(status_of(&root.ec), Code::Success);

    let child = root.pd.lookup_cap(SEL_PD).unwrap().to_pd(0).unwrap();
    assert_eq!(
        child.mem().lookup(0x81),
        Some((0x3005, MemAttr::R | MemAttr::W, 2))
    );

    // delegating something the caller does not hold fails cleanly
    let item = Xfer::new(Crd::mem(0x9000, 0, MemAttr::R), XferKind::Delegate, 0x90);
    let exit = SysFrame::new(Hypercall::PdCtrl, 0, SEL_ROOT_PD)
        .arg1(PdCtrl::Delegate as usize)
        .arg2(SEL_PD)
        .arg3(item.crd.raw())
        .arg4(item.hotspot)
        .fire(&k, 0);
    expect_user(&exit, &root.ec);
    assert_eq!(status_of(&root.ec), Code::BadPar);
}

#[test]
fn ec_ctrl_recall_redirects_through_the_event_portal() {
    let k = test_utils::kernel(1);
    let root = test_utils::boot_root(&k, 0);

    // recall handler at event base + EXC_RECALL
    let handler = crate::ec::Ec::new(
        &k,
        root.pd.clone(),
        root.pd.clone(),
        0,
        0,
        base::mem::VirtAddr::new(0x6000_0000_0000),
        0,
        false,
        false,
    );
    let pt = Arc::new(crate::cap::Pt::new(
        handler.clone(),
        base::mem::VirtAddr::new(0x80_0000),
        base::hif::Mtd::RIP,
    ));
    root.pd
        .obj()
        .insert_root(
            root.ec.evt() + base::hif::EXC_RECALL,
            crate::cap::KObject::Pt(pt),
            crate::cap::PERM_ALL,
        )
        .unwrap();

    // the recall is seen at the caller's own return to user: the hazard is
    // consumed and the EC ends up in its recall portal
    let exit = SysFrame::new(Hypercall::EcCtrl, 0, test_utils::SEL_ROOT_EC)
        .arg1(EcCtrl::Recall as usize)
        .fire(&k, 0);
    expect_user(&exit, &handler);

    assert_eq!(root.ec.hazard() & hazards::RECALL, 0);
    assert_eq!(root.ec.cont(), Cont::RetUser(RetMode::Iret));
    assert!(Arc::ptr_eq(&handler.rcap().unwrap(), &root.ec));
}

#[test]
fn kp_ctrl_maps_and_unmaps() {
    let k = test_utils::kernel(1);
    let root = test_utils::boot_root(&k, 0);

    let exit = SysFrame::new(Hypercall::CreateKp, 0, SEL_KP)
        .arg1(SEL_ROOT_PD)
        .fire(&k, 0);
    expect_user(&exit, &root.ec);
    assert_eq!(status_of(&root.ec), Code::Success);

    let exit = SysFrame::new(Hypercall::KpCtrl, 0, SEL_KP)
        .arg1(KpCtrl::Map as usize)
        .arg2(SEL_ROOT_PD)
        .arg3(0x4000_0000)
        .fire(&k, 0);
    expect_user(&exit, &root.ec);
    assert_eq!(status_of(&root.ec), Code::Success);
    assert!(root.pd.mem().lookup(0x4000_0000 >> base::cfg::PAGE_BITS).is_some());

    // a second mapping is refused until the first is gone
    let exit = SysFrame::new(Hypercall::KpCtrl, 0, SEL_KP)
        .arg1(KpCtrl::Map as usize)
        .arg2(SEL_ROOT_PD)
        .arg3(0x4000_1000)
        .fire(&k, 0);
    expect_user(&exit, &root.ec);
    assert_eq!(status_of(&root.ec), Code::BadPar);

    let exit = SysFrame::new(Hypercall::KpCtrl, 0, SEL_KP)
        .arg1(KpCtrl::Unmap as usize)
        .fire(&k, 0);
    expect_user(&exit, &root.ec);
    assert_eq!(status_of(&root.ec), Code::Success);
    assert!(root.pd.mem().lookup(0x4000_0000 >> base::cfg::PAGE_BITS).is_none());
}

#[test]
fn vcpu_needs_the_feature() {
    let k = test_utils::kernel(1);
    let root = test_utils::boot_root(&k, 0);

    let exit = SysFrame::new(Hypercall::CreateVcpu, 0, SEL_VCPU)
        .arg1(SEL_ROOT_PD)
        .arg4(ec_args(0x400, 0))
        .fire(&k, 0);
    expect_user(&exit, &root.ec);
    assert_eq!(status_of(&root.ec), Code::BadFtr);
}

#[test]
fn vcpu_runs_on_donated_time_and_exits_via_portals() {
    let k = test_utils::kernel_vmx(1);
    let root = test_utils::boot_root(&k, 0);

    let exit = SysFrame::new(Hypercall::CreateVcpu, 0, SEL_VCPU)
        .arg1(SEL_ROOT_PD)
        .arg4(ec_args(0x400, 0))
        .fire(&k, 0);
    expect_user(&exit, &root.ec);
    assert_eq!(status_of(&root.ec), Code::Success);

    let vcpu = root.pd.lookup_cap(SEL_VCPU).unwrap().to_vcpu(0).unwrap();

    // exit handler: a local EC behind the vcpu's event portal for reason 12
    let handler = crate::ec::Ec::new(
        &k,
        root.pd.clone(),
        root.pd.clone(),
        0,
        0,
        base::mem::VirtAddr::new(0x6000_0000_0000),
        0,
        false,
        false,
    );
    let pt = Arc::new(crate::cap::Pt::new(
        handler.clone(),
        base::mem::VirtAddr::new(0x60_0000),
        base::hif::Mtd::GPR,
    ));
    root.pd
        .obj()
        .insert_root(0x400 + 12, crate::cap::KObject::Pt(pt), crate::cap::PERM_ALL)
        .unwrap();

    // run: the guest becomes current on the caller's SC
    let exit = SysFrame::new(Hypercall::VcpuCtrl, 0, SEL_VCPU)
        .arg1(VcpuCtrl::Run as usize)
        .fire(&k, 0);
    expect_user(&exit, vcpu.ec());
    assert!(Arc::ptr_eq(&k.cpu(0).current_sc(), &root.sc));
    assert!(Arc::ptr_eq(&vcpu.ec().rcap().unwrap(), &root.ec));

    // a VM exit lands in the handler through the IPC engine
    let frame = crate::arch::ExcRegs::default();
    let exit = crate::entry::vmexit(&k, 0, 12, &frame);
    expect_user(&exit, &handler);
    assert_eq!(vcpu.ec().cont(), Cont::RetUser(RetMode::VmResume));

    // the handler's reply resumes the guest
    let exit = SysFrame::new(Hypercall::Reply, 0, 0).fire(&k, 0);
    expect_user(&exit, vcpu.ec());
}

#[test]
fn vcpu_poke_forces_an_exit() {
    let k = test_utils::kernel_vmx(1);
    let root = test_utils::boot_root(&k, 0);
    let m = test_utils::machine(&k);

    let exit = SysFrame::new(Hypercall::CreateVcpu, 0, SEL_VCPU)
        .arg1(SEL_ROOT_PD)
        .arg4(ec_args(0x400, 0))
        .fire(&k, 0);
    expect_user(&exit, &root.ec);

    let vcpu = root.pd.lookup_cap(SEL_VCPU).unwrap().to_vcpu(0).unwrap();

    // make the guest current, then poke it from the side
    k.cpu(0).make_current(vcpu.ec().clone());
    {
        // issue the poke on behalf of the root EC
        let mut regs = vcpu.ec().regs();
        regs.rdi = Hypercall::VcpuCtrl as usize | (SEL_VCPU << 12);
        regs.rsi = VcpuCtrl::Poke as usize;
    }
    crate::syscalls::handle(&k, 0);

    assert_ne!(vcpu.ec().hazard() & hazards::RECALL, 0);
    assert_eq!(m.pokes.load(Ordering::Acquire), 1);
}

#[test]
fn shootdown_reaches_idle_cpus() {
    let k = test_utils::kernel(2);
    let root = test_utils::boot_root(&k, 0);

    // the root PD also runs on CPU 1, which currently idles
    root.pd.mem().init_cpu(1);
    root.pd
        .mem()
        .tree
        .lock()
        .addreg(0x8000, 1, MemAttr::R.bits(), 0x8000);

    let acks = k.cpu(1).shootdown_ack.load(Ordering::Acquire);

    let exit = SysFrame::new(Hypercall::Revoke, REVOKE_SELF, 0)
        .arg1(Crd::mem(0x8000, 0, MemAttr::all()).raw())
        .fire(&k, 0);
    expect_user(&exit, &root.ec);
    assert_eq!(status_of(&root.ec), Code::Success);

    // the idle CPU acknowledged and flushes at its next kernel passage
    assert_eq!(k.cpu(1).shootdown_ack.load(Ordering::Acquire), acks + 1);
    assert_ne!(k.cpu(1).hazard() & hazards::TLB, 0);
}

#[test]
fn sm_conservation_across_ups_and_downs() {
    let k = test_utils::kernel(1);
    let _root = test_utils::boot_root(&k, 0);

    let sm = Arc::new(Sm::new(0));
    let mut ups = 0u64;
    let mut granted = 0u64;

    for _ in 0..5 {
        sm.up(&k);
        ups += 1;
    }
    let root2 = k.cpu(0).current();
    for _ in 0..3 {
        if sm.dn_for(&k, &root2) {
            granted += 1;
        }
    }

    assert_eq!(sm.counter(), ups - granted);
}
