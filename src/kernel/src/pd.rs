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

//! Protection domains
//!
//! A PD owns the four subspaces and is the unit of delegation: every
//! transfer of memory, ports or object capabilities records the donor in
//! the mapping database, and revocation walks that record.

use alloc::vec::Vec;

use base::errors::{Code, Error};
use base::hif::{Crd, CrdKind, Xfer, XferKind};
use base::io::LogFlags;
use base::log;
use base::rc::{Arc, Weak};

use crate::cap::Capability;
use crate::cpu::CpuId;
use crate::mdb::{MdbNode, NodeRef, Range, SpaceKind};
use crate::spaces::{SpaceIo, SpaceMem, SpaceObj, TlbCleanup};
use crate::Kernel;

/// A protection domain
pub struct Pd {
    asid: usize,
    mem: SpaceMem,
    gst: SpaceMem,
    io: SpaceIo,
    obj: SpaceObj,
    is_passthrough: bool,
    is_kern: bool,
}

impl Pd {
    pub const PERM_OBJ_CREATION: usize = 1 << 0;

    pub fn new(is_passthrough: bool) -> Self {
        Pd {
            asid: crate::alloc_asid(),
            mem: SpaceMem::new(SpaceKind::Host),
            gst: SpaceMem::new(SpaceKind::Guest),
            io: SpaceIo::new(),
            obj: SpaceObj::new(),
            is_passthrough,
            is_kern: false,
        }
    }

    /// The PD owning all boot resources; delegations to the root task
    /// originate here
    pub fn new_kernel() -> Self {
        Pd {
            asid: 0,
            mem: SpaceMem::new(SpaceKind::Host),
            gst: SpaceMem::new(SpaceKind::Guest),
            io: SpaceIo::new(),
            obj: SpaceObj::new(),
            is_passthrough: true,
            is_kern: true,
        }
    }

    pub fn asid(&self) -> usize {
        self.asid
    }

    pub fn is_passthrough(&self) -> bool {
        self.is_passthrough
    }

    pub fn is_kern(&self) -> bool {
        self.is_kern
    }

    pub fn mem(&self) -> &SpaceMem {
        &self.mem
    }

    pub fn gst(&self) -> &SpaceMem {
        &self.gst
    }

    pub fn io(&self) -> &SpaceIo {
        &self.io
    }

    pub fn obj(&self) -> &SpaceObj {
        &self.obj
    }

    pub(crate) fn space(&self, kind: SpaceKind) -> &spin::Mutex<crate::mdb::SpaceTree> {
        match kind {
            SpaceKind::Host => &self.mem.tree,
            SpaceKind::Guest => &self.gst.tree,
            SpaceKind::Io => &self.io.tree,
            SpaceKind::Obj => &self.obj.tree,
        }
    }

    /// Looks up a capability in this PD's object space
    pub fn lookup_cap(&self, sel: usize) -> Option<Capability> {
        self.obj.lookup(sel)
    }

    /// Returns the MDB node covering the base of `crd`, as a Crd
    pub fn lookup_crd(&self, crd: Crd) -> Crd {
        let kind = match space_kind(crd.kind()) {
            Some(kind) => kind,
            None => return Crd::null(),
        };

        let tree = self.space(kind).lock();
        match tree.lookup(crd.base()) {
            Some(id) => {
                let node = tree.node(id);
                Crd::from_raw(
                    crd.kind() as usize
                        | ((node.attr & 0x1F) << 2)
                        | ((node.order as usize & 0x1F) << 7)
                        | (node.base << 12),
                )
            },
            None => Crd::null(),
        }
    }
}

/// Maps a Crd kind onto the space it addresses
pub fn space_kind(kind: CrdKind) -> Option<SpaceKind> {
    match kind {
        CrdKind::Mem => Some(SpaceKind::Host),
        CrdKind::Io => Some(SpaceKind::Io),
        CrdKind::Obj => Some(SpaceKind::Obj),
        CrdKind::Null => None,
    }
}

struct SrcInfo {
    base: usize,
    order: u32,
    attr: usize,
    phys: usize,
    obj: Option<crate::cap::KObject>,
    id: crate::mdb::NodeId,
}

/// Delegates the naturally aligned range `[src_base, src_base + 2^order)`
/// from `src`'s subspace into `dst`'s, establishing a donor link.
///
/// The effective rights are the intersection of `attr` and the donor's
/// rights. Fails with `InvalidMapping` if the donor holds no covering
/// node, the rights intersection is empty, or the destination range is
/// occupied; with `OutOfMem` if no node could be allocated.
pub(crate) fn delegate(
    k: &Kernel,
    src: &Arc<Pd>,
    dst: &Arc<Pd>,
    kind: SpaceKind,
    src_base: usize,
    dst_base: usize,
    order: u32,
    attr: usize,
) -> Result<TlbCleanup, Error> {
    let _mdb = k.mdb_lock.lock();
    delegate_locked(k, src, dst, kind, src_base, dst_base, order, attr)
}

fn delegate_locked(
    k: &Kernel,
    src: &Arc<Pd>,
    dst: &Arc<Pd>,
    kind: SpaceKind,
    src_base: usize,
    dst_base: usize,
    order: u32,
    attr: usize,
) -> Result<TlbCleanup, Error> {
    // object-space nodes are per-selector; delegate a range one by one
    if kind == SpaceKind::Obj && order > 0 {
        for i in 0..(1usize << order) {
            delegate_one(k, src, dst, kind, src_base + i, dst_base + i, 0, attr)?;
        }
        return Ok(TlbCleanup::none());
    }

    delegate_one(k, src, dst, kind, src_base, dst_base, order, attr)
}

fn delegate_one(
    k: &Kernel,
    src: &Arc<Pd>,
    dst: &Arc<Pd>,
    kind: SpaceKind,
    src_base: usize,
    dst_base: usize,
    order: u32,
    attr: usize,
) -> Result<TlbCleanup, Error> {
    // validate the donor side
    let info = {
        let tree = src.space(kind).lock();
        let id = tree
            .lookup(src_base)
            .ok_or_else(|| Error::new(Code::InvalidMapping))?;
        let node = tree.node(id);
        if !node.range().contains(&Range::new(src_base, order)) {
            return Err(Error::new(Code::InvalidMapping));
        }
        SrcInfo {
            base: node.base,
            order: node.order,
            attr: node.attr,
            phys: node.phys,
            obj: node.obj.clone(),
            id,
        }
    };

    let eff = attr & info.attr;
    if eff == 0 {
        return Err(Error::new(Code::InvalidMapping));
    }

    if !base::math::is_aligned_by_order(dst_base, order) {
        return Err(Error::new(Code::InvalidMapping));
    }

    // install the child node in the recipient
    let child_id = {
        let mut node = MdbNode::new(
            dst_base,
            order,
            eff,
            info.phys + (src_base - info.base),
            info.obj.clone(),
        );
        node.parent = Some(NodeRef::new(Arc::downgrade(src), kind, info.id));

        let mut tree = dst.space(kind).lock();
        tree.insert(node).map_err(|_| Error::new(Code::InvalidMapping))?
    };
    let child_ref = NodeRef::new(Arc::downgrade(dst), kind, child_id);

    // link it into the donor's child list
    let old_first = {
        let mut tree = src.space(kind).lock();
        let node = tree.node_mut(info.id);
        node.child.replace(child_ref.clone())
    };
    if let Some(first) = &old_first {
        if let Some(pd) = first.pd.upgrade() {
            let mut tree = pd.space(first.kind).lock();
            tree.node_mut(first.id).prev = Some(child_ref.clone());
        }
    }
    {
        let mut tree = dst.space(kind).lock();
        tree.node_mut(child_id).next = old_first;
    }

    log!(
        LogFlags::KernMdb,
        "delegate {:?} {:#x}+2^{} from PD:{} to PD:{} at {:#x} attr={:#x}",
        kind,
        src_base,
        order,
        src.asid(),
        dst.asid(),
        dst_base,
        eff
    );

    // program the hardware side
    match kind {
        SpaceKind::Host | SpaceKind::Guest => {
            k.machine().pt_update(
                dst.asid(),
                kind,
                dst_base,
                info.phys + (src_base - info.base),
                order,
                eff,
                true,
            );
        },
        SpaceKind::Io => {
            dst.io().update(k, dst.asid(), dst_base, order, true);
        },
        SpaceKind::Obj => {
        },
    }

    // a newly established mapping cannot be cached anywhere
    Ok(TlbCleanup::none())
}

/// Transfers one typed item from `src` into `self_pd` (the receiver).
///
/// Returns the item as the receiver sees it: a translated Crd, the
/// delegated Crd, or the scalar unchanged.
pub(crate) fn xfer_item(
    k: &Kernel,
    src: &Arc<Pd>,
    dst: &Arc<Pd>,
    xlt_win: Crd,
    del_win: Crd,
    item: Xfer,
) -> Result<Xfer, Error> {
    match item.kind() {
        Some(XferKind::Scalar) => Ok(item),

        Some(XferKind::Translate) => {
            let res = translate_item(src, dst, xlt_win, item.crd);
            Ok(Xfer::new(res, XferKind::Translate, res.base()))
        },

        Some(XferKind::Delegate) => {
            let kind = space_kind(item.crd.kind()).ok_or_else(|| Error::new(Code::InvalidMapping))?;

            // without a receive window there is nowhere to delegate to
            if del_win.is_null() || del_win.kind() != item.crd.kind() {
                return Err(Error::new(Code::InvalidMapping));
            }

            let dst_base = item.hotspot_base();
            let win = Range::new(del_win.base(), del_win.order());
            if !win.contains(&Range::new(dst_base, item.crd.order())) {
                return Err(Error::new(Code::InvalidMapping));
            }

            delegate(
                k,
                src,
                dst,
                kind,
                item.crd.base(),
                dst_base,
                item.crd.order(),
                item.crd.attr(),
            )
            .map(|cleanup| {
                // portal transfers map into PDs that may already run; leave
                // invalidation to the next user entry of those CPUs
                cleanup.ignore_tlb_flush();
                Xfer::new(
                    Crd::from_raw(
                        item.crd.kind() as usize
                            | (item.crd.raw() & (0x1F << 2))
                            | ((item.crd.order() as usize) << 7)
                            | (dst_base << 12),
                    ),
                    XferKind::Delegate,
                    dst_base,
                )
            })
        },

        None => Err(Error::new(Code::InvalidMapping)),
    }
}

/// Finds the receiver's own name for the sender's mapping: a node in the
/// receiver's window whose backing matches the sender's node covering the
/// item. Returns the null Crd if there is none.
fn translate_item(src: &Arc<Pd>, dst: &Arc<Pd>, win: Crd, crd: Crd) -> Crd {
    let kind = match space_kind(crd.kind()) {
        Some(kind) => kind,
        None => return Crd::null(),
    };
    if win.is_null() || win.kind() != crd.kind() {
        return Crd::null();
    }

    // what does the sender actually hold?
    let (src_phys, src_obj) = {
        let tree = src.space(kind).lock();
        match tree.lookup(crd.base()) {
            Some(id) => {
                let node = tree.node(id);
                (node.phys + (crd.base() - node.base), node.obj.clone())
            },
            None => return Crd::null(),
        }
    };

    let mut found = Crd::null();
    let tree = dst.space(kind).lock();
    tree.for_each_in(Range::new(win.base(), win.order()), |id| {
        if !found.is_null() {
            return;
        }
        let node = tree.node(id);
        let matches = match (&node.obj, &src_obj) {
            (Some(a), Some(b)) => kobj_eq(a, b),
            (None, None) => {
                node.phys <= src_phys && src_phys < node.phys + (1 << node.order)
            },
            _ => false,
        };
        if matches {
            let base = match &node.obj {
                Some(_) => node.base,
                None => node.base + (src_phys - node.phys),
            };
            found = Crd::from_raw(
                crd.kind() as usize | ((node.attr & 0x1F) << 2) | (base << 12),
            );
        }
    });
    found
}

fn kobj_eq(a: &crate::cap::KObject, b: &crate::cap::KObject) -> bool {
    use crate::cap::KObject as K;
    match (a, b) {
        (K::Pd(x), K::Pd(y)) => Arc::ptr_eq(x, y),
        (K::Ec(x), K::Ec(y)) => Arc::ptr_eq(x, y),
        (K::Sc(x), K::Sc(y)) => Arc::ptr_eq(x, y),
        (K::Pt(x), K::Pt(y)) => Arc::ptr_eq(x, y),
        (K::Sm(x), K::Sm(y)) => Arc::ptr_eq(x, y),
        (K::Kp(x), K::Kp(y)) => Arc::ptr_eq(x, y),
        (K::Vcpu(x), K::Vcpu(y)) => Arc::ptr_eq(x, y),
        _ => false,
    }
}

/// Transfers a bounded number of typed items between the UTCBs of an IPC
/// pair. Items transferred before a failure stay in place; the error is
/// surfaced to the syscall with a distinguishing status.
pub(crate) fn xfer_items(
    k: &Kernel,
    src: &Arc<Pd>,
    dst: &Arc<Pd>,
    xlt_win: Crd,
    del_win: Crd,
    items: &[Xfer],
    out: &mut [Xfer],
) -> Result<usize, Error> {
    let mut done = 0;
    for (i, item) in items.iter().enumerate() {
        let res = xfer_item(k, src, dst, xlt_win, del_win, *item)?;
        if i < out.len() {
            out[i] = res;
        }
        done += 1;
    }
    Ok(done)
}

/// Revokes the subtree of mappings rooted at the nodes of `pd` that
/// intersect `crd`.
///
/// With `self_too`, the named nodes themselves are removed as well,
/// otherwise only everything delegated from them. Revocation is recursive
/// through donor links across PDs and subspaces; stale TLBs are shot down
/// before this returns.
pub fn rev_crd(k: &Kernel, cpu: CpuId, pd: &Arc<Pd>, crd: Crd, self_too: bool) {
    let kind = match space_kind(crd.kind()) {
        Some(kind) => kind,
        None => return,
    };

    let mut stale: u64 = 0;

    {
        let _mdb = k.mdb_lock.lock();

        // the roots named by the Crd
        let root_ids = {
            let tree = pd.space(kind).lock();
            let mut ids = Vec::new();
            tree.for_each_in(Range::new(crd.base(), crd.order()), |id| ids.push(id));
            ids
        };

        let mut worklist: Vec<NodeRef> = Vec::new();
        for id in root_ids {
            if self_too {
                // the subtree root leaves its donor's child list; all other
                // nodes die together with their donors
                unlink_from_donor(pd, kind, id);
                worklist.push(NodeRef::new(Arc::downgrade(pd), kind, id));
            }
            else {
                collect_children(pd, kind, id, &mut worklist);
                let mut tree = pd.space(kind).lock();
                tree.node_mut(id).child = None;
            }
        }

        while let Some(nref) = worklist.pop() {
            let node_pd = match nref.pd.upgrade() {
                Some(pd) => pd,
                None => continue,
            };

            collect_children(&node_pd, nref.kind, nref.id, &mut worklist);

            let node = {
                let mut tree = node_pd.space(nref.kind).lock();
                tree.remove(nref.id)
            };

            log!(
                LogFlags::KernMdb,
                "revoke {:?} {:#x}+2^{} in PD:{}",
                nref.kind,
                node.base,
                node.order,
                node_pd.asid()
            );

            match nref.kind {
                SpaceKind::Host => {
                    k.machine().pt_update(
                        node_pd.asid(),
                        nref.kind,
                        node.base,
                        node.phys,
                        node.order,
                        node.attr,
                        false,
                    );
                    let mask = node_pd.mem().cpu_mask();
                    node_pd.mem().mark_stale(mask);
                    stale |= mask;
                },
                SpaceKind::Guest => {
                    k.machine().pt_update(
                        node_pd.asid(),
                        nref.kind,
                        node.base,
                        node.phys,
                        node.order,
                        node.attr,
                        false,
                    );
                    let mask = node_pd.gst().cpu_mask();
                    node_pd.gst().mark_stale(mask);
                    stale |= mask;
                },
                SpaceKind::Io => {
                    node_pd.io().update(k, node_pd.asid(), node.base, node.order, false);
                },
                SpaceKind::Obj => {
                    // the object may be in use on another CPU; defer the
                    // potential final drop past the next grace period
                    if let Some(obj) = node.obj {
                        k.rcu.defer(cpu, obj);
                    }
                },
            }
        }
    }

    let mut cleanup = TlbCleanup::none();
    cleanup.add_cpus(stale);
    cleanup.flush(k, cpu);
}

/// Pushes all direct donees of (pd, kind, id) onto the worklist
fn collect_children(pd: &Arc<Pd>, kind: SpaceKind, id: crate::mdb::NodeId, out: &mut Vec<NodeRef>) {
    let mut cur = {
        let tree = pd.space(kind).lock();
        tree.node(id).child.clone()
    };

    while let Some(nref) = cur {
        let next = match nref.pd.upgrade() {
            Some(cpd) => {
                let tree = cpd.space(nref.kind).lock();
                tree.node(nref.id).next.clone()
            },
            None => None,
        };
        out.push(nref);
        cur = next;
    }
}

/// Removes (pd, kind, id) from its donor's child list
fn unlink_from_donor(pd: &Arc<Pd>, kind: SpaceKind, id: crate::mdb::NodeId) {
    let (parent, prev, next) = {
        let tree = pd.space(kind).lock();
        let node = tree.node(id);
        (node.parent.clone(), node.prev.clone(), node.next.clone())
    };

    if let Some(next) = &next {
        if let Some(npd) = next.pd.upgrade() {
            let mut tree = npd.space(next.kind).lock();
            tree.node_mut(next.id).prev = prev.clone();
        }
    }

    match &prev {
        Some(prev) => {
            if let Some(ppd) = prev.pd.upgrade() {
                let mut tree = ppd.space(prev.kind).lock();
                tree.node_mut(prev.id).next = next;
            }
        },
        None => {
            // head of the child list
            if let Some(parent) = &parent {
                if let Some(ppd) = parent.pd.upgrade() {
                    let mut tree = ppd.space(parent.kind).lock();
                    let pnode = tree.node_mut(parent.id);
                    // only detach if we are still the head; a revocation
                    // may have consumed the list already
                    if let Some(c) = &pnode.child {
                        if c.id == id && Weak::ptr_eq(&c.pd, &Arc::downgrade(pd)) {
                            pnode.child = next;
                        }
                    }
                }
            }
        },
    }
}

#[cfg(test)]
mod pd_test;
