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

//! The mapping database
//!
//! Each subspace of a PD owns one [`SpaceTree`]: an arena of nodes plus a
//! range-keyed treap over them. A node describes one naturally aligned
//! power-of-two region and remembers where it was delegated from (the donor
//! link) and to (the child list). Donor links cross PDs and subspace
//! instances, so they are (PD, kind, id) triples rather than arena indices.
//!
//! Lock order: the kernel-wide `mdb_lock` serializes all donor-link surgery
//! and is taken before any space lock; lookup-only paths take just the
//! space lock.

use core::cmp::Ordering;
use core::fmt;

use alloc::vec::Vec;

use base::errors::{Code, Error};
use base::math;
use base::rc::Weak;

use crate::cap::KObject;
use crate::pd::Pd;

pub type NodeId = u32;

/// The four subspaces of a PD
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SpaceKind {
    Host,
    Guest,
    Io,
    Obj,
}

/// Names a node in some PD's subspace
#[derive(Clone)]
pub struct NodeRef {
    pub pd: Weak<Pd>,
    pub kind: SpaceKind,
    pub id: NodeId,
}

impl NodeRef {
    pub fn new(pd: Weak<Pd>, kind: SpaceKind, id: NodeId) -> Self {
        NodeRef { pd, kind, id }
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeRef[{:?}:{}]", self.kind, self.id)
    }
}

/// One entry of the mapping database
pub struct MdbNode {
    /// start of the region, in space units (page frames, ports, selectors)
    pub base: usize,
    /// the region spans `2^order` units
    pub order: u32,
    /// rights of this mapping; children never exceed their donor's rights
    pub attr: usize,
    /// backing resource (physical frame for memory, unused otherwise)
    pub phys: usize,
    /// the named object for object-space nodes
    pub obj: Option<KObject>,
    /// donor link
    pub parent: Option<NodeRef>,
    /// first donee
    pub child: Option<NodeRef>,
    /// donee-list sibling links
    pub next: Option<NodeRef>,
    pub prev: Option<NodeRef>,
}

impl MdbNode {
    pub fn new(base: usize, order: u32, attr: usize, phys: usize, obj: Option<KObject>) -> Self {
        MdbNode {
            base,
            order,
            attr,
            phys,
            obj,
            parent: None,
            child: None,
            next: None,
            prev: None,
        }
    }

    pub fn range(&self) -> Range {
        Range {
            base: self.base,
            order: self.order,
        }
    }
}

/// A power-of-two range used as treap key.
///
/// Two ranges compare equal iff they overlap; since all ranges are
/// naturally aligned, overlapping means one contains the other. A probe
/// of order 0 therefore finds the node covering a single unit.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Range {
    pub base: usize,
    pub order: u32,
}

impl Range {
    pub fn new(base: usize, order: u32) -> Self {
        Range { base, order }
    }

    pub fn unit(base: usize) -> Self {
        Range { base, order: 0 }
    }

    pub fn size(&self) -> usize {
        1 << self.order
    }

    pub fn end(&self) -> usize {
        self.base + self.size()
    }

    pub fn contains(&self, other: &Range) -> bool {
        self.base <= other.base && other.end() <= self.end()
    }
}

impl PartialOrd for Range {
    fn partial_cmp(&self, other: &Range) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Range {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.base < other.base && self.end() <= other.base {
            Ordering::Less
        }
        else if self.base >= other.end() {
            Ordering::Greater
        }
        else {
            Ordering::Equal
        }
    }
}

impl fmt::Debug for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}+2^{}", self.base, self.order)
    }
}

/// The per-subspace mapping database: node arena plus range tree
#[derive(Default)]
pub struct SpaceTree {
    arena: Vec<Option<MdbNode>>,
    free: Vec<NodeId>,
    tree: base::col::Treap<Range, NodeId>,
}

impl SpaceTree {
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &MdbNode {
        self.arena[id as usize].as_ref().unwrap()
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut MdbNode {
        self.arena[id as usize].as_mut().unwrap()
    }

    /// Returns the node covering `idx`
    pub fn lookup(&self, idx: usize) -> Option<NodeId> {
        self.tree.get(&Range::unit(idx)).copied()
    }

    /// Returns the node covering `idx`, or the next node above it
    pub fn lookup_next(&self, idx: usize) -> Option<NodeId> {
        self.tree.get_or_next(&Range::unit(idx)).map(|(_, id)| *id)
    }

    /// Places `node` into the arena and the range tree.
    ///
    /// Fails with `Exists` if the range overlaps an existing node; for a
    /// given space, any unit is covered by at most one node.
    pub fn insert(&mut self, node: MdbNode) -> Result<NodeId, Error> {
        let range = node.range();
        if self.tree.get(&range).is_some() {
            return Err(Error::new(Code::Exists));
        }

        let id = match self.free.pop() {
            Some(id) => {
                self.arena[id as usize] = Some(node);
                id
            },
            None => {
                self.arena.push(Some(node));
                (self.arena.len() - 1) as NodeId
            },
        };
        self.tree.insert(range, id);
        Ok(id)
    }

    /// Detaches the node from the tree and returns it.
    ///
    /// Donor links of the removed node are left to the caller; the child
    /// list must already be empty or reassigned.
    pub fn remove(&mut self, id: NodeId) -> MdbNode {
        let node = self.arena[id as usize].take().unwrap();
        let removed = self.tree.remove(&node.range());
        debug_assert_eq!(removed, Some(id));
        self.free.push(id);
        node
    }

    /// Decomposes `[addr, addr + size)` into naturally aligned power-of-two
    /// sub-ranges (greedy, largest order first) and inserts one root node
    /// per sub-range. `phys` advances along with `addr`.
    pub fn addreg(&mut self, addr: usize, size: usize, attr: usize, phys: usize) {
        let (mut addr, mut size, mut phys) = (addr, size, phys);
        while size > 0 {
            let o = math::max_order(addr, size);
            // overlapping boot regions are benign; keep the first owner
            self.insert(MdbNode::new(addr, o, attr, phys, None)).ok();
            addr += 1 << o;
            phys += 1 << o;
            size -= 1 << o;
        }
    }

    /// Removes the node containing `addr` and re-adds the flanking
    /// sub-ranges of its covered region
    pub fn delreg(&mut self, addr: usize) -> bool {
        let id = match self.lookup(addr) {
            Some(id) => id,
            None => return false,
        };
        let node = self.remove(id);

        let base = node.base;
        let last = base + (1usize << node.order);
        self.addreg(base, addr - base, node.attr, node.phys);
        self.addreg(addr + 1, last - (addr + 1), node.attr, node.phys + (addr + 1 - base));
        true
    }

    /// Calls `f` for every node whose range intersects `range`
    pub fn for_each_in<F: FnMut(NodeId)>(&self, range: Range, mut f: F) {
        let mut idx = range.base;
        while idx < range.end() {
            match self.tree.get_or_next(&Range::unit(idx)) {
                Some((r, id)) if r.base < range.end() => {
                    f(*id);
                    idx = r.end().max(idx + 1);
                },
                _ => break,
            }
        }
    }
}

#[cfg(test)]
mod mdb_test;
