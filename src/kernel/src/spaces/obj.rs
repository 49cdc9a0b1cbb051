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

use base::errors::Error;
use base::hif::CapSel;

use crate::cap::{Capability, KObject};
use crate::mdb::{MdbNode, SpaceTree};

/// The object subspace: capabilities keyed by selector.
///
/// Object-space nodes always have order 0; delegating a selector range
/// creates one node per selector so that each capability keeps its own
/// donor link.
pub struct SpaceObj {
    pub(crate) tree: spin::Mutex<SpaceTree>,
}

impl SpaceObj {
    pub fn new() -> Self {
        SpaceObj {
            tree: spin::Mutex::new(SpaceTree::default()),
        }
    }

    /// Returns the capability stored at `sel`
    pub fn lookup(&self, sel: CapSel) -> Option<Capability> {
        let tree = self.tree.lock();
        let id = tree.lookup(sel)?;
        let node = tree.node(id);
        node.obj
            .as_ref()
            .map(|obj| Capability::new(obj.clone(), node.attr))
    }

    /// Installs a capability for a freshly created object at `sel`.
    ///
    /// The new node has no donor; it is the root of the object's delegation
    /// tree. Fails if the selector is occupied.
    pub fn insert_root(&self, sel: CapSel, obj: KObject, perms: usize) -> Result<(), Error> {
        let mut tree = self.tree.lock();
        tree.insert(MdbNode::new(sel, 0, perms, 0, Some(obj)))?;
        Ok(())
    }
}

impl Default for SpaceObj {
    fn default() -> Self {
        Self::new()
    }
}
