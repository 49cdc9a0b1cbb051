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

//! Capabilities and kernel objects

mod kobjs;

pub use self::kobjs::{Kp, Pt, Sm, Vcpu};

use core::fmt;

use base::rc::Arc;

use crate::ec::Ec;
use crate::pd::Pd;
use crate::sched::Sc;

/// A reference to one of the seven kernel object types
#[derive(Clone)]
pub enum KObject {
    Pd(Arc<Pd>),
    Ec(Arc<Ec>),
    Sc(Arc<Sc>),
    Pt(Arc<Pt>),
    Sm(Arc<Sm>),
    Kp(Arc<Kp>),
    Vcpu(Arc<Vcpu>),
}

impl fmt::Debug for KObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KObject::Pd(_) => write!(f, "Pd"),
            KObject::Ec(_) => write!(f, "Ec"),
            KObject::Sc(_) => write!(f, "Sc"),
            KObject::Pt(_) => write!(f, "Pt"),
            KObject::Sm(_) => write!(f, "Sm"),
            KObject::Kp(_) => write!(f, "Kp"),
            KObject::Vcpu(_) => write!(f, "Vcpu"),
        }
    }
}

/// A capability: a typed object reference plus a permission mask, as stored
/// in an object-space MDB node
#[derive(Clone, Debug)]
pub struct Capability {
    obj: KObject,
    perms: usize,
}

impl Capability {
    pub fn new(obj: KObject, perms: usize) -> Self {
        Capability { obj, perms }
    }

    pub fn object(&self) -> &KObject {
        &self.obj
    }

    pub fn perms(&self) -> usize {
        self.perms
    }

    fn covers(&self, need: usize) -> bool {
        self.perms & need == need
    }

    /// The typed downcasts: each yields the object iff the type tag matches
    /// and the permission bits cover `need`

    pub fn to_pd(&self, need: usize) -> Option<Arc<Pd>> {
        match &self.obj {
            KObject::Pd(pd) if self.covers(need) => Some(pd.clone()),
            _ => None,
        }
    }

    pub fn to_ec(&self, need: usize) -> Option<Arc<Ec>> {
        match &self.obj {
            KObject::Ec(ec) if self.covers(need) => Some(ec.clone()),
            _ => None,
        }
    }

    pub fn to_sc(&self, need: usize) -> Option<Arc<Sc>> {
        match &self.obj {
            KObject::Sc(sc) if self.covers(need) => Some(sc.clone()),
            _ => None,
        }
    }

    pub fn to_pt(&self, need: usize) -> Option<Arc<Pt>> {
        match &self.obj {
            KObject::Pt(pt) if self.covers(need) => Some(pt.clone()),
            _ => None,
        }
    }

    pub fn to_sm(&self, need: usize) -> Option<Arc<Sm>> {
        match &self.obj {
            KObject::Sm(sm) if self.covers(need) => Some(sm.clone()),
            _ => None,
        }
    }

    pub fn to_kp(&self, need: usize) -> Option<Arc<Kp>> {
        match &self.obj {
            KObject::Kp(kp) if self.covers(need) => Some(kp.clone()),
            _ => None,
        }
    }

    pub fn to_vcpu(&self, need: usize) -> Option<Arc<Vcpu>> {
        match &self.obj {
            KObject::Vcpu(v) if self.covers(need) => Some(v.clone()),
            _ => None,
        }
    }
}

/// All permission bits set
pub const PERM_ALL: usize = 0x1F;
