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

use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::boxed::Box;

use base::cfg;
use base::col::VecDeque;
use base::hif::Mtd;
use base::io::LogFlags;
use base::log;
use base::mem::VirtAddr;
use base::rc::{Arc, Weak};

use crate::cpu::CpuId;
use crate::ec::Ec;
use crate::pd::Pd;
use crate::sched;
use crate::Kernel;

/// A portal: binds a local server EC, an entry instruction pointer and a
/// message transfer descriptor. Calls through the portal transfer control
/// to the server EC on the caller's time.
pub struct Pt {
    ec: Arc<Ec>,
    ip: VirtAddr,
    mtd: Mtd,
    id: AtomicUsize,
}

impl Pt {
    pub const PERM_CTRL: usize = 1 << 0;
    pub const PERM_CALL: usize = 1 << 1;

    pub fn new(ec: Arc<Ec>, ip: VirtAddr, mtd: Mtd) -> Self {
        Pt {
            ec,
            ip,
            mtd,
            id: AtomicUsize::new(0),
        }
    }

    pub fn ec(&self) -> &Arc<Ec> {
        &self.ec
    }

    pub fn ip(&self) -> VirtAddr {
        self.ip
    }

    pub fn mtd(&self) -> Mtd {
        self.mtd
    }

    pub fn id(&self) -> usize {
        self.id.load(Ordering::Acquire)
    }

    /// Sets the id the server sees on invocation
    pub fn set_id(&self, id: usize) {
        self.id.store(id, Ordering::Release);
    }
}

struct SmInner {
    counter: u64,
    waiters: VecDeque<Weak<Ec>>,
}

/// A counting semaphore with an ordered waiter list
pub struct Sm {
    inner: spin::Mutex<SmInner>,
}

impl Sm {
    pub const PERM_UP: usize = 1 << 0;
    pub const PERM_DOWN: usize = 1 << 1;

    pub fn new(counter: u64) -> Self {
        Sm {
            inner: spin::Mutex::new(SmInner {
                counter,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn counter(&self) -> u64 {
        self.inner.lock().counter
    }

    /// Wakes the first waiter, or increments the count if nobody waits
    pub fn up(&self, k: &Kernel) {
        let woken = {
            let mut inner = self.inner.lock();
            loop {
                match inner.waiters.pop_front() {
                    Some(w) => {
                        if let Some(ec) = w.upgrade() {
                            break Some(ec);
                        }
                        // skip waiters that died while queued
                    },
                    None => {
                        inner.counter += 1;
                        break None;
                    },
                }
            }
        };

        if let Some(ec) = woken {
            ec.unblock(k);
        }
    }

    /// Takes one count or blocks the current EC.
    ///
    /// `zc` leaves the count untouched on an immediately successful down.
    /// A non-zero `timeout` is an absolute TSC deadline; on expiry the
    /// waiter is woken with [`Code::ComTim`].
    ///
    /// The caller's continuation must already be set to what should run
    /// when the down completes.
    pub fn dn(self: &Arc<Self>, k: &Kernel, cpu: CpuId, zc: bool, timeout: u64) {
        let ec = k.cpu(cpu).current();

        {
            let mut inner = self.inner.lock();
            if inner.counter > 0 {
                if !zc {
                    inner.counter -= 1;
                }
                return;
            }

            ec.set_blocked_on(Arc::downgrade(self));
            inner.waiters.push_back(Arc::downgrade(&ec));
        }

        if timeout != 0 {
            crate::timeout::enqueue(k, cpu, timeout, &ec);
        }

        // park the SC that carried us here; it is released on wakeup
        ec.park_sc(k.cpu(cpu).current_sc());
        sched::schedule(k, cpu, true);
    }

    /// The reply-and-wait variant: downs the semaphore on behalf of `ec`
    /// (the caller being replied to). Returns false if `ec` was blocked.
    pub(crate) fn dn_for(self: &Arc<Self>, _k: &Kernel, ec: &Arc<Ec>) -> bool {
        let mut inner = self.inner.lock();
        if inner.counter > 0 {
            inner.counter -= 1;
            return true;
        }

        ec.set_blocked_on(Arc::downgrade(self));
        inner.waiters.push_back(Arc::downgrade(ec));
        false
    }

    /// Removes a waiter that is being woken by timeout or destruction;
    /// returns true if it was still queued
    pub(crate) fn cancel(&self, ec: &Arc<Ec>) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.waiters.len();
        inner.waiters.retain(|w| match w.upgrade() {
            Some(e) => !Arc::ptr_eq(&e, ec),
            None => false,
        });
        inner.waiters.len() != before
    }
}

/// The backing page of a [`Kp`]
#[repr(C, align(4096))]
pub struct KpPage(pub [u8; cfg::PAGE_SIZE]);

impl Default for KpPage {
    fn default() -> Self {
        KpPage([0; cfg::PAGE_SIZE])
    }
}

/// A kernel page: kernel-owned memory that can be mapped into at most one
/// user PD at a time. Used for FPU save areas and user-visible counters.
///
/// The page content is written by hardware (XSAVE) and read by user space
/// concurrently, so it is deliberately untyped memory behind an
/// `UnsafeCell`.
pub struct Kp {
    page: Box<core::cell::UnsafeCell<KpPage>>,
    user_map: spin::Mutex<Option<(Weak<Pd>, usize)>>,
}

unsafe impl Sync for Kp {
}
unsafe impl Send for Kp {
}

impl Kp {
    pub const PERM_CTRL: usize = 1 << 0;

    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Kp {
            page: Box::new(core::cell::UnsafeCell::new(KpPage::default())),
            user_map: spin::Mutex::new(None),
        }
    }

    pub(crate) fn page_ptr(&self) -> *mut u8 {
        self.page.get() as *mut u8
    }

    /// Atomically sets bit `bit` in the page; interrupt delivery uses this
    /// to signal which vector fired
    pub fn set_bit(&self, bit: usize) {
        if bit >= cfg::PAGE_SIZE * 8 {
            return;
        }
        let word = unsafe {
            &*(self.page_ptr().add((bit / 64) * 8) as *const core::sync::atomic::AtomicU64)
        };
        word.fetch_or(1 << (bit % 64), Ordering::AcqRel);
    }

    /// Maps the page into `pd` at page frame `frame`; a KP can be mapped
    /// into at most one PD at a time
    pub fn add_user_mapping(&self, k: &Kernel, pd: &Arc<Pd>, frame: usize) -> bool {
        let mut map = self.user_map.lock();
        if map.is_some() {
            return false;
        }

        let phys = k.machine().phys_of(self.page_ptr());
        let cleanup = pd.mem().insert(
            k,
            pd.asid(),
            frame,
            phys >> cfg::PAGE_BITS,
            0,
            base::hif::MemAttr::R | base::hif::MemAttr::W,
        );
        // a fresh mapping cannot be stale anywhere
        cleanup.ignore_tlb_flush();

        *map = Some((Arc::downgrade(pd), frame));
        true
    }

    /// Removes the user mapping, shooting down TLBs that may cache it
    pub fn remove_user_mapping(&self, k: &Kernel, cpu: CpuId) -> bool {
        let taken = self.user_map.lock().take();
        match taken {
            Some((pd, frame)) => {
                if let Some(pd) = pd.upgrade() {
                    let cleanup = pd.mem().remove(k, pd.asid(), frame);
                    cleanup.flush(k, cpu);
                }
                true
            },
            None => {
                log!(LogFlags::Debug, "KP unmap without mapping");
                false
            },
        }
    }
}

/// A virtual CPU: an EC in guest mode backed by a hardware VMCS. VM exits
/// are delivered through the vcpu's event portals with the exit reason as
/// portal index, and return to the guest via vmresume.
pub struct Vcpu {
    ec: Arc<Ec>,
    vmcs: usize,
}

impl Vcpu {
    pub const PERM_CTRL: usize = 1 << 0;

    pub fn new(ec: Arc<Ec>, vmcs: usize) -> Self {
        Vcpu { ec, vmcs }
    }

    pub fn ec(&self) -> &Arc<Ec> {
        &self.ec
    }

    pub fn vmcs(&self) -> usize {
        self.vmcs
    }
}

#[cfg(test)]
mod sm_test;
