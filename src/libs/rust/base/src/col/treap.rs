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

use core::cmp::Ordering;
use core::fmt;
use core::num::Wrapping;

use alloc::boxed::Box;

struct Node<K, V> {
    left: Option<Box<Node<K, V>>>,
    right: Option<Box<Node<K, V>>>,
    prio: Wrapping<u32>,
    key: K,
    value: V,
}

/// A balanced binary search tree.
///
/// A treap combines a binary search tree (ordered by key) with a heap
/// (ordered by a per-node priority). Priorities are derived by fibonacci
/// hashing from an insertion counter, which keeps the tree balanced with
/// high probability without storing balance metadata.
///
/// Note that the key type decides what "equal" means: range keys (as used
/// by capability tables and the mapping database) compare equal to every
/// probe that falls into their range.
pub struct Treap<K: Ord, V> {
    root: Option<Box<Node<K, V>>>,
    prio: Wrapping<u32>,
}

impl<K: Ord, V> Default for Treap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord, V> Treap<K, V> {
    /// Creates an empty treap
    pub const fn new() -> Self {
        Treap {
            root: None,
            prio: Wrapping(0),
        }
    }

    /// Returns true if the treap has no elements
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Removes all elements from the treap
    pub fn clear(&mut self) {
        self.root = None;
        self.prio = Wrapping(0);
    }

    /// Returns a reference to the value whose key compares equal to `key`
    pub fn get(&self, key: &K) -> Option<&V> {
        let mut node = &self.root;
        while let Some(n) = node {
            match key.cmp(&n.key) {
                Ordering::Less => node = &n.left,
                Ordering::Greater => node = &n.right,
                Ordering::Equal => return Some(&n.value),
            }
        }
        None
    }

    /// Returns a mutable reference to the value whose key compares equal to
    /// `key`
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let mut node = &mut self.root;
        while let Some(n) = node {
            match key.cmp(&n.key) {
                Ordering::Less => node = &mut n.left,
                Ordering::Greater => node = &mut n.right,
                Ordering::Equal => return Some(&mut n.value),
            }
        }
        None
    }

    /// Returns the value for `key`, or the value with the smallest key
    /// greater than `key` if there is no equal one
    pub fn get_or_next(&self, key: &K) -> Option<(&K, &V)> {
        let mut best: Option<(&K, &V)> = None;
        let mut node = &self.root;
        while let Some(n) = node {
            match key.cmp(&n.key) {
                Ordering::Less => {
                    best = Some((&n.key, &n.value));
                    node = &n.left;
                },
                Ordering::Greater => node = &n.right,
                Ordering::Equal => return Some((&n.key, &n.value)),
            }
        }
        best
    }

    /// Returns the key of the root node, if any
    pub fn root_key(&self) -> Option<&K> {
        self.root.as_ref().map(|n| &n.key)
    }

    /// Inserts the given value for given key, assuming that no equal key
    /// exists in the tree
    pub fn insert(&mut self, key: K, value: V) {
        self.prio += Wrapping(0x9E37_79B9);
        let prio = self.prio;
        let root = self.root.take();
        self.root = Some(Self::do_insert(root, key, value, prio));
    }

    fn do_insert(
        node: Option<Box<Node<K, V>>>,
        key: K,
        value: V,
        prio: Wrapping<u32>,
    ) -> Box<Node<K, V>> {
        match node {
            None => Box::new(Node {
                left: None,
                right: None,
                prio,
                key,
                value,
            }),
            Some(mut n) => {
                if key < n.key {
                    let child = Self::do_insert(n.left.take(), key, value, prio);
                    // rotate right if the heap order is violated
                    if child.prio < n.prio {
                        let mut child = child;
                        n.left = child.right.take();
                        child.right = Some(n);
                        child
                    }
                    else {
                        n.left = Some(child);
                        n
                    }
                }
                else {
                    let child = Self::do_insert(n.right.take(), key, value, prio);
                    if child.prio < n.prio {
                        let mut child = child;
                        n.right = child.left.take();
                        child.left = Some(n);
                        child
                    }
                    else {
                        n.right = Some(child);
                        n
                    }
                }
            },
        }
    }

    /// Removes the value whose key compares equal to `key` and returns it
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let root = self.root.take();
        let (root, removed) = Self::do_remove(root, key);
        self.root = root;
        removed
    }

    fn do_remove(
        node: Option<Box<Node<K, V>>>,
        key: &K,
    ) -> (Option<Box<Node<K, V>>>, Option<V>) {
        match node {
            None => (None, None),
            Some(mut n) => match key.cmp(&n.key) {
                Ordering::Less => {
                    let (left, removed) = Self::do_remove(n.left.take(), key);
                    n.left = left;
                    (Some(n), removed)
                },
                Ordering::Greater => {
                    let (right, removed) = Self::do_remove(n.right.take(), key);
                    n.right = right;
                    (Some(n), removed)
                },
                Ordering::Equal => {
                    let merged = Self::merge(n.left.take(), n.right.take());
                    (merged, Some(n.value))
                },
            },
        }
    }

    fn merge(
        left: Option<Box<Node<K, V>>>,
        right: Option<Box<Node<K, V>>>,
    ) -> Option<Box<Node<K, V>>> {
        match (left, right) {
            (None, r) => r,
            (l, None) => l,
            (Some(mut l), Some(mut r)) => {
                if l.prio < r.prio {
                    l.right = Self::merge(l.right.take(), Some(r));
                    Some(l)
                }
                else {
                    r.left = Self::merge(Some(l), r.left.take());
                    Some(r)
                }
            },
        }
    }

    /// Calls `f` for every (key, value) pair in ascending key order
    pub fn for_each<F: FnMut(&K, &V)>(&self, mut f: F) {
        Self::do_for_each(&self.root, &mut f);
    }

    fn do_for_each<F: FnMut(&K, &V)>(node: &Option<Box<Node<K, V>>>, f: &mut F) {
        if let Some(n) = node {
            Self::do_for_each(&n.left, f);
            f(&n.key, &n.value);
            Self::do_for_each(&n.right, f);
        }
    }
}

#[cfg(test)]
mod treap_test;

impl<K: Ord + fmt::Debug, V: fmt::Debug> fmt::Debug for Treap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Treap[")?;
        let mut first = true;
        Self::do_for_each(&self.root, &mut |k: &K, v: &V| {
            if !first {
                let _ = write!(f, ", ");
            }
            first = false;
            let _ = write!(f, "{:?}={:?}", k, v);
        });
        write!(f, "]")
    }
}
