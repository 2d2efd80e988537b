// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::node::Node;
use super::{TreeMeta, MAX_HEIGHT};
use crate::query::Query;
use crate::store::Store;
use crate::Error;
use std::cmp::Ordering;
use std::sync::Arc;

/// Cursor over one immutable tree.
///
/// Holds the node on the path from the root to the current leaf for every
/// level, plus the slot position inside each of them. Node loads go
/// through the store's verifying read (and its cache), so a bit flip
/// surfaces as [`Error::ChecksumMismatch`] instead of a wrong result.
pub struct TreeIter<'a> {
    store: &'a Store,
    meta: TreeMeta,
    nodes: [Option<Arc<Node>>; MAX_HEIGHT],
    pos: [usize; MAX_HEIGHT],
}

impl<'a> TreeIter<'a> {
    #[must_use]
    pub fn new(store: &'a Store, meta: TreeMeta) -> Self {
        Self {
            store,
            meta,
            nodes: std::array::from_fn(|_| None),
            pos: [0; MAX_HEIGHT],
        }
    }

    #[must_use]
    pub fn meta(&self) -> &TreeMeta {
        &self.meta
    }

    /// Whether the cursor points at an entry.
    #[must_use]
    pub fn valid(&self) -> bool {
        self.nodes[0]
            .as_ref()
            .is_some_and(|leaf| self.pos[0] < leaf.len())
    }

    /// Current key; the cursor must be valid.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        #[allow(clippy::expect_used)]
        let leaf = self.nodes[0].as_ref().expect("cursor is valid");
        leaf.key(self.pos[0])
    }

    /// Current value; the cursor must be valid.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        #[allow(clippy::expect_used)]
        let leaf = self.nodes[0].as_ref().expect("cursor is valid");
        leaf.value(self.pos[0])
    }

    /// Positions the cursor at the first entry that does not sort before
    /// the queried range.
    ///
    /// Interior levels pick the lower bound of `cmp >= 0` clipped to the
    /// last child; each node stores as separator the largest key of the
    /// child it points to, so the clip only triggers past the right edge
    /// of the tree.
    pub fn find(&mut self, cmp: &dyn Fn(&[u8]) -> Ordering) -> crate::Result<()> {
        let height = self.meta.height as usize;
        if height == 0 {
            return Ok(());
        }

        let mut ptr = self.meta.root;
        for lvl in (1..height).rev() {
            let node = self.store.read_node(&ptr)?;
            if node.is_empty() {
                return Err(Error::Corruption("empty interior ctree node"));
            }

            let pos = node.lower_bound(cmp).min(node.len() - 1);
            ptr = node.child(pos)?;
            self.pos[lvl] = pos;
            self.nodes[lvl] = Some(node);
        }

        let leaf = self.store.read_node(&ptr)?;
        self.pos[0] = leaf.lower_bound(cmp);
        self.nodes[0] = Some(leaf);
        Ok(())
    }

    /// Positions the cursor at the smallest key of the tree.
    pub fn reset(&mut self) -> crate::Result<()> {
        self.find(&|_| Ordering::Greater)
    }

    /// Steps to the next entry; past the last entry the cursor simply
    /// turns invalid.
    pub fn next(&mut self) -> crate::Result<()> {
        if !self.valid() {
            return Ok(());
        }

        self.pos[0] += 1;
        #[allow(clippy::expect_used)]
        if self.pos[0] < self.nodes[0].as_ref().expect("cursor was valid").len() {
            return Ok(());
        }

        let height = self.meta.height as usize;

        // Lowest ancestor that still has a sibling to the right.
        let mut top = 0;
        for lvl in 1..height {
            let node = self.nodes[lvl].as_ref();
            if node.is_some_and(|n| self.pos[lvl] + 1 < n.len()) {
                top = lvl;
                break;
            }
        }
        if top == 0 {
            return Ok(());
        }

        for lvl in 0..top {
            self.nodes[lvl] = None;
            self.pos[lvl] = 0;
        }
        self.pos[top] += 1;

        for lvl in (1..=top).rev() {
            #[allow(clippy::expect_used)]
            let parent = self.nodes[lvl].as_ref().expect("path node present");
            let ptr = parent.child(self.pos[lvl])?;
            self.nodes[lvl - 1] = Some(self.store.read_node(&ptr)?);
        }
        Ok(())
    }
}

/// Single-point lookup; returns whether `query.emit` ran.
pub fn lookup(store: &Store, meta: TreeMeta, query: &mut dyn Query) -> crate::Result<bool> {
    let mut it = TreeIter::new(store, meta);
    it.find(&|key| query.cmp(key))?;

    if !it.valid() || query.cmp(it.key()) != Ordering::Equal {
        return Ok(false);
    }

    query.emit(it.key(), it.value())?;
    Ok(true)
}

/// Emits every entry inside the query's range, in ascending key order.
pub fn range(store: &Store, meta: TreeMeta, query: &mut dyn Query) -> crate::Result<()> {
    let mut it = TreeIter::new(store, meta);
    it.find(&|key| query.cmp(key))?;

    while it.valid() {
        if query.cmp(it.key()) != Ordering::Equal {
            break;
        }
        query.emit(it.key(), it.value())?;
        it.next()?;
    }
    Ok(())
}
