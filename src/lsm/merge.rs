// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::ctree::TreeIter;
use crate::query::{KeyCmpFn, Query};
use interval_heap::IntervalHeap;
use std::cmp::Ordering;

/// A flat, owned buffer of key/value pairs in emit order.
///
/// Memtable contents are materialized into one of these before a merge,
/// so the merge never holds memtable locks while it does disk I/O.
#[derive(Default)]
pub(crate) struct ItemSet {
    buf: Vec<u8>,
    index: Vec<(usize, usize, usize)>,
}

impl ItemSet {
    pub fn push(&mut self, key: &[u8], value: &[u8]) {
        self.index.push((self.buf.len(), key.len(), value.len()));
        self.buf.extend_from_slice(key);
        self.buf.extend_from_slice(value);
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn get(&self, i: usize) -> (&[u8], &[u8]) {
        let (offs, klen, vlen) = self.index[i];
        (
            &self.buf[offs..offs + klen],
            &self.buf[offs + klen..offs + klen + vlen],
        )
    }
}

/// Collects emits into an [`ItemSet`], optionally filtered by the range
/// of an outer query.
pub(crate) struct Collect<'a> {
    bound: Option<&'a dyn Query>,
    pub set: ItemSet,
}

impl<'a> Collect<'a> {
    pub fn all() -> Self {
        Self {
            bound: None,
            set: ItemSet::default(),
        }
    }

    pub fn bounded(bound: &'a dyn Query) -> Self {
        Self {
            bound: Some(bound),
            set: ItemSet::default(),
        }
    }
}

impl Query for Collect<'_> {
    fn cmp(&self, key: &[u8]) -> Ordering {
        self.bound.map_or(Ordering::Equal, |b| b.cmp(key))
    }

    fn emit(&mut self, key: &[u8], value: &[u8]) -> crate::Result<()> {
        self.set.push(key, value);
        Ok(())
    }
}

/// One input of a k-way merge: either materialized memtable items or a
/// positioned ctree iterator.
pub(crate) enum MergeSource<'a> {
    Items { set: ItemSet, pos: usize },
    Tree(TreeIter<'a>),
}

impl<'a> MergeSource<'a> {
    pub fn items(set: ItemSet) -> Self {
        Self::Items { set, pos: 0 }
    }
}

struct HeapItem {
    cmp: KeyCmpFn,
    index: usize,
    key: Vec<u8>,
    value: Vec<u8>,
}

impl Eq for HeapItem {}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.cmp)(&self.key, &other.key).then(self.index.cmp(&other.index))
    }
}

/// Merges up to `MAX_TIERS + 2` sorted sources, newest first.
///
/// Sources are indexed in age order (c0, then c1, then tier 0 and down),
/// and the heap breaks key ties by that index — so popping the minimum
/// always yields the newest version of the smallest key, and every older
/// duplicate that follows is advanced past without being emitted.
pub(crate) struct MergeStream<'a> {
    cmp: KeyCmpFn,
    sources: Vec<MergeSource<'a>>,
    heap: IntervalHeap<HeapItem>,
    initialized: bool,
}

impl<'a> MergeStream<'a> {
    pub fn new(cmp: KeyCmpFn, sources: Vec<MergeSource<'a>>) -> Self {
        let heap = IntervalHeap::with_capacity(sources.len());
        Self {
            cmp,
            sources,
            heap,
            initialized: false,
        }
    }

    /// Pushes the source's current entry (if inside `bound`) and steps
    /// the source forward.
    fn refill(
        &mut self,
        index: usize,
        bound: &dyn Fn(&[u8]) -> Ordering,
    ) -> crate::Result<()> {
        let Self {
            cmp,
            sources,
            heap,
            ..
        } = self;
        let cmp = *cmp;

        match &mut sources[index] {
            MergeSource::Items { set, pos } => {
                if *pos < set.len() {
                    let (key, value) = set.get(*pos);
                    *pos += 1;
                    heap.push(HeapItem {
                        cmp,
                        index,
                        key: key.to_vec(),
                        value: value.to_vec(),
                    });
                }
            }
            MergeSource::Tree(it) => {
                if it.valid() && bound(it.key()) == Ordering::Equal {
                    heap.push(HeapItem {
                        cmp,
                        index,
                        key: it.key().to_vec(),
                        value: it.value().to_vec(),
                    });
                    it.next()?;
                }
            }
        }
        Ok(())
    }

    /// Pops the next merged entry, or `None` when every source ran dry.
    ///
    /// Tombstones are passed through; dropping them is the caller's
    /// policy decision.
    pub fn next(
        &mut self,
        bound: &dyn Fn(&[u8]) -> Ordering,
    ) -> crate::Result<Option<(Vec<u8>, Vec<u8>)>> {
        if !self.initialized {
            for index in 0..self.sources.len() {
                self.refill(index, bound)?;
            }
            self.initialized = true;
        }

        let Some(top) = self.heap.pop_min() else {
            return Ok(None);
        };
        self.refill(top.index, bound)?;

        // Skip every shadowed duplicate of the winning key.
        while let Some(dup) = self.heap.pop_min() {
            if (self.cmp)(&dup.key, &top.key) == Ordering::Equal {
                self.refill(dup.index, bound)?;
            } else {
                self.heap.push(dup);
                break;
            }
        }

        Ok(Some((top.key, top.value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytewise(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn shadowing_by_source_order() {
        let mut newer = ItemSet::default();
        newer.push(b"a", b"new-a");
        newer.push(b"c", b"new-c");

        let mut older = ItemSet::default();
        older.push(b"a", b"old-a");
        older.push(b"b", b"old-b");

        let mut stream = MergeStream::new(
            bytewise,
            vec![MergeSource::items(newer), MergeSource::items(older)],
        );

        let unbounded = |_: &[u8]| Ordering::Equal;
        let mut out = vec![];
        while let Some((k, v)) = stream.next(&unbounded).unwrap() {
            out.push((k, v));
        }

        assert_eq!(
            vec![
                (b"a".to_vec(), b"new-a".to_vec()),
                (b"b".to_vec(), b"old-b".to_vec()),
                (b"c".to_vec(), b"new-c".to_vec()),
            ],
            out
        );
    }
}
