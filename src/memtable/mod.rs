// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub(crate) mod skiplist;

use crate::query::{KeyCmpFn, Query};
use skiplist::SkipList;

/// The mutable tier of an LSM: an in-memory sorted store for freshly
/// applied redo records.
///
/// Backed by an insert-only lock-free skiplist; concurrent inserts and
/// reads need no outside locking. Equal-key inserts shadow each other by
/// insertion order, so replaying the same record twice is harmless.
///
/// When a memtable grows past the flush threshold the LSM swaps it out,
/// drains it into a ctree and drops it — which is the only moment its
/// nodes are freed.
pub struct Memtable {
    list: SkipList,
}

impl Memtable {
    #[must_use]
    pub fn new(cmp: KeyCmpFn) -> Self {
        Self {
            list: SkipList::new(cmp),
        }
    }

    /// Inserts a new version of `key`. Tombstones are ordinary values
    /// that happen to satisfy the store's tombstone predicate.
    pub fn insert(&self, key: &[u8], value: &[u8]) {
        self.list.insert(key, value);
    }

    /// Number of (non-deduplicated) entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate payload size in bytes; drives the flush threshold.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.list.bytes()
    }

    /// Point lookup; returns whether `query.emit` ran. The newest version
    /// of the key is the one emitted.
    pub fn lookup(&self, query: &mut dyn Query) -> crate::Result<bool> {
        self.list.lookup(query)
    }

    /// Emits every key inside the query's range, ascending, newest
    /// version per key.
    pub fn range(&self, query: &mut dyn Query) -> crate::Result<()> {
        self.list.range(query)
    }

    /// Visits every unique key in the table, emitting those the query
    /// matches. Used by the flusher, which scans with an all-matching
    /// query.
    pub fn scan(&self, query: &mut dyn Query) -> crate::Result<()> {
        self.list.scan(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;
    use test_log::test;

    fn bytewise(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    struct Exact {
        target: Vec<u8>,
        hits: Vec<(Vec<u8>, Vec<u8>)>,
    }

    impl Query for Exact {
        fn cmp(&self, key: &[u8]) -> Ordering {
            key.cmp(&self.target[..])
        }

        fn emit(&mut self, key: &[u8], value: &[u8]) -> crate::Result<()> {
            self.hits.push((key.to_vec(), value.to_vec()));
            Ok(())
        }
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn lookup_returns_newest() {
        let table = Memtable::new(bytewise);
        table.insert(&42u64.to_be_bytes(), &100u64.to_be_bytes());
        table.insert(&7u64.to_be_bytes(), &200u64.to_be_bytes());
        table.insert(&42u64.to_be_bytes(), &300u64.to_be_bytes());

        let mut q = Exact {
            target: 42u64.to_be_bytes().to_vec(),
            hits: vec![],
        };
        assert!(table.lookup(&mut q).unwrap());
        assert_eq!(300u64.to_be_bytes().to_vec(), q.hits[0].1);

        let mut q = Exact {
            target: 9u64.to_be_bytes().to_vec(),
            hits: vec![],
        };
        assert!(!table.lookup(&mut q).unwrap());
    }

    struct All(Vec<(Vec<u8>, Vec<u8>)>);

    impl Query for All {
        fn cmp(&self, _: &[u8]) -> Ordering {
            Ordering::Equal
        }

        fn emit(&mut self, key: &[u8], value: &[u8]) -> crate::Result<()> {
            self.0.push((key.to_vec(), value.to_vec()));
            Ok(())
        }
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn scan_collapses_versions() {
        let table = Memtable::new(bytewise);
        for i in 0u64..64 {
            table.insert(&(i % 16).to_be_bytes(), &i.to_be_bytes());
        }

        let mut q = All(vec![]);
        table.scan(&mut q).unwrap();

        assert_eq!(16, q.0.len());
        for (i, (key, value)) in q.0.iter().enumerate() {
            assert_eq!((i as u64).to_be_bytes().to_vec(), *key);
            // Last round of inserts wrote values 48..64.
            assert_eq!((48 + i as u64).to_be_bytes().to_vec(), *value);
        }
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn size_tracks_payload() {
        let table = Memtable::new(bytewise);
        assert_eq!(0, table.size());
        table.insert(b"abc", b"defg");
        assert_eq!(7, table.size());
    }
}
