// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The tiered LSM engine.
//!
//! One [`Lsm`] manages a typed key space: the active memtable `c0`, the
//! draining memtable `c1` (present only while a flush is in flight) and
//! up to [`MAX_TIERS`] immutable on-disk runs, tier 0 freshest. Writes
//! land in `c0`; reads consult `c0`, `c1`, then the tiers in order and
//! stop at the first hit, so newer entries shadow older ones. Range scans
//! k-way-merge every tier.
//!
//! A flush promotes `c0` to `c1` behind the memtable lock, then compacts
//! `c1` against tier 0 into a fresh tier-0 run without blocking writers.
//! A tier that outgrows its bound is merged into the next one. Per-tier
//! busy flags serialize competing flushers; the tier table itself is
//! published under an rwlock, so readers see either the old or the new
//! configuration, never a half-installed one.

pub(crate) mod merge;
mod policy;

pub use policy::{Policy, TieredPolicy};

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::ctree::{self, Builder, TreeIter, TreeMeta};
use crate::memtable::Memtable;
use crate::query::{KeyOps, Query};
use crate::store::Store;
use crate::Error;
use merge::{Collect, MergeSource, MergeStream};
use std::cmp::Ordering;
use std::io::{Read, Write};
use std::sync::{Arc, Condvar, Mutex, RwLock};

/// Number of on-disk tiers.
pub const MAX_TIERS: usize = 4;

/// The on-disk roots of one LSM: a super-block per tier, empty slots
/// zeroed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LsmRoots {
    pub tier: [TreeMeta; MAX_TIERS],
}

impl LsmRoots {
    /// Serialized size on disk.
    pub const DISK_SIZE: usize = TreeMeta::DISK_SIZE * MAX_TIERS;

    /// Index one past the oldest populated tier.
    #[must_use]
    pub fn populated(&self) -> usize {
        for i in (0..MAX_TIERS).rev() {
            if !self.tier[i].is_empty() {
                return i + 1;
            }
        }
        0
    }
}

impl Encode for LsmRoots {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        for meta in &self.tier {
            meta.encode_into(writer)?;
        }
        Ok(())
    }
}

impl Decode for LsmRoots {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut roots = Self::default();
        for meta in &mut roots.tier {
            *meta = TreeMeta::decode_from(reader)?;
        }
        Ok(roots)
    }
}

struct TierState {
    tier: [TreeMeta; MAX_TIERS],
    populated: usize,
}

struct Tables {
    c0: Arc<Memtable>,
    c1: Option<Arc<Memtable>>,
}

/// One typed LSM tree.
pub struct Lsm {
    store: Arc<Store>,
    ops: KeyOps,
    policy: Arc<dyn Policy>,

    /// The on-disk tier roots ("sblock" side).
    roots: RwLock<TierState>,

    /// The identity of c0/c1; their contents are internally thread-safe.
    tables: RwLock<Tables>,

    /// Per-tier busy flags serializing flush/merge work.
    busy: Mutex<[bool; MAX_TIERS]>,
    busy_cv: Condvar,
}

impl Lsm {
    #[must_use]
    pub fn new(store: Arc<Store>, ops: KeyOps, roots: LsmRoots, policy: Arc<dyn Policy>) -> Self {
        let populated = roots.populated();

        Self {
            ops,
            policy,
            roots: RwLock::new(TierState {
                tier: roots.tier,
                populated,
            }),
            tables: RwLock::new(Tables {
                c0: Arc::new(Memtable::new(ops.cmp)),
                c1: None,
            }),
            busy: Mutex::new([false; MAX_TIERS]),
            busy_cv: Condvar::new(),
            store,
        }
    }

    #[must_use]
    pub fn key_ops(&self) -> &KeyOps {
        &self.ops
    }

    /// Snapshot of the current tier roots, as a checkpoint wants them.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn roots(&self) -> LsmRoots {
        let state = self.roots.read().expect("lock poisoned");
        LsmRoots { tier: state.tier }
    }

    /// Inserts a new version of `key` into the active memtable. To delete
    /// a key, insert a value the store's tombstone predicate matches.
    #[allow(clippy::expect_used)]
    pub fn insert(&self, key: &[u8], value: &[u8]) {
        let tables = self.tables.read().expect("lock poisoned");
        tables.c0.insert(key, value);
    }

    /// Point lookup, newest version wins. Returns whether `query.emit`
    /// ran; a tombstone is emitted like any other value.
    #[allow(clippy::expect_used)]
    pub fn lookup(&self, query: &mut dyn Query) -> crate::Result<bool> {
        {
            let tables = self.tables.read().expect("lock poisoned");
            if tables.c0.lookup(query)? {
                return Ok(true);
            }
            if let Some(c1) = &tables.c1 {
                if c1.lookup(query)? {
                    return Ok(true);
                }
            }
        }

        for i in 0..MAX_TIERS {
            let meta = {
                let state = self.roots.read().expect("lock poisoned");
                state.tier[i]
            };
            if meta.is_empty() {
                continue;
            }
            if ctree::lookup(&self.store, meta, query)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Emits every live key inside the query's range in ascending order.
    /// The newest version per key decides; keys whose newest version is a
    /// tombstone are suppressed.
    #[allow(clippy::expect_used)]
    pub fn range(&self, query: &mut dyn Query) -> crate::Result<()> {
        let mut sources: Vec<MergeSource<'_>> = Vec::with_capacity(MAX_TIERS + 2);

        {
            let tables = self.tables.read().expect("lock poisoned");

            let mut c0 = Collect::bounded(&*query);
            tables.c0.range(&mut c0)?;
            sources.push(MergeSource::items(c0.set));

            if let Some(c1) = &tables.c1 {
                let mut items = Collect::bounded(&*query);
                c1.range(&mut items)?;
                sources.push(MergeSource::items(items.set));
            }
        }

        let tiers = {
            let state = self.roots.read().expect("lock poisoned");
            state.tier
        };
        for meta in tiers.iter().filter(|meta| !meta.is_empty()) {
            let mut it = TreeIter::new(&self.store, *meta);
            it.find(&|key| query.cmp(key))?;
            sources.push(MergeSource::Tree(it));
        }

        let mut stream = MergeStream::new(self.ops.cmp, sources);
        while let Some((key, value)) = stream.next(&|key| query.cmp(key))? {
            if (self.ops.deleted)(&key, &value) {
                continue;
            }
            query.emit(&key, &value)?;
        }
        Ok(())
    }

    /// Whether `c0` outgrew the flush threshold.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn need_flush(&self) -> bool {
        let tables = self.tables.read().expect("lock poisoned");
        self.policy.should_flush(tables.c0.size())
    }

    /// Whether tier `i` outgrew its bound and should merge downward.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn need_merge(&self, i: usize) -> bool {
        if i >= MAX_TIERS {
            return false;
        }

        let bytes = {
            let state = self.roots.read().expect("lock poisoned");
            state.tier[i].size * self.store.page_size() as u64
        };
        self.policy.should_merge(i, bytes)
    }

    fn busy_acquire(&self, from: usize, to: usize) {
        #[allow(clippy::expect_used)]
        let mut busy = self.busy.lock().expect("lock poisoned");
        loop {
            if busy[from..=to].iter().any(|flag| *flag) {
                #[allow(clippy::expect_used)]
                {
                    busy = self.busy_cv.wait(busy).expect("lock poisoned");
                }
                continue;
            }
            break;
        }
        for flag in &mut busy[from..=to] {
            *flag = true;
        }
    }

    fn busy_release(&self, from: usize, to: usize) {
        #[allow(clippy::expect_used)]
        let mut busy = self.busy.lock().expect("lock poisoned");
        for flag in &mut busy[from..=to] {
            *flag = false;
        }
        self.busy_cv.notify_all();
    }

    /// Seals `c0` into `c1` and installs a fresh `c0`. On success the
    /// tier-0 busy flag stays held until [`Self::flush_finish`].
    #[allow(clippy::expect_used)]
    pub fn flush_start(&self) -> crate::Result<()> {
        self.busy_acquire(0, 0);

        let mut tables = self.tables.write().expect("lock poisoned");
        if tables.c1.is_some() {
            drop(tables);
            self.busy_release(0, 0);
            return Err(Error::Busy);
        }

        let fresh = Arc::new(Memtable::new(self.ops.cmp));
        tables.c1 = Some(std::mem::replace(&mut tables.c0, fresh));
        Ok(())
    }

    /// Drains `c1` into a new tier-0 run and drops it. On error `c1`
    /// stays intact so the flusher can retry.
    pub fn flush_finish(&self) -> crate::Result<()> {
        let result = self.flush_impl();
        self.busy_release(0, 0);
        result
    }

    /// Flush in one call. A leftover `c1` from an earlier failed flush is
    /// drained first, then the current `c0` is sealed and drained too.
    pub fn flush(&self) -> crate::Result<()> {
        loop {
            match self.flush_start() {
                Ok(()) => return self.flush_finish(),
                Err(Error::Busy) => {
                    self.busy_acquire(0, 0);
                    self.flush_finish()?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drains a leftover sealed memtable if one exists; a no-op
    /// otherwise.
    pub(crate) fn drain_sealed(&self) -> crate::Result<()> {
        self.busy_acquire(0, 0);
        self.flush_finish()
    }

    #[allow(clippy::expect_used)]
    fn flush_impl(&self) -> crate::Result<()> {
        let c1 = {
            let tables = self.tables.read().expect("lock poisoned");
            tables.c1.clone()
        };
        let Some(c1) = c1 else {
            return Ok(());
        };

        let (old, populated) = {
            let state = self.roots.read().expect("lock poisoned");
            (state.tier[0], state.populated)
        };

        let res = if c1.is_empty() {
            old
        } else {
            let drop_deleted = self.policy.drop_tombstones(populated, 0);
            log::debug!(
                "flushing memtable ({} entries, {} bytes) against tier 0 ({} pages)",
                c1.len(),
                c1.size(),
                old.size,
            );
            self.build_flush(&c1, old, drop_deleted)?
        };

        let mut state = self.roots.write().expect("lock poisoned");
        state.tier[0] = res;
        if !res.is_empty() && state.populated == 0 {
            state.populated = 1;
        }

        let mut tables = self.tables.write().expect("lock poisoned");
        tables.c1 = None;
        drop(tables);
        drop(state);

        log::debug!("flush finished, tier 0 now {} pages", res.size);
        Ok(())
    }

    fn build_flush(
        &self,
        c1: &Memtable,
        old: TreeMeta,
        drop_deleted: bool,
    ) -> crate::Result<TreeMeta> {
        let mut items = Collect::all();
        c1.scan(&mut items)?;

        let mut sources = vec![MergeSource::items(items.set)];
        if !old.is_empty() {
            let mut it = TreeIter::new(&self.store, old);
            it.reset()?;
            sources.push(MergeSource::Tree(it));
        }

        self.build_from(sources, drop_deleted)
    }

    fn build_from(
        &self,
        sources: Vec<MergeSource<'_>>,
        drop_deleted: bool,
    ) -> crate::Result<TreeMeta> {
        let unbounded = |_: &[u8]| Ordering::Equal;

        let mut stream = MergeStream::new(self.ops.cmp, sources);
        let mut builder = Builder::new(&self.store);

        while let Some((key, value)) = stream.next(&unbounded)? {
            if drop_deleted && (self.ops.deleted)(&key, &value) {
                continue;
            }
            builder.append(&key, &value)?;
        }
        builder.finish()
    }

    /// Merges tier `i` into tier `i + 1`. Tombstones are dropped only
    /// when the destination is the oldest populated tier, i.e. when no
    /// older run can still shadow a key.
    pub fn merge(&self, i: usize) -> crate::Result<()> {
        if i + 1 >= MAX_TIERS {
            return Ok(());
        }

        self.busy_acquire(i, i + 1);
        let result = self.merge_impl(i);
        self.busy_release(i, i + 1);
        result
    }

    #[allow(clippy::expect_used)]
    fn merge_impl(&self, i: usize) -> crate::Result<()> {
        let (src, dst, populated) = {
            let state = self.roots.read().expect("lock poisoned");
            (state.tier[i], state.tier[i + 1], state.populated)
        };

        if src.is_empty() {
            return Ok(());
        }

        let drop_deleted = self.policy.drop_tombstones(populated, i + 1);
        let res = if dst.is_empty() && !drop_deleted {
            // Plain move; rewriting would drop nothing anyway.
            src
        } else {
            log::debug!(
                "merging tier {i} ({} pages) into tier {} ({} pages), drop_deleted={drop_deleted}",
                src.size,
                i + 1,
                dst.size,
            );

            let mut sources = Vec::with_capacity(2);
            let mut src_it = TreeIter::new(&self.store, src);
            src_it.reset()?;
            sources.push(MergeSource::Tree(src_it));

            if !dst.is_empty() {
                let mut dst_it = TreeIter::new(&self.store, dst);
                dst_it.reset()?;
                sources.push(MergeSource::Tree(dst_it));
            }

            self.build_from(sources, drop_deleted)?
        };

        let mut state = self.roots.write().expect("lock poisoned");
        state.tier[i + 1] = res;
        state.tier[i] = TreeMeta::default();
        if state.populated < i + 2 {
            state.populated = i + 2;
        }
        Ok(())
    }
}
