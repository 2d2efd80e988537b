// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The mounted filesystem handle.
//!
//! [`Fs`] owns the whole stack: the block device behind a [`Store`], the
//! two typed LSMs, the write-ahead log, and the two background threads —
//! the log worker, which turns submitted transactions into durable,
//! applied state, and the flusher, which commits memtables to disk and
//! keeps the tier hierarchy within bounds.
//!
//! The write path: a caller builds a [`Transaction`] out of typed redo
//! entries and calls [`Fs::submit`]; the worker batches the submission
//! stack, appends every record to the WAL, syncs, checkpoints when
//! pressure demands, applies the redo entries to the memtables and only
//! then resolves the waiters. Recovery replays the WAL tail over the
//! checkpointed tree roots, so an acknowledged transaction survives any
//! crash.

use crate::block::FileDevice;
use crate::checkpoint::{Checkpoint, WalPosition};
use crate::config::Config;
use crate::dentry::{self, Dentry, REDO_DENTRY};
use crate::inode::{self, Inode, REDO_INODE, ROOT_INO, TYPE_DIR};
use crate::lsm::{Lsm, LsmRoots, MAX_TIERS};
use crate::query::Query;
use crate::stop_signal::StopSignal;
use crate::store::Store;
use crate::superblock::SuperBlock;
use crate::trans::{decode_redo, TransHandle, TransQueue, Transaction};
use crate::wal::{self, Wal};
use crate::{align_up, update_inode, Error};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Instant;

pub(crate) struct FsInner {
    store: Arc<Store>,
    sb: SuperBlock,
    config: Config,

    inodes: Lsm,
    dentries: Lsm,
    wal: Wal,
    queue: TransQueue,

    next_ino: AtomicU64,
    gen: AtomicU64,

    /// Readers/appliers take this shared; a full commit takes it
    /// exclusive to seal both memtables at one instant.
    trans_lock: RwLock<()>,

    /// Serializes checkpoint writers.
    commit_lock: Mutex<()>,

    /// Position and time of the last checkpoint, for the worker's
    /// pressure decision.
    last_check: Mutex<(WalPosition, Instant)>,

    stop: StopSignal,
    flusher_gate: Mutex<()>,
    flusher_cv: Condvar,
}

/// A mounted silt filesystem.
pub struct Fs {
    inner: Arc<FsInner>,
    worker: Option<JoinHandle<()>>,
    flusher: Option<JoinHandle<()>>,
}

impl FsInner {
    fn apply_redo(&self, rtype: u32, payload: &[u8]) -> crate::Result<()> {
        let (key, value) = decode_redo(payload)?;
        match rtype {
            REDO_INODE => self.inodes.insert(key, value),
            REDO_DENTRY => self.dentries.insert(key, value),
            _ => return Err(Error::Corruption("unknown redo entry type")),
        }
        Ok(())
    }

    fn checkpoint(&self, pos: WalPosition) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let _commit = self.commit_lock.lock().expect("lock poisoned");
        self.checkpoint_locked(pos)
    }

    /// Caller holds `commit_lock`.
    fn checkpoint_locked(&self, pos: WalPosition) -> crate::Result<()> {
        let check = Checkpoint {
            gen: self.gen.fetch_add(1, Ordering::Relaxed) + 1,
            next_ino: self.next_ino.load(Ordering::Relaxed),
            inode_roots: self.inodes.roots(),
            dentry_roots: self.dentries.roots(),
            wal: pos,
        };
        check.commit(&self.store, &self.sb)?;

        #[allow(clippy::expect_used)]
        let mut last = self.last_check.lock().expect("lock poisoned");
        *last = (pos, Instant::now());
        Ok(())
    }

    /// Checkpoint only when enough log accumulated since the last one,
    /// or enough time passed.
    fn checkpoint_on_pressure(&self, pos: WalPosition) -> crate::Result<()> {
        let (last_pos, last_when) = {
            #[allow(clippy::expect_used)]
            let last = self.last_check.lock().expect("lock poisoned");
            *last
        };

        let fresh_bytes = if pos.curr_offs == last_pos.curr_offs {
            u64::from(pos.used.saturating_sub(last_pos.used))
        } else {
            // The segment rotated since; that alone is pressure enough.
            self.config.checkpoint_pressure
        };

        if fresh_bytes >= self.config.checkpoint_pressure
            || last_when.elapsed() >= self.config.checkpoint_interval
        {
            self.checkpoint(pos)?;
        }
        Ok(())
    }

    /// One worker round: drain the submission stack, log, sync,
    /// checkpoint on pressure, apply, resolve waiters.
    fn process_batch(&self, batch: &[Transaction]) {
        let mut result: crate::Result<()> = Ok(());

        for trans in batch {
            if result.is_ok() {
                result = self.wal.append(trans.as_record());
            }
        }

        if result.is_ok() {
            result = self.wal.commit(false).and_then(|pos| {
                self.checkpoint_on_pressure(pos)
            });
        }

        if result.is_ok() {
            #[allow(clippy::expect_used)]
            let _applying = self.trans_lock.read().expect("lock poisoned");
            'apply: for trans in batch {
                for (rtype, payload) in trans.entries() {
                    if let Err(e) = self.apply_redo(rtype, payload) {
                        result = Err(e);
                        break 'apply;
                    }
                }
            }
        }

        if let Err(e) = &result {
            log::error!("transaction batch of {} failed: {e}", batch.len());
        }
        for trans in batch {
            trans.resolve(result.is_ok());
        }
    }

    /// Full commit: drain leftovers, seal both memtables at one instant,
    /// flush them into tier 0, advance the log head and checkpoint.
    fn commit(&self) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let _commit = self.commit_lock.lock().expect("lock poisoned");

        self.inodes.drain_sealed()?;
        self.dentries.drain_sealed()?;

        let (s1, s2) = {
            #[allow(clippy::expect_used)]
            let _quiesce = self.trans_lock.write().expect("lock poisoned");
            (self.inodes.flush_start(), self.dentries.flush_start())
        };

        let f1 = match s1 {
            Ok(()) => self.inodes.flush_finish(),
            Err(e) => Err(e),
        };
        let f2 = match s2 {
            Ok(()) => self.dentries.flush_finish(),
            Err(e) => Err(e),
        };
        f1?;
        f2?;

        // Every record up to here now lives in a tier; older segments
        // are dead weight for recovery.
        let pos = self.wal.commit(true)?;
        self.checkpoint_locked(pos)
    }

    fn flusher_main(&self) {
        let mut last_commit = Instant::now();

        loop {
            {
                #[allow(clippy::expect_used)]
                let gate = self.flusher_gate.lock().expect("lock poisoned");
                if !self.stop.is_stopped() {
                    #[allow(clippy::expect_used)]
                    let _unused = self
                        .flusher_cv
                        .wait_timeout(gate, self.config.flusher_tick)
                        .expect("lock poisoned");
                }
            }
            if self.stop.is_stopped() {
                break;
            }

            let due = self.inodes.need_flush()
                || self.dentries.need_flush()
                || last_commit.elapsed() >= self.config.commit_interval;
            if !due {
                continue;
            }

            match self.commit() {
                Ok(()) => last_commit = Instant::now(),
                Err(e) => {
                    log::warn!("background commit failed, will retry: {e}");
                    continue;
                }
            }

            for map in [&self.inodes, &self.dentries] {
                for tier in 0..MAX_TIERS {
                    if self.stop.is_stopped() {
                        return;
                    }
                    if !map.need_merge(tier) {
                        continue;
                    }
                    if let Err(e) = map.merge(tier) {
                        log::warn!("merge of tier {tier} failed, will retry: {e}");
                    }
                }
            }
        }
    }

    fn worker_main(&self) {
        loop {
            self.queue.wait(&self.stop);

            let batch = self.queue.take_all();
            if batch.is_empty() {
                if self.stop.is_stopped() {
                    break;
                }
                continue;
            }
            self.process_batch(&batch);
        }
    }
}

impl Fs {
    /// Formats a fresh image and mounts it.
    pub(crate) fn format(config: Config) -> crate::Result<Self> {
        let page = u64::from(config.page_size);

        {
            let device = FileDevice::create(&config.path)?;
            let store = Store::new(
                Box::new(device),
                config.page_size as usize,
                config.fanout,
            );

            // Fixed layout: super-block sector, primary + backup
            // checkpoint slots, then the first WAL segment.
            let check_offs = 1u64;
            let backup_check_offs = check_offs + u64::from(config.check_size);
            let wal_offs = backup_check_offs + u64::from(config.check_size);

            let sb = SuperBlock {
                page_size: config.page_size,
                check_size: config.check_size,
                check_offs,
                backup_check_offs,
                root: ROOT_INO,
            };
            sb.commit(&store)?;

            let check = Checkpoint {
                gen: 1,
                next_ino: ROOT_INO + 1,
                inode_roots: LsmRoots::default(),
                dentry_roots: LsmRoots::default(),
                wal: WalPosition {
                    head_offs: wal_offs,
                    curr_offs: wal_offs,
                    used: 0,
                },
            };
            check.commit(&store, &sb)?;

            log::info!(
                "formatted {} ({} byte pages, wal at page {wal_offs})",
                config.path.display(),
                page,
            );
        }

        Self::open(config)
    }

    /// Mounts an existing image: loads the checkpoint, replays the WAL
    /// tail into the memtables and starts the background threads.
    pub(crate) fn open(config: Config) -> crate::Result<Self> {
        let device = FileDevice::open(&config.path)?;
        let store = Arc::new(Store::new(
            Box::new(device),
            config.page_size as usize,
            config.fanout,
        ));

        let sb = SuperBlock::read(&store)?;
        if sb.page_size != config.page_size {
            return Err(Error::Corruption("page size does not match the image"));
        }

        let check = Checkpoint::read(&store, &sb)?;
        let page = u64::from(sb.page_size);
        let segment_pages = config.segment_size as u64 / page;

        // Nothing durable lives past the image end except the current
        // WAL segment's reservation; keep both out of reach.
        let device_pages = align_up(store.device().size()?, page) / page;
        store
            .allocator()
            .set_floor(device_pages.max(check.wal.curr_offs + segment_pages));

        let inodes = Lsm::new(
            store.clone(),
            inode::key_ops(),
            check.inode_roots,
            Arc::new(config.tuning),
        );
        let dentries = Lsm::new(
            store.clone(),
            dentry::key_ops(),
            check.dentry_roots,
            Arc::new(config.tuning),
        );

        let replayed = wal::replay(&store, config.segment_size, &check.wal, |rtype, payload| {
            let (key, value) = decode_redo(payload)?;
            match rtype {
                REDO_INODE => inodes.insert(key, value),
                REDO_DENTRY => dentries.insert(key, value),
                _ => return Err(Error::Corruption("unknown redo entry type")),
            }
            Ok(())
        })?;
        log::info!(
            "mounted generation {} ({replayed} redo entries replayed)",
            check.gen,
        );

        let wal = Wal::new(store.clone(), config.segment_size, &check.wal)?;

        let inner = Arc::new(FsInner {
            sb,
            inodes,
            dentries,
            wal,
            queue: TransQueue::new(),
            next_ino: AtomicU64::new(check.next_ino),
            gen: AtomicU64::new(check.gen),
            trans_lock: RwLock::new(()),
            commit_lock: Mutex::new(()),
            last_check: Mutex::new((check.wal, Instant::now())),
            stop: StopSignal::default(),
            flusher_gate: Mutex::new(()),
            flusher_cv: Condvar::new(),
            config,
            store,
        });

        let worker = {
            let inner = inner.clone();
            std::thread::Builder::new()
                .name("silt-log".into())
                .spawn(move || inner.worker_main())?
        };
        let flusher = {
            let inner = inner.clone();
            std::thread::Builder::new()
                .name("silt-flusher".into())
                .spawn(move || inner.flusher_main())?
        };

        let fs = Self {
            inner,
            worker: Some(worker),
            flusher: Some(flusher),
        };
        fs.ensure_root()?;
        Ok(fs)
    }

    /// Creates the root directory on a freshly formatted image.
    fn ensure_root(&self) -> crate::Result<()> {
        if self.read_inode(ROOT_INO)?.is_some() {
            return Ok(());
        }

        let mut root = Inode::new(ROOT_INO, TYPE_DIR);
        root.links = 1;
        root.perm = 0o755;

        let mut trans = Transaction::new();
        update_inode(&mut trans, &root);
        self.submit(trans).wait()
    }

    /// Allocates a fresh inode number.
    #[must_use]
    pub fn allocate_ino(&self) -> u64 {
        self.inner.next_ino.fetch_add(1, Ordering::Relaxed)
    }

    /// Submits a transaction to the log worker; the returned handle
    /// resolves once the redo record is durable and applied.
    pub fn submit(&self, mut trans: Transaction) -> TransHandle {
        let handle = trans.handle();

        if trans.is_empty() {
            trans.resolve(true);
            return handle;
        }

        trans.finish();
        self.inner.queue.push(trans);
        handle
    }

    /// Reads an inode; a tombstoned record reads as absent.
    pub fn read_inode(&self, ino: u64) -> crate::Result<Option<Inode>> {
        Ok(inode::lookup(&self.inner.inodes, ino)?.filter(|inode| !inode.is_deleted()))
    }

    /// Reads a directory entry; a tombstoned record reads as absent.
    pub fn read_dentry(&self, parent: u64, name: &[u8]) -> crate::Result<Option<Dentry>> {
        Ok(dentry::lookup(&self.inner.dentries, parent, name)?
            .filter(|dentry| !dentry.is_deleted()))
    }

    /// Lists a directory's live entries in hash order.
    pub fn read_dir(&self, parent: u64) -> crate::Result<Vec<Dentry>> {
        dentry::read_dir(&self.inner.dentries, parent)
    }

    /// Runs a point query against the inode store; tombstones are
    /// surfaced to the query like any other value.
    pub fn lookup_inode_raw(&self, query: &mut dyn Query) -> crate::Result<bool> {
        self.inner.inodes.lookup(query)
    }

    /// Forces a full commit: both memtables flushed to tier 0, WAL head
    /// advanced, checkpoint written.
    pub fn commit(&self) -> crate::Result<()> {
        self.inner.commit()
    }

    /// The store generation as of the last checkpoint write.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.gen.load(Ordering::Relaxed)
    }

    fn shutdown(&mut self) -> crate::Result<()> {
        if self.worker.is_none() && self.flusher.is_none() {
            return Ok(());
        }

        self.inner.stop.send();
        self.inner.queue.wake();
        self.inner.flusher_cv.notify_all();

        if let Some(worker) = self.worker.take() {
            let _joined = worker.join();
        }
        if let Some(flusher) = self.flusher.take() {
            let _joined = flusher.join();
        }

        self.inner.commit()
    }

    /// Unmounts: stops the background threads and runs a final full
    /// commit.
    pub fn close(mut self) -> crate::Result<()> {
        self.shutdown()
    }
}

impl Drop for Fs {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("final commit during drop failed: {e}");
        }
    }
}
