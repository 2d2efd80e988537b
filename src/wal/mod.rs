// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Segmented write-ahead log.
//!
//! The log is a chain of fixed-size on-disk segments linked by JUMP
//! records. Appends go into one of two in-memory buffers: writers copy
//! their finished transaction record into `current` under a short
//! critical section; the writer whose record does not fit swaps the
//! buffers and becomes the drain owner — it seals the full buffer with a
//! JUMP to the fresh segment, writes and syncs it, resets it and
//! republishes it as `next`. While both buffers are tied up, writers
//! park on wait queues and are woken in the same order the original
//! protocol defines: the single parked rotator first, the crowd waiting
//! for a usable `current` after it.
//!
//! The first I/O error poisons the log: every later append fails with
//! [`Error::WalPoisoned`] until the store is reopened. Committed state is
//! never touched after an error.
//!
//! Recovery reads records sequentially from the checkpointed head,
//! verifying each record's checksum and following JUMPs; a checksum
//! failure or NONE padding marks the end of the log. Replay deliberately
//! runs past the checkpointed tail so batches that were synced but not
//! yet checkpointed still recover.

use crate::checkpoint::WalPosition;
use crate::checksum::ChecksumHasher;
use crate::store::Store;
use crate::{align_up, Error};
use byteorder::{ByteOrder, LittleEndian};
use std::sync::{Arc, Condvar, Mutex};

/// Padding record type; a zero byte at a segment tail.
pub const WAL_NONE: u8 = 0;

/// A transaction record.
pub const WAL_ENTRY: u8 = 1;

/// A link to the next segment.
pub const WAL_JUMP: u8 = 2;

/// Packed record header: `type:u8, size:u32, csum:u64`.
pub const RECORD_HEADER_SIZE: usize = 13;

/// A JUMP record: header plus the next segment's first page.
pub(crate) const JUMP_SIZE: usize = RECORD_HEADER_SIZE + 8;

/// Hard cap on a single transaction record.
pub const MAX_TRANSACTION_SIZE: usize = 256 * 1024;

/// Default segment capacity.
pub const MAX_SEGMENT_SIZE: usize = 4 * 1024 * 1024;

/// Stamps `type`, `size` and the seeded checksum into a complete record
/// buffer; the checksum field is hashed as zeroes.
pub(crate) fn stamp_record(buf: &mut [u8], rtype: u8) {
    debug_assert!(buf.len() >= RECORD_HEADER_SIZE);

    buf[0] = rtype;
    let len = buf.len() as u32;
    LittleEndian::write_u32(&mut buf[1..5], len);
    LittleEndian::write_u64(&mut buf[5..13], 0);

    let mut hasher = ChecksumHasher::default();
    hasher.update(buf);
    let csum = hasher.finish();
    LittleEndian::write_u64(&mut buf[5..13], csum);
}

/// Verifies a complete record against its embedded checksum.
pub(crate) fn verify_record(buf: &[u8]) -> bool {
    if buf.len() < RECORD_HEADER_SIZE {
        return false;
    }

    let mut hasher = ChecksumHasher::default();
    hasher.update(&buf[..5]);
    hasher.update(&[0u8; 8]);
    hasher.update(&buf[RECORD_HEADER_SIZE..]);
    hasher.finish() == LittleEndian::read_u64(&buf[5..13])
}

struct Buffer {
    /// First page of the segment this buffer will be written to; zero
    /// while unassigned.
    offs: u64,
    size: usize,
    buf: Vec<u8>,
}

impl Buffer {
    fn new(cap: usize) -> Self {
        Self {
            offs: 0,
            size: 0,
            buf: vec![0u8; cap],
        }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.size
    }

    fn append(&mut self, data: &[u8]) {
        self.buf[self.size..self.size + data.len()].copy_from_slice(data);
        self.size += data.len();
    }

    fn reset(&mut self) {
        self.buf.fill(0);
        self.size = 0;
        self.offs = 0;
    }
}

struct Waiter {
    ready: Mutex<bool>,
    cv: Condvar,
}

impl Waiter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            ready: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    #[allow(clippy::expect_used)]
    fn wake(&self) {
        let mut ready = self.ready.lock().expect("lock poisoned");
        *ready = true;
        self.cv.notify_one();
    }

    #[allow(clippy::expect_used)]
    fn wait(&self) {
        let mut ready = self.ready.lock().expect("lock poisoned");
        while !*ready {
            ready = self.cv.wait(ready).expect("lock poisoned");
        }
    }
}

struct WalState {
    current: Option<Buffer>,
    next: Option<Buffer>,
    head_offs: u64,
    poisoned: bool,
    wait_current: Vec<Arc<Waiter>>,
    wait_next: Vec<Arc<Waiter>>,
}

/// The write-ahead log over a store.
pub struct Wal {
    store: Arc<Store>,
    segment_bytes: usize,
    state: Mutex<WalState>,
}

impl Wal {
    /// Opens the log at the checkpointed position, reading the committed
    /// tail of the current segment back so appends continue where the
    /// last run left off.
    pub fn new(store: Arc<Store>, segment_bytes: usize, pos: &WalPosition) -> crate::Result<Self> {
        debug_assert_eq!(0, segment_bytes % store.page_size());

        let mut current = Buffer::new(segment_bytes);
        current.offs = pos.curr_offs;
        current.size = pos.used as usize;

        if pos.used > 0 {
            let page = store.page_size() as u64;
            let aligned = align_up(u64::from(pos.used), page) as usize;
            store.read(
                &mut current.buf[..aligned],
                pos.curr_offs * page,
            )?;
            // Anything past `used` is NONE padding from the last commit.
            current.buf[pos.used as usize..].fill(0);
        }

        Ok(Self {
            segment_bytes,
            state: Mutex::new(WalState {
                current: Some(current),
                next: Some(Buffer::new(segment_bytes)),
                head_offs: pos.head_offs,
                poisoned: false,
                wait_current: Vec::new(),
                wait_next: Vec::new(),
            }),
            store,
        })
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, WalState> {
        self.state.lock().expect("lock poisoned")
    }

    /// Latches the first error and fails everyone currently parked.
    fn poison(&self) {
        let waiters = {
            let mut state = self.lock();
            state.poisoned = true;
            let mut waiters = std::mem::take(&mut state.wait_current);
            waiters.append(&mut state.wait_next);
            waiters
        };
        for waiter in waiters {
            waiter.wake();
        }
        log::error!("write-ahead log poisoned; all further appends will fail");
    }

    /// Reserves a disk segment for a buffer that does not have one yet.
    fn assign_segment(&self, buffer: &mut Buffer) -> crate::Result<()> {
        if buffer.offs == 0 {
            let pages = (self.segment_bytes / self.store.page_size()) as u64;
            buffer.offs = self.store.reserve(pages)?;
        }
        Ok(())
    }

    /// Appends one finished transaction record.
    ///
    /// Returns once the record sits in a log buffer; durability comes
    /// from the segment write that either this call (on rotation) or a
    /// later [`Self::commit`] performs.
    pub fn append(&self, record: &[u8]) -> crate::Result<()> {
        assert!(
            record.len() <= MAX_TRANSACTION_SIZE,
            "transaction exceeds the record size limit"
        );

        loop {
            let mut state = self.lock();
            if state.poisoned {
                return Err(Error::WalPoisoned);
            }

            let Some(current) = state.current.as_mut() else {
                // Somebody is rotating; wait for a usable buffer.
                let waiter = Waiter::new();
                state.wait_current.push(waiter.clone());
                drop(state);
                waiter.wait();
                continue;
            };

            // Always leave room for the JUMP that seals the segment.
            if record.len() + JUMP_SIZE <= current.remaining() {
                current.append(record);
                return Ok(());
            }

            #[allow(clippy::expect_used)]
            let full = state.current.take().expect("current buffer present");

            if let Some(mut fresh) = state.next.take() {
                // Fill-and-swap: promote `next`, keep the drain for
                // after the critical section.
                if let Err(e) = self.assign_segment(&mut fresh) {
                    drop(state);
                    self.poison();
                    return Err(e);
                }
                fresh.append(record);
                let jump_to = fresh.offs;
                state.current = Some(fresh);
                drop(state);

                return self.drain(full, jump_to);
            }

            // Congestion: both buffers busy. Park until the previous
            // drain republishes `next`, then take over as its promoter
            // and drain the buffer we are still holding.
            let waiter = Waiter::new();
            state.wait_next.push(waiter.clone());
            drop(state);
            waiter.wait();

            let mut state = self.lock();
            if state.poisoned {
                return Err(Error::WalPoisoned);
            }

            #[allow(clippy::expect_used)]
            let mut fresh = state
                .next
                .take()
                .expect("drain owner republished the next buffer");
            if let Err(e) = self.assign_segment(&mut fresh) {
                drop(state);
                self.poison();
                return Err(e);
            }
            fresh.append(record);
            let jump_to = fresh.offs;
            state.current = Some(fresh);
            let waiters = std::mem::take(&mut state.wait_current);
            drop(state);

            for w in waiters {
                w.wake();
            }
            return self.drain(full, jump_to);
        }
    }

    /// Seals and persists a full buffer, then republishes it as `next`.
    fn drain(&self, mut full: Buffer, jump_to: u64) -> crate::Result<()> {
        let page = self.store.page_size() as u64;

        let mut jump = [0u8; JUMP_SIZE];
        LittleEndian::write_u64(&mut jump[RECORD_HEADER_SIZE..], jump_to);
        stamp_record(&mut jump, WAL_JUMP);
        full.append(&jump);

        log::debug!(
            "sealing wal segment at page {} ({} bytes), next segment at page {jump_to}",
            full.offs,
            full.size,
        );

        if let Err(e) = self.store.write_sync(&full.buf, full.offs * page) {
            self.poison();
            return Err(e);
        }
        full.reset();

        let waiters = {
            let mut state = self.lock();
            state.next = Some(full);
            std::mem::take(&mut state.wait_next)
        };
        for waiter in waiters {
            waiter.wake();
        }
        Ok(())
    }

    /// Writes the committed prefix of the current segment (padded with
    /// NONE to a page boundary), syncs, and returns the position a
    /// checkpoint should record.
    ///
    /// With `advance_head` the log head moves to the current segment
    /// first — done after a full flush has made every older segment
    /// redundant.
    pub fn commit(&self, advance_head: bool) -> crate::Result<WalPosition> {
        loop {
            let mut state = self.lock();
            if state.poisoned {
                return Err(Error::WalPoisoned);
            }

            let page = self.store.page_size() as u64;
            let (used, offs, snapshot) = match state.current.as_ref() {
                Some(current) => {
                    let aligned = align_up(current.size as u64, page) as usize;
                    (
                        current.size,
                        current.offs,
                        current.buf[..aligned].to_vec(),
                    )
                }
                None => {
                    let waiter = Waiter::new();
                    state.wait_current.push(waiter.clone());
                    drop(state);
                    waiter.wait();
                    continue;
                }
            };

            if advance_head {
                state.head_offs = offs;
            }
            let head_offs = state.head_offs;
            drop(state);

            if !snapshot.is_empty() {
                if let Err(e) = self.store.write_sync(&snapshot, offs * page) {
                    self.poison();
                    return Err(e);
                }
            }

            return Ok(WalPosition {
                head_offs,
                curr_offs: offs,
                used: used as u32,
            });
        }
    }

    /// The position a checkpoint would record right now, without any I/O.
    pub fn position(&self) -> crate::Result<WalPosition> {
        let state = self.lock();
        if state.poisoned {
            return Err(Error::WalPoisoned);
        }
        let current = state.current.as_ref();
        Ok(WalPosition {
            head_offs: state.head_offs,
            curr_offs: current.map_or(0, |c| c.offs),
            used: current.map_or(0, |c| c.size as u32),
        })
    }
}

/// Replays the log from the checkpointed head.
///
/// `apply` receives every redo entry of every intact transaction record,
/// in log order. Returns the number of entries applied.
pub fn replay<F>(
    store: &Store,
    segment_bytes: usize,
    pos: &WalPosition,
    mut apply: F,
) -> crate::Result<u64>
where
    F: FnMut(u32, &[u8]) -> crate::Result<()>,
{
    let page = store.page_size() as u64;
    let mut seg_offs = pos.head_offs;
    let mut applied = 0u64;

    'segments: loop {
        let mut segment = vec![0u8; segment_bytes];
        store.read(&mut segment, seg_offs * page)?;

        let mut p = 0usize;
        loop {
            if p + RECORD_HEADER_SIZE > segment_bytes {
                break 'segments;
            }

            let rtype = segment[p];
            if rtype == WAL_NONE {
                // Padding; the log ends in this segment.
                break 'segments;
            }

            let size = LittleEndian::read_u32(&segment[p + 1..p + 5]) as usize;
            if size < RECORD_HEADER_SIZE || p + size > segment_bytes {
                // A torn header reads like garbage; treat as tail.
                break 'segments;
            }

            let record = &segment[p..p + size];
            if !verify_record(record) {
                break 'segments;
            }

            match rtype {
                WAL_ENTRY => {
                    let mut q = RECORD_HEADER_SIZE;
                    while q < size {
                        if q + 8 > size {
                            return Err(Error::Corruption("wal redo entry truncated"));
                        }
                        let rtype = LittleEndian::read_u32(&record[q..q + 4]);
                        let len = LittleEndian::read_u32(&record[q + 4..q + 8]) as usize;
                        q += 8;

                        if q + len > size {
                            return Err(Error::Corruption("wal redo payload truncated"));
                        }
                        apply(rtype, &record[q..q + len])?;
                        q += len;
                        applied += 1;
                    }
                    p += size;
                }
                WAL_JUMP => {
                    if size != JUMP_SIZE {
                        return Err(Error::Corruption("malformed wal jump record"));
                    }
                    seg_offs = LittleEndian::read_u64(&record[RECORD_HEADER_SIZE..]);
                    log::trace!("wal replay jumps to segment at page {seg_offs}");
                    continue 'segments;
                }
                _ => return Err(Error::Corruption("unknown wal record type")),
            }
        }
    }

    Ok(applied)
}

#[cfg(test)]
mod tests;
