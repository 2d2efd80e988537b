// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

#![allow(unsafe_code)]

//! Transactions and their submission queue.
//!
//! A [`Transaction`] is an opaque redo buffer: the client appends typed
//! entries, submits, and waits on the returned [`TransHandle`] until the
//! log worker has made the record durable and applied it. Submission
//! pushes onto a lock-free LIFO stack; the worker splices the stack out
//! and reverses it, so the WAL order within a batch matches submission
//! order.

use crate::stop_signal::StopSignal;
use crate::wal::{stamp_record, MAX_TRANSACTION_SIZE, RECORD_HEADER_SIZE, WAL_ENTRY};
use byteorder::{ByteOrder, LittleEndian};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

const STATUS_PENDING: i8 = 0;
const STATUS_OK: i8 = 1;
const STATUS_FAILED: i8 = -1;

struct TransShared {
    status: Mutex<i8>,
    cv: Condvar,
}

/// The waiting half of a submitted transaction.
#[derive(Clone)]
pub struct TransHandle(Arc<TransShared>);

impl TransHandle {
    /// Blocks until the log worker resolved the transaction.
    ///
    /// `Ok` means the redo record is durable on disk and applied to the
    /// in-memory trees; [`crate::Error::Aborted`] means its batch failed.
    #[allow(clippy::expect_used)]
    pub fn wait(&self) -> crate::Result<()> {
        let mut status = self.0.status.lock().expect("lock poisoned");
        while *status == STATUS_PENDING {
            status = self.0.cv.wait(status).expect("lock poisoned");
        }

        if *status == STATUS_OK {
            Ok(())
        } else {
            Err(crate::Error::Aborted)
        }
    }
}

/// A redo record under construction.
///
/// The buffer starts with space for the WAL record header; every entry
/// is `{type:u32, size:u32, bytes}`. `finish` stamps the header and the
/// checksum, after which the buffer is an ENTRY record ready for the
/// log.
pub struct Transaction {
    buf: Vec<u8>,
    shared: Arc<TransShared>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; RECORD_HEADER_SIZE],
            shared: Arc::new(TransShared {
                status: Mutex::new(STATUS_PENDING),
                cv: Condvar::new(),
            }),
        }
    }

    /// Appends one typed redo entry. Panics if the transaction would
    /// outgrow the record size limit — that is a caller bug, not a
    /// runtime condition.
    pub fn append(&mut self, rtype: u32, payload: &[u8]) {
        assert!(
            self.buf.len() + 8 + payload.len() <= MAX_TRANSACTION_SIZE,
            "transaction exceeds the record size limit"
        );

        let mut header = [0u8; 8];
        LittleEndian::write_u32(&mut header[0..4], rtype);
        LittleEndian::write_u32(&mut header[4..8], payload.len() as u32);
        self.buf.extend_from_slice(&header);
        self.buf.extend_from_slice(payload);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.len() == RECORD_HEADER_SIZE
    }

    /// The waiting half; grab it before submitting.
    #[must_use]
    pub fn handle(&self) -> TransHandle {
        TransHandle(self.shared.clone())
    }

    /// Stamps the ENTRY header; the buffer is a complete WAL record
    /// afterwards.
    pub(crate) fn finish(&mut self) {
        stamp_record(&mut self.buf, WAL_ENTRY);
    }

    pub(crate) fn as_record(&self) -> &[u8] {
        &self.buf
    }

    /// Iterates the typed redo entries.
    pub(crate) fn entries(&self) -> EntryIter<'_> {
        EntryIter {
            buf: &self.buf,
            pos: RECORD_HEADER_SIZE,
        }
    }

    #[allow(clippy::expect_used)]
    pub(crate) fn resolve(&self, ok: bool) {
        let mut status = self.shared.status.lock().expect("lock poisoned");
        *status = if ok { STATUS_OK } else { STATUS_FAILED };
        self.shared.cv.notify_all();
    }
}

pub(crate) struct EntryIter<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for EntryIter<'a> {
    type Item = (u32, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos + 8 > self.buf.len() {
            return None;
        }

        let rtype = LittleEndian::read_u32(&self.buf[self.pos..self.pos + 4]);
        let len = LittleEndian::read_u32(&self.buf[self.pos + 4..self.pos + 8]) as usize;
        self.pos += 8;

        let payload = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Some((rtype, payload))
    }
}

/// Packs a key/value pair into a redo entry payload:
/// `{key_size:u32, key, value}`.
pub(crate) fn encode_redo(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + key.len() + value.len());
    let mut len = [0u8; 4];
    LittleEndian::write_u32(&mut len, key.len() as u32);
    buf.extend_from_slice(&len);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    buf
}

/// The inverse of [`encode_redo`].
pub(crate) fn decode_redo(payload: &[u8]) -> crate::Result<(&[u8], &[u8])> {
    if payload.len() < 4 {
        return Err(crate::Error::Corruption("redo entry shorter than header"));
    }
    let key_len = LittleEndian::read_u32(&payload[0..4]) as usize;
    if 4 + key_len > payload.len() {
        return Err(crate::Error::Corruption("redo entry key out of bounds"));
    }
    Ok((&payload[4..4 + key_len], &payload[4 + key_len..]))
}

struct QueueNode {
    trans: Transaction,
    next: *mut QueueNode,
}

/// Lock-free LIFO submission stack with a condvar for worker wakeups.
pub(crate) struct TransQueue {
    head: AtomicPtr<QueueNode>,
    gate: Mutex<()>,
    cv: Condvar,
}

unsafe impl Send for TransQueue {}
unsafe impl Sync for TransQueue {}

impl TransQueue {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            gate: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Pushes a finished transaction and nudges the worker.
    pub fn push(&self, trans: Transaction) {
        let node = Box::into_raw(Box::new(QueueNode {
            trans,
            next: ptr::null_mut(),
        }));

        loop {
            let head = self.head.load(Ordering::Acquire);
            unsafe {
                (*node).next = head;
            }
            if self
                .head
                .compare_exchange(head, node, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }

        #[allow(clippy::expect_used)]
        let _gate = self.gate.lock().expect("lock poisoned");
        self.cv.notify_one();
    }

    /// Splices the whole stack out, reversed into submission order.
    pub fn take_all(&self) -> Vec<Transaction> {
        let mut head = self.head.swap(ptr::null_mut(), Ordering::Acquire);

        let mut batch = Vec::new();
        while !head.is_null() {
            let node = unsafe { Box::from_raw(head) };
            head = node.next;
            batch.push(node.trans);
        }
        batch.reverse();
        batch
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Parks the worker until work arrives or the stop signal fires.
    #[allow(clippy::expect_used)]
    pub fn wait(&self, stop: &StopSignal) {
        let gate = self.gate.lock().expect("lock poisoned");
        if !self.is_empty() || stop.is_stopped() {
            return;
        }
        // The timeout bounds the window of a wakeup racing the push.
        let _unused = self
            .cv
            .wait_timeout(gate, Duration::from_millis(100))
            .expect("lock poisoned");
    }

    /// Wakes the worker without queueing anything (shutdown).
    #[allow(clippy::expect_used)]
    pub fn wake(&self) {
        let _gate = self.gate.lock().expect("lock poisoned");
        self.cv.notify_all();
    }
}

impl Drop for TransQueue {
    fn drop(&mut self) {
        for trans in self.take_all() {
            trans.resolve(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::verify_record;

    #[test]
    fn entries_round_trip() {
        let mut trans = Transaction::new();
        trans.append(1, b"first");
        trans.append(2, b"second");
        trans.finish();

        assert!(verify_record(trans.as_record()));

        let entries: Vec<_> = trans.entries().collect();
        assert_eq!(2, entries.len());
        assert_eq!((1, b"first" as &[u8]), entries[0]);
        assert_eq!((2, b"second" as &[u8]), entries[1]);
    }

    #[test]
    fn queue_restores_submission_order() {
        let queue = TransQueue::new();

        for i in 0u32..4 {
            let mut trans = Transaction::new();
            trans.append(i, &i.to_le_bytes());
            queue.push(trans);
        }

        let batch = queue.take_all();
        assert!(queue.is_empty());

        let order: Vec<u32> = batch
            .iter()
            .map(|t| t.entries().next().map(|(rtype, _)| rtype).unwrap_or(99))
            .collect();
        assert_eq!(vec![0, 1, 2, 3], order);
    }

    #[test]
    fn handle_resolution() {
        let mut trans = Transaction::new();
        trans.append(1, b"x");
        let handle = trans.handle();

        trans.resolve(true);
        assert!(handle.wait().is_ok());

        let trans = Transaction::new();
        let handle = trans.handle();
        trans.resolve(false);
        assert!(matches!(handle.wait(), Err(crate::Error::Aborted)));
    }
}
