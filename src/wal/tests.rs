// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::*;
use crate::store::test_util::memory_store;
use crate::trans::Transaction;
use test_log::test;

const SEGMENT: usize = 2 * 4096;

#[allow(clippy::unwrap_used)]
fn fresh_wal(store: &Arc<Store>) -> (Wal, WalPosition) {
    let offs = store.reserve(SEGMENT as u64 / 4096).unwrap();
    let pos = WalPosition {
        head_offs: offs,
        curr_offs: offs,
        used: 0,
    };
    (Wal::new(store.clone(), SEGMENT, &pos).unwrap(), pos)
}

fn record_of(rtype: u32, payload: &[u8]) -> Transaction {
    let mut trans = Transaction::new();
    trans.append(rtype, payload);
    trans.finish();
    trans
}

#[allow(clippy::unwrap_used)]
fn collect(store: &Store, pos: &WalPosition) -> Vec<(u32, Vec<u8>)> {
    let mut out = vec![];
    replay(store, SEGMENT, pos, |rtype, payload| {
        out.push((rtype, payload.to_vec()));
        Ok(())
    })
    .unwrap();
    out
}

#[test]
fn record_checksums() {
    let mut buf = vec![0u8; RECORD_HEADER_SIZE + 5];
    buf[RECORD_HEADER_SIZE..].copy_from_slice(b"hello");
    stamp_record(&mut buf, WAL_ENTRY);

    assert!(verify_record(&buf));
    assert_eq!(WAL_ENTRY, buf[0]);

    buf[14] ^= 1;
    assert!(!verify_record(&buf));
}

#[test]
#[allow(clippy::unwrap_used)]
fn append_commit_replay() {
    let (_dir, store) = memory_store();
    let (wal, start) = fresh_wal(&store);

    for i in 0u32..10 {
        let trans = record_of(i, &i.to_le_bytes());
        wal.append(trans.as_record()).unwrap();
    }
    let pos = wal.commit(false).unwrap();
    assert_eq!(start.curr_offs, pos.curr_offs);
    assert!(pos.used > 0);

    let out = collect(&store, &start);
    assert_eq!(10, out.len());
    for (i, (rtype, payload)) in out.iter().enumerate() {
        assert_eq!(i as u32, *rtype);
        assert_eq!(&(i as u32).to_le_bytes()[..], &payload[..]);
    }
}

#[test]
#[allow(clippy::unwrap_used)]
fn rotation_links_segments() {
    let (_dir, store) = memory_store();
    let (wal, start) = fresh_wal(&store);

    // Each record is ~3 KiB, so the third one cannot fit a 8 KiB
    // segment and must force a jump.
    let payload = vec![0xabu8; 3000];
    for i in 0u32..3 {
        let trans = record_of(i, &payload);
        wal.append(trans.as_record()).unwrap();
    }
    let pos = wal.commit(false).unwrap();
    assert_ne!(start.curr_offs, pos.curr_offs, "segment must have rotated");

    let out = collect(&store, &start);
    assert_eq!(3, out.len());
    assert_eq!(2, out[2].0);
}

#[test]
#[allow(clippy::unwrap_used)]
fn full_segment_minus_one_byte_still_jumps() {
    let (_dir, store) = memory_store();
    let (wal, start) = fresh_wal(&store);

    // Leave exactly one byte less than the second record would need.
    let second_total = RECORD_HEADER_SIZE + 8 + 5;
    let first_total = SEGMENT - JUMP_SIZE - second_total + 1;
    let trans = record_of(1, &vec![0u8; first_total - RECORD_HEADER_SIZE - 8]);
    wal.append(trans.as_record()).unwrap();

    let trans = record_of(2, b"spill");
    wal.append(trans.as_record()).unwrap();
    wal.commit(false).unwrap();

    let out = collect(&store, &start);
    assert_eq!(2, out.len());
    assert_eq!(b"spill".to_vec(), out[1].1);
}

#[test]
#[allow(clippy::unwrap_used)]
fn advance_head_moves_to_current_segment() {
    let (_dir, store) = memory_store();
    let (wal, start) = fresh_wal(&store);

    let payload = vec![0u8; 3000];
    for i in 0u32..3 {
        let trans = record_of(i, &payload);
        wal.append(trans.as_record()).unwrap();
    }

    let pos = wal.commit(true).unwrap();
    assert_eq!(pos.curr_offs, pos.head_offs);
    assert_ne!(start.head_offs, pos.head_offs);

    // Replay from the advanced head sees only the tail segment.
    let out = collect(&store, &pos);
    assert_eq!(1, out.len());
    assert_eq!(2, out[0].0);
}

#[test]
#[allow(clippy::unwrap_used)]
fn concurrent_writers_lose_nothing() {
    const THREADS: u32 = 4;
    const PER_THREAD: u32 = 64;

    let (_dir, store) = memory_store();
    let (wal, start) = fresh_wal(&store);

    std::thread::scope(|scope| {
        for t in 0..THREADS {
            let wal = &wal;
            scope.spawn(move || {
                let payload = vec![t as u8; 256];
                for i in 0..PER_THREAD {
                    let trans = record_of(t * PER_THREAD + i, &payload);
                    wal.append(trans.as_record()).unwrap();
                }
            });
        }
    });
    wal.commit(false).unwrap();

    let out = collect(&store, &start);
    assert_eq!((THREADS * PER_THREAD) as usize, out.len());

    // Every submitted record arrived exactly once.
    let mut seen: Vec<u32> = out.iter().map(|(rtype, _)| *rtype).collect();
    seen.sort_unstable();
    let expect: Vec<u32> = (0..THREADS * PER_THREAD).collect();
    assert_eq!(expect, seen);
}

#[test]
#[allow(clippy::unwrap_used)]
fn replay_stops_at_corruption() {
    let (_dir, store) = memory_store();
    let (wal, start) = fresh_wal(&store);

    for i in 0u32..4 {
        let trans = record_of(i, b"payload");
        wal.append(trans.as_record()).unwrap();
    }
    let pos = wal.commit(false).unwrap();

    // Flip a byte inside the third record.
    let record_len = (RECORD_HEADER_SIZE + 8 + 7) as u64;
    let mut page = vec![0u8; 4096];
    store.read(&mut page, start.curr_offs * 4096).unwrap();
    page[(2 * record_len + RECORD_HEADER_SIZE as u64 + 2) as usize] ^= 0xff;
    store.write(&page, start.curr_offs * 4096).unwrap();

    let out = collect(&store, &start);
    assert_eq!(2, out.len(), "replay must stop at the first bad checksum");
    let _unused = pos;
}
