// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A persistent, single-node filesystem metadata store built on LSM-trees.
//!
//! ##### About
//!
//! `silt` keeps filesystem metadata (inodes and directory entries) in two
//! typed log-structured merge trees that live side by side on a single
//! block device image. Mutations are packaged into transactions, made
//! durable through a segmented write-ahead log, and only then applied to
//! the in-memory write buffers. Background work flushes those buffers into
//! immutable on-disk sorted runs ("ctrees") and merges runs down a small
//! tier hierarchy. A checkpoint record — written twice, with a sync in
//! between — names the roots of every tree plus the WAL tail, so a crash
//! at any instant recovers to a consistent, acknowledged state.
//!
//! The crate is a storage engine, not a filesystem: POSIX semantics,
//! FUSE plumbing and file data placement belong to a layer above and only
//! show up here as the two typed key/value schemas.
//!
//! # Example
//!
//! ```no_run
//! use silt::{Config, Inode, Transaction};
//!
//! # fn main() -> silt::Result<()> {
//! let fs = Config::new("/tmp/silt.img").format()?;
//!
//! let mut inode = Inode::new(fs.allocate_ino(), silt::TYPE_REG);
//! inode.links = 1;
//!
//! let mut trans = Transaction::new();
//! silt::update_inode(&mut trans, &inode);
//!
//! // Blocks until the redo record is on disk.
//! fs.submit(trans).wait()?;
//!
//! assert!(fs.read_inode(inode.ino)?.is_some());
//! fs.close()?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]

mod alloc;
pub mod block;
mod checkpoint;
mod checksum;
mod coding;
mod config;
pub mod ctree;
mod dentry;
mod error;
mod fs;
mod inode;
pub mod lsm;
pub mod memtable;
mod query;
mod stop_signal;
mod store;
mod superblock;
mod trans;
pub mod wal;

pub use {
    alloc::PageAllocator,
    checkpoint::{Checkpoint, WalPosition},
    config::Config,
    dentry::{update_dentry, Dentry},
    error::{Error, Result},
    fs::Fs,
    inode::{update_inode, BmapEntry, Inode, ROOT_INO, TYPE_DEL, TYPE_DIR, TYPE_REG},
    memtable::Memtable,
    query::{KeyOps, Query},
    store::Store,
    superblock::SuperBlock,
    trans::{TransHandle, Transaction},
};

/// The magic number stamped into the container super-block; it also seeds
/// every checksum in the filesystem.
pub const MAGIC: u32 = 0x1313_1313;

/// Rounds `x` down to a multiple of `align` (which must be a power of two).
#[must_use]
pub fn align_down(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    x & !(align - 1)
}

/// Rounds `x` up to a multiple of `align` (which must be a power of two).
#[must_use]
pub fn align_up(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    align_down(x + align - 1, align)
}

/// Milliseconds since the Unix epoch, the timestamp unit of inode records.
#[must_use]
#[allow(clippy::expect_used)]
pub fn now() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock is before the Unix epoch");

    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod lib_tests {
    use super::*;

    #[test]
    fn alignment() {
        assert_eq!(0, align_down(4095, 4096));
        assert_eq!(4096, align_up(4095, 4096));
        assert_eq!(4096, align_up(4096, 4096));
        assert_eq!(8192, align_up(4097, 4096));
        assert_eq!(0, align_up(0, 4096));
    }
}
