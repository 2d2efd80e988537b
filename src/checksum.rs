// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Every checksum in the store is an xxhash seeded with the filesystem
//! magic, so a buffer copied byte-for-byte from a foreign image never
//! verifies by accident.

use crate::MAGIC;
use xxhash_rust::{xxh32::xxh32, xxh64::xxh64, xxh64::Xxh64};

/// Checksums a buffer the way every on-disk structure does (pages, WAL
/// records, checkpoints).
#[must_use]
pub fn checksum(buf: &[u8]) -> u64 {
    xxh64(buf, u64::from(MAGIC))
}

/// The 32-bit hash used as the middle component of dentry keys.
#[must_use]
pub fn name_hash(name: &[u8]) -> u32 {
    xxh32(name, MAGIC)
}

/// Streaming variant of [`checksum`] for records whose csum field has to
/// be hashed as zeroes.
pub struct ChecksumHasher(Xxh64);

impl Default for ChecksumHasher {
    fn default() -> Self {
        Self(Xxh64::new(u64::from(MAGIC)))
    }
}

impl ChecksumHasher {
    pub fn update(&mut self, buf: &[u8]) {
        self.0.update(buf);
    }

    #[must_use]
    pub fn finish(self) -> u64 {
        self.0.digest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_matches_oneshot() {
        let buf = b"the quick brown fox jumps over the lazy dog";

        let mut hasher = ChecksumHasher::default();
        hasher.update(&buf[..10]);
        hasher.update(&buf[10..]);

        assert_eq!(checksum(buf), hasher.finish());
    }

    #[test]
    fn seeded() {
        // A plain unseeded xxh64 must not verify.
        assert_ne!(checksum(b"abc"), xxhash_rust::xxh64::xxh64(b"abc", 0));
    }
}
