// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The directory entry store schema.
//!
//! Dentries are keyed by `(parent, name_hash, name_len, name)`, so every
//! entry of one directory is a contiguous key range and `readdir` is a
//! single range scan. The hash keeps long names from bloating interior
//! nodes with full string comparisons on the common path.

use crate::checksum::name_hash;
use crate::lsm::Lsm;
use crate::query::{KeyOps, Query};
use crate::trans::{encode_redo, Transaction};
use crate::{Error, TYPE_DEL};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::cmp::Ordering;

/// Redo entry type for dentry updates.
pub(crate) const REDO_DENTRY: u32 = 2;

/// Fixed prefix of a dentry key: parent, hash, name length.
const KEY_HEADER: usize = 8 + 4 + 4;

/// A directory entry record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Dentry {
    pub parent: u64,
    pub ino: u64,
    pub hash: u32,
    pub kind: u32,
    pub name: Vec<u8>,
}

impl Dentry {
    #[must_use]
    pub fn new(parent: u64, name: &[u8], ino: u64, kind: u32) -> Self {
        Self {
            parent,
            ino,
            hash: name_hash(name),
            kind,
            name: name.to_vec(),
        }
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.kind & TYPE_DEL != 0
    }

    /// Marks the entry deleted; the next update writes a tombstone.
    pub fn mark_deleted(&mut self) {
        self.kind |= TYPE_DEL;
    }

    /// Variable-length key: `{parent:u64, hash:u32, size:u32, name}`.
    /// The name is not NUL-terminated.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn key(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(KEY_HEADER + self.name.len());
        buf.write_u64::<LittleEndian>(self.parent).expect("cannot fail");
        buf.write_u32::<LittleEndian>(self.hash).expect("cannot fail");
        buf.write_u32::<LittleEndian>(self.name.len() as u32)
            .expect("cannot fail");
        buf.extend_from_slice(&self.name);
        buf
    }

    /// Value: `{inode:u64, type:u32}`.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn encode_value(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12);
        buf.write_u64::<LittleEndian>(self.ino).expect("cannot fail");
        buf.write_u32::<LittleEndian>(self.kind).expect("cannot fail");
        buf
    }

    pub fn decode(key: &[u8], value: &[u8]) -> crate::Result<Self> {
        let (parent, hash, name) = split_key(key)?;

        if value.len() != 12 {
            return Err(Error::Corruption("dentry value is not 12 bytes"));
        }
        let ino = LittleEndian::read_u64(&value[0..8]);
        let kind = LittleEndian::read_u32(&value[8..12]);

        Ok(Self {
            parent,
            ino,
            hash,
            kind,
            name: name.to_vec(),
        })
    }
}

fn split_key(key: &[u8]) -> crate::Result<(u64, u32, &[u8])> {
    if key.len() < KEY_HEADER {
        return Err(Error::Corruption("dentry key shorter than header"));
    }

    let parent = LittleEndian::read_u64(&key[0..8]);
    let hash = LittleEndian::read_u32(&key[8..12]);
    let size = LittleEndian::read_u32(&key[12..16]) as usize;

    if key.len() != KEY_HEADER + size {
        return Err(Error::Corruption("dentry key size mismatch"));
    }
    Ok((parent, hash, &key[KEY_HEADER..]))
}

/// Lexicographic on `(parent, hash, size, name)`; both keys come from
/// this store, so malformed input is a debug-level surprise only.
fn dentry_cmp(a: &[u8], b: &[u8]) -> Ordering {
    let Ok((a_parent, a_hash, a_name)) = split_key(a) else {
        return a.cmp(b);
    };
    let Ok((b_parent, b_hash, b_name)) = split_key(b) else {
        return a.cmp(b);
    };

    a_parent
        .cmp(&b_parent)
        .then(a_hash.cmp(&b_hash))
        .then(a_name.len().cmp(&b_name.len()))
        .then_with(|| a_name.cmp(b_name))
}

fn dentry_deleted(_key: &[u8], value: &[u8]) -> bool {
    value.len() >= 12 && LittleEndian::read_u32(&value[8..12]) & TYPE_DEL != 0
}

/// Key operations of the dentry store.
#[must_use]
pub(crate) fn key_ops() -> KeyOps {
    KeyOps {
        cmp: dentry_cmp,
        deleted: dentry_deleted,
    }
}

/// Appends a dentry update to a transaction; a delete is an update
/// whose record carries [`TYPE_DEL`].
pub fn update_dentry(trans: &mut Transaction, dentry: &Dentry) {
    trans.append(
        REDO_DENTRY,
        &encode_redo(&dentry.key(), &dentry.encode_value()),
    );
}

struct DentryLookup {
    key: Vec<u8>,
    result: Option<Dentry>,
    error: Option<Error>,
}

impl Query for DentryLookup {
    fn cmp(&self, key: &[u8]) -> Ordering {
        dentry_cmp(key, &self.key)
    }

    fn emit(&mut self, key: &[u8], value: &[u8]) -> crate::Result<()> {
        match Dentry::decode(key, value) {
            Ok(dentry) => self.result = Some(dentry),
            Err(e) => self.error = Some(e),
        }
        Ok(())
    }
}

/// Reads the newest version of a directory entry, tombstones included.
pub(crate) fn lookup(lsm: &Lsm, parent: u64, name: &[u8]) -> crate::Result<Option<Dentry>> {
    let probe = Dentry::new(parent, name, 0, 0);
    let mut query = DentryLookup {
        key: probe.key(),
        result: None,
        error: None,
    };
    lsm.lookup(&mut query)?;

    if let Some(e) = query.error {
        return Err(e);
    }
    Ok(query.result)
}

struct DirScan {
    parent: u64,
    entries: Vec<Dentry>,
    error: Option<Error>,
}

impl Query for DirScan {
    fn cmp(&self, key: &[u8]) -> Ordering {
        match split_key(key) {
            Ok((parent, ..)) => parent.cmp(&self.parent),
            Err(_) => Ordering::Greater,
        }
    }

    fn emit(&mut self, key: &[u8], value: &[u8]) -> crate::Result<()> {
        match Dentry::decode(key, value) {
            Ok(dentry) => self.entries.push(dentry),
            Err(e) => self.error = Some(e),
        }
        Ok(())
    }
}

/// Lists a directory's live entries in hash order. Tombstoned entries
/// are already suppressed by the range scan.
pub(crate) fn read_dir(lsm: &Lsm, parent: u64) -> crate::Result<Vec<Dentry>> {
    let mut query = DirScan {
        parent,
        entries: Vec::new(),
        error: None,
    };
    lsm.range(&mut query)?;

    if let Some(e) = query.error {
        return Err(e);
    }
    Ok(query.entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn key_value_round_trip() {
        let dentry = Dentry::new(5, b"hello.txt", 77, crate::TYPE_REG);
        let back = Dentry::decode(&dentry.key(), &dentry.encode_value()).unwrap();
        assert_eq!(dentry, back);
    }

    #[test]
    fn order_groups_by_parent_first() {
        let a = Dentry::new(1, b"zzz", 1, 0);
        let b = Dentry::new(2, b"aaa", 2, 0);
        assert_eq!(Ordering::Less, dentry_cmp(&a.key(), &b.key()));
    }

    #[test]
    fn equal_hash_falls_back_to_name() {
        let mut a = Dentry::new(1, b"abc", 1, 0);
        let mut b = Dentry::new(1, b"abd", 2, 0);
        // Force a hash collision to exercise the name comparison.
        a.hash = 7;
        b.hash = 7;
        assert_eq!(Ordering::Less, dentry_cmp(&a.key(), &b.key()));
        assert_eq!(Ordering::Equal, dentry_cmp(&a.key(), &a.key()));
    }

    #[test]
    fn tombstone_predicate() {
        let mut dentry = Dentry::new(1, b"x", 9, crate::TYPE_REG);
        assert!(!dentry_deleted(&dentry.key(), &dentry.encode_value()));

        dentry.mark_deleted();
        assert!(dentry_deleted(&dentry.key(), &dentry.encode_value()));
    }
}
