// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The inode store schema.
//!
//! Inodes live in their own typed LSM keyed by the inode number. The
//! engine never interprets the value beyond the tombstone bit; the
//! layout below is the contract with the filesystem layer above.

use crate::lsm::Lsm;
use crate::query::{KeyOps, Query};
use crate::trans::{encode_redo, Transaction};
use crate::Error;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::cmp::Ordering;

/// Tombstone bit in the inode (and dentry) type field.
pub const TYPE_DEL: u32 = 1 << 0;

/// Directory inode.
pub const TYPE_DIR: u32 = 0o040_000;

/// Regular file inode.
pub const TYPE_REG: u32 = 0o100_000;

/// The root directory's inode number.
pub const ROOT_INO: u64 = 1;

/// Redo entry type for inode updates.
pub(crate) const REDO_INODE: u32 = 1;

/// One block mapping: which disk page backs which file page.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BmapEntry {
    pub disk_offs: u64,
    pub file_offs: u64,
}

/// An inode record.
///
/// Timestamps are in milliseconds since the Unix epoch. An inode whose
/// `kind` carries [`TYPE_DEL`] is a tombstone: it shadows older versions
/// until a merge into the oldest tier drops it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Inode {
    pub ino: u64,
    pub size: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub links: u32,
    pub kind: u32,
    pub uid: u32,
    pub gid: u32,
    pub perm: u32,
    pub bmap: Vec<BmapEntry>,
}

impl Inode {
    #[must_use]
    pub fn new(ino: u64, kind: u32) -> Self {
        let now = crate::now();
        Self {
            ino,
            kind,
            mtime: now,
            ctime: now,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.kind & TYPE_DEL != 0
    }

    /// Marks the inode as deleted; the next update writes a tombstone.
    pub fn mark_deleted(&mut self) {
        self.kind |= TYPE_DEL;
    }

    #[must_use]
    pub fn key(&self) -> [u8; 8] {
        self.ino.to_le_bytes()
    }

    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn encode_value(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(44 + self.bmap.len() * 16);

        buf.write_u64::<LittleEndian>(self.size).expect("cannot fail");
        buf.write_u64::<LittleEndian>(self.mtime).expect("cannot fail");
        buf.write_u64::<LittleEndian>(self.ctime).expect("cannot fail");
        buf.write_u32::<LittleEndian>(self.links).expect("cannot fail");
        buf.write_u32::<LittleEndian>(self.kind).expect("cannot fail");
        buf.write_u32::<LittleEndian>(self.uid).expect("cannot fail");
        buf.write_u32::<LittleEndian>(self.gid).expect("cannot fail");
        buf.write_u32::<LittleEndian>(self.perm).expect("cannot fail");
        buf.write_u32::<LittleEndian>(self.bmap.len() as u32)
            .expect("cannot fail");
        for entry in &self.bmap {
            buf.write_u64::<LittleEndian>(entry.disk_offs)
                .expect("cannot fail");
            buf.write_u64::<LittleEndian>(entry.file_offs)
                .expect("cannot fail");
        }
        buf
    }

    pub fn decode(key: &[u8], value: &[u8]) -> crate::Result<Self> {
        if key.len() != 8 {
            return Err(Error::Corruption("inode key is not 8 bytes"));
        }
        let ino = LittleEndian::read_u64(key);

        fn short(_: std::io::Error) -> Error {
            Error::Corruption("short inode value")
        }

        let mut cursor = value;
        let size = cursor.read_u64::<LittleEndian>().map_err(short)?;
        let mtime = cursor.read_u64::<LittleEndian>().map_err(short)?;
        let ctime = cursor.read_u64::<LittleEndian>().map_err(short)?;
        let links = cursor.read_u32::<LittleEndian>().map_err(short)?;
        let kind = cursor.read_u32::<LittleEndian>().map_err(short)?;
        let uid = cursor.read_u32::<LittleEndian>().map_err(short)?;
        let gid = cursor.read_u32::<LittleEndian>().map_err(short)?;
        let perm = cursor.read_u32::<LittleEndian>().map_err(short)?;
        let bmap_len = cursor.read_u32::<LittleEndian>().map_err(short)? as usize;

        if cursor.len() != bmap_len * 16 {
            return Err(Error::Corruption("inode bmap size mismatch"));
        }

        let mut bmap = Vec::with_capacity(bmap_len);
        for _ in 0..bmap_len {
            let disk_offs = cursor.read_u64::<LittleEndian>().map_err(short)?;
            let file_offs = cursor.read_u64::<LittleEndian>().map_err(short)?;
            bmap.push(BmapEntry {
                disk_offs,
                file_offs,
            });
        }

        Ok(Self {
            ino,
            size,
            mtime,
            ctime,
            links,
            kind,
            uid,
            gid,
            perm,
            bmap,
        })
    }
}

fn inode_cmp(a: &[u8], b: &[u8]) -> Ordering {
    debug_assert_eq!(8, a.len());
    debug_assert_eq!(8, b.len());
    LittleEndian::read_u64(a).cmp(&LittleEndian::read_u64(b))
}

fn inode_deleted(_key: &[u8], value: &[u8]) -> bool {
    // The type field sits behind size/mtime/ctime/links.
    value.len() >= 32 && LittleEndian::read_u32(&value[28..32]) & TYPE_DEL != 0
}

/// Key operations of the inode store.
#[must_use]
pub(crate) fn key_ops() -> KeyOps {
    KeyOps {
        cmp: inode_cmp,
        deleted: inode_deleted,
    }
}

/// Appends an inode update to a transaction. The same call covers
/// create, update and delete — a delete is an update whose record
/// carries [`TYPE_DEL`].
pub fn update_inode(trans: &mut Transaction, inode: &Inode) {
    trans.append(
        REDO_INODE,
        &encode_redo(&inode.key(), &inode.encode_value()),
    );
}

struct InodeLookup {
    key: [u8; 8],
    result: Option<Inode>,
    error: Option<Error>,
}

impl Query for InodeLookup {
    fn cmp(&self, key: &[u8]) -> Ordering {
        // Must agree with the store's key order, which is numeric.
        inode_cmp(key, &self.key)
    }

    fn emit(&mut self, key: &[u8], value: &[u8]) -> crate::Result<()> {
        match Inode::decode(key, value) {
            Ok(inode) => self.result = Some(inode),
            Err(e) => self.error = Some(e),
        }
        Ok(())
    }
}

/// Reads the newest version of an inode, tombstones included; the
/// caller decides what a deleted inode means.
pub(crate) fn lookup(lsm: &Lsm, ino: u64) -> crate::Result<Option<Inode>> {
    let mut query = InodeLookup {
        key: ino.to_le_bytes(),
        result: None,
        error: None,
    };
    lsm.lookup(&mut query)?;

    if let Some(e) = query.error {
        return Err(e);
    }
    Ok(query.result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn value_round_trip() {
        let mut inode = Inode::new(7, TYPE_REG);
        inode.links = 2;
        inode.size = 12345;
        inode.uid = 1000;
        inode.gid = 100;
        inode.perm = 0o644;
        inode.bmap.push(BmapEntry {
            disk_offs: 99,
            file_offs: 0,
        });

        let back = Inode::decode(&inode.key(), &inode.encode_value()).unwrap();
        assert_eq!(inode, back);
    }

    #[test]
    fn tombstone_predicate() {
        let mut inode = Inode::new(7, TYPE_REG);
        assert!(!inode_deleted(&inode.key(), &inode.encode_value()));

        inode.mark_deleted();
        assert!(inode.is_deleted());
        assert!(inode_deleted(&inode.key(), &inode.encode_value()));
    }

    #[test]
    fn keys_order_numerically() {
        let a = Inode::new(2, TYPE_REG);
        let b = Inode::new(256, TYPE_REG);
        // Little-endian keys would compare wrong lexicographically.
        assert_eq!(Ordering::Less, inode_cmp(&a.key(), &b.key()));
    }
}
