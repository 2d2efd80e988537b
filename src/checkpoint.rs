// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The checkpoint record.
//!
//! A checkpoint names everything needed to mount: the roots of both
//! typed LSMs, the WAL tail and the inode number watermark. It is
//! written to two fixed slots — primary, then backup, with a device sync
//! between them — so at most one slot can be torn by a crash; mount
//! falls back to the backup when the primary's checksum does not verify.

use crate::checksum::checksum;
use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::lsm::LsmRoots;
use crate::store::Store;
use crate::superblock::SuperBlock;
use crate::Error;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// The checkpointed view of the write-ahead log.
///
/// `head_offs` is the first segment replay starts from, `curr_offs` the
/// segment appends go to, `used` its committed bytes. Replay follows
/// JUMP records from the head and deliberately runs past `used`, so
/// synced-but-not-yet-checkpointed records are not lost.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WalPosition {
    pub head_offs: u64,
    pub curr_offs: u64,
    pub used: u32,
}

impl WalPosition {
    /// Serialized size on disk.
    pub const DISK_SIZE: usize = 20;
}

impl Encode for WalPosition {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64::<LittleEndian>(self.head_offs)?;
        writer.write_u64::<LittleEndian>(self.curr_offs)?;
        writer.write_u32::<LittleEndian>(self.used)?;
        Ok(())
    }
}

impl Decode for WalPosition {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let head_offs = reader.read_u64::<LittleEndian>()?;
        let curr_offs = reader.read_u64::<LittleEndian>()?;
        let used = reader.read_u32::<LittleEndian>()?;
        Ok(Self {
            head_offs,
            curr_offs,
            used,
        })
    }
}

/// The durable root record of the whole filesystem.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Checkpoint {
    pub gen: u64,
    pub next_ino: u64,
    pub inode_roots: LsmRoots,
    pub dentry_roots: LsmRoots,
    pub wal: WalPosition,
}

impl Checkpoint {
    /// Serialized size on disk, including the leading checksum.
    pub const DISK_SIZE: usize = 8 + 8 + 8 + 2 * LsmRoots::DISK_SIZE + WalPosition::DISK_SIZE;

    /// Serializes into a `check_size`-page buffer with the checksum
    /// stamped over the zero-padded whole.
    fn to_slot_bytes(self, slot_bytes: usize) -> crate::Result<Vec<u8>> {
        debug_assert!(slot_bytes >= Self::DISK_SIZE);

        let mut buf = vec![0u8; slot_bytes];
        let mut cursor = &mut buf[8..];
        cursor.write_u64::<LittleEndian>(self.gen)?;
        cursor.write_u64::<LittleEndian>(self.next_ino)?;
        self.inode_roots.encode_into(&mut cursor)?;
        self.dentry_roots.encode_into(&mut cursor)?;
        self.wal.encode_into(&mut cursor)?;

        let csum = checksum(&buf);
        LittleEndian::write_u64(&mut buf[0..8], csum);
        Ok(buf)
    }

    fn from_slot_bytes(mut buf: Vec<u8>) -> crate::Result<Self> {
        if buf.len() < Self::DISK_SIZE {
            return Err(Error::Corruption("checkpoint slot too small"));
        }

        let stored = LittleEndian::read_u64(&buf[0..8]);
        buf[0..8].fill(0);
        let computed = checksum(&buf);
        if stored != computed {
            return Err(Error::ChecksumMismatch(stored, computed));
        }

        let mut cursor = &buf[8..];
        let gen = cursor.read_u64::<LittleEndian>().map_err(DecodeError::Io)?;
        let next_ino = cursor.read_u64::<LittleEndian>().map_err(DecodeError::Io)?;
        let inode_roots = LsmRoots::decode_from(&mut cursor)?;
        let dentry_roots = LsmRoots::decode_from(&mut cursor)?;
        let wal = WalPosition::decode_from(&mut cursor)?;

        Ok(Self {
            gen,
            next_ino,
            inode_roots,
            dentry_roots,
            wal,
        })
    }

    fn slot_bytes(store: &Store, sb: &SuperBlock) -> usize {
        sb.check_size as usize * store.page_size()
    }

    /// Commits the checkpoint: sync, primary slot, sync, backup slot.
    ///
    /// The sync between the two writes is what guarantees that a crash
    /// can tear at most one slot.
    pub fn commit(&self, store: &Store, sb: &SuperBlock) -> crate::Result<()> {
        let page = store.page_size() as u64;
        let buf = self.to_slot_bytes(Self::slot_bytes(store, sb))?;

        store.sync()?;
        store.write(&buf, sb.check_offs * page)?;
        store.sync()?;
        store.write(&buf, sb.backup_check_offs * page)?;

        log::debug!(
            "checkpoint generation {} committed (wal head {}, tail {}+{})",
            self.gen,
            self.wal.head_offs,
            self.wal.curr_offs,
            self.wal.used,
        );
        Ok(())
    }

    fn read_slot(store: &Store, sb: &SuperBlock, offs_pages: u64) -> crate::Result<Self> {
        let mut buf = vec![0u8; Self::slot_bytes(store, sb)];
        store.read(&mut buf, offs_pages * store.page_size() as u64)?;
        Self::from_slot_bytes(buf)
    }

    /// Loads the checkpoint at mount, falling back to the backup slot.
    pub fn read(store: &Store, sb: &SuperBlock) -> crate::Result<Self> {
        match Self::read_slot(store, sb, sb.check_offs) {
            Ok(check) => Ok(check),
            Err(primary_err) => {
                log::warn!("primary checkpoint rejected ({primary_err}), trying backup");
                Self::read_slot(store, sb, sb.backup_check_offs)
                    .map_err(|_| Error::Unrecoverable)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctree::{Ptr, TreeMeta};
    use crate::store::test_util::memory_store;
    use test_log::test;

    fn sample() -> Checkpoint {
        let mut inode_roots = LsmRoots::default();
        inode_roots.tier[0] = TreeMeta {
            root: Ptr {
                offs: 11,
                size: 1,
                csum: 0xfeed,
            },
            size: 8,
            height: 1,
        };

        Checkpoint {
            gen: 7,
            next_ino: 42,
            inode_roots,
            dentry_roots: LsmRoots::default(),
            wal: WalPosition {
                head_offs: 3,
                curr_offs: 1027,
                used: 512,
            },
        }
    }

    fn test_sb() -> SuperBlock {
        SuperBlock {
            page_size: 4096,
            check_size: 1,
            check_offs: 1,
            backup_check_offs: 2,
            root: 1,
        }
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn commit_and_read_back() {
        let (_dir, store) = memory_store();
        let sb = test_sb();

        sample().commit(&store, &sb).unwrap();
        assert_eq!(sample(), Checkpoint::read(&store, &sb).unwrap());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn corrupt_primary_falls_back_to_backup() {
        let (_dir, store) = memory_store();
        let sb = test_sb();

        sample().commit(&store, &sb).unwrap();

        // Torch one byte in the primary slot.
        let mut page = vec![0u8; 4096];
        store.read(&mut page, 4096).unwrap();
        page[100] ^= 0xff;
        store.write(&page, 4096).unwrap();

        assert_eq!(sample(), Checkpoint::read(&store, &sb).unwrap());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn both_slots_gone_is_unrecoverable() {
        let (_dir, store) = memory_store();
        let sb = test_sb();

        sample().commit(&store, &sb).unwrap();

        let junk = vec![0x5au8; 4096];
        store.write(&junk, 4096).unwrap();
        store.write(&junk, 8192).unwrap();

        assert!(matches!(
            Checkpoint::read(&store, &sb),
            Err(Error::Unrecoverable)
        ));
    }
}
