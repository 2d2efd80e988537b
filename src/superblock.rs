// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::store::Store;
use crate::{Error, MAGIC};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// The container super-block at byte offset 0.
///
/// Fits in the first 512 bytes and is written once at format time; it
/// only locates the two checkpoint slots and fixes the page geometry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SuperBlock {
    pub page_size: u32,

    /// Checkpoint slot size in pages.
    pub check_size: u32,

    /// Primary checkpoint slot, in pages.
    pub check_offs: u64,

    /// Backup checkpoint slot, in pages.
    pub backup_check_offs: u64,

    /// Root directory inode number.
    pub root: u64,
}

/// The super-block occupies one 512-byte sector.
pub(crate) const SUPERBLOCK_BYTES: usize = 512;

impl Encode for SuperBlock {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u32::<LittleEndian>(MAGIC)?;
        writer.write_u32::<LittleEndian>(self.page_size)?;
        writer.write_u32::<LittleEndian>(self.check_size)?;
        writer.write_u64::<LittleEndian>(self.check_offs)?;
        writer.write_u64::<LittleEndian>(self.backup_check_offs)?;
        writer.write_u64::<LittleEndian>(self.root)?;
        Ok(())
    }
}

impl Decode for SuperBlock {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != MAGIC {
            return Err(DecodeError::InvalidHeader("bad filesystem magic"));
        }

        let page_size = reader.read_u32::<LittleEndian>()?;
        if !page_size.is_power_of_two() || page_size < SUPERBLOCK_BYTES as u32 {
            return Err(DecodeError::InvalidHeader("bad page size"));
        }

        let check_size = reader.read_u32::<LittleEndian>()?;
        let check_offs = reader.read_u64::<LittleEndian>()?;
        let backup_check_offs = reader.read_u64::<LittleEndian>()?;
        let root = reader.read_u64::<LittleEndian>()?;

        Ok(Self {
            page_size,
            check_size,
            check_offs,
            backup_check_offs,
            root,
        })
    }
}

impl SuperBlock {
    /// Writes the super-block sector.
    pub fn commit(&self, store: &Store) -> crate::Result<()> {
        let mut buf = vec![0u8; SUPERBLOCK_BYTES];
        let mut cursor = &mut buf[..];
        self.encode_into(&mut cursor)?;
        store.write_sync(&buf, 0)
    }

    /// Reads and validates the super-block sector.
    pub fn read(store: &Store) -> crate::Result<Self> {
        let mut buf = vec![0u8; SUPERBLOCK_BYTES];
        store.read(&mut buf, 0)?;

        Self::decode_from(&mut &buf[..]).map_err(|e| match e {
            DecodeError::InvalidHeader(what) => Error::Corruption(what),
            other => Error::Decode(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_util::memory_store;
    use test_log::test;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn round_trip() {
        let (_dir, store) = memory_store();

        let sb = SuperBlock {
            page_size: 4096,
            check_size: 1,
            check_offs: 1,
            backup_check_offs: 2,
            root: 1,
        };
        sb.commit(&store).unwrap();

        assert_eq!(sb, SuperBlock::read(&store).unwrap());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn rejects_foreign_magic() {
        let (_dir, store) = memory_store();

        let junk = vec![0x42u8; SUPERBLOCK_BYTES];
        store.write(&junk, 0).unwrap();

        assert!(matches!(
            SuperBlock::read(&store),
            Err(Error::Corruption(_))
        ));
    }
}
