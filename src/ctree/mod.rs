// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Immutable on-disk sorted runs.
//!
//! A ctree is written once by a [`Builder`] from a strictly sorted
//! key/value stream and read forever after through [`TreeIter`] (or the
//! [`lookup`]/[`range`] shortcuts). Nodes are page runs: a small header,
//! then length-prefixed items, then zero padding. Leaves hold caller
//! payload; interior nodes hold, per child, the child's first key and a
//! verifiable [`Ptr`] to it.

mod builder;
mod iter;
pub(crate) mod node;

pub use builder::Builder;
pub use iter::{lookup, range, TreeIter};

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Maximum number of node levels in a single tree.
pub const MAX_HEIGHT: usize = 8;

/// Minimum number of items a node accumulates before it is allowed to
/// close at a page boundary.
pub const MIN_FANOUT: usize = 16;

/// Byte size of a node header on disk (`items:u32, size:u32`).
pub(crate) const NODE_HEADER_SIZE: usize = 8;

/// Byte size of an item header on disk (`key_size:u32, value_size:u32`).
pub(crate) const ITEM_HEADER_SIZE: usize = 8;

/// A durable pointer to a run of pages.
///
/// `offs` and `size` are in pages; `csum` is the seeded xxh64 of the
/// whole run and is verified on every read.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Ptr {
    pub offs: u64,
    pub size: u64,
    pub csum: u64,
}

impl Ptr {
    /// Serialized size on disk.
    pub const DISK_SIZE: usize = 24;

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.size == 0
    }
}

impl Encode for Ptr {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64::<LittleEndian>(self.offs)?;
        writer.write_u64::<LittleEndian>(self.size)?;
        writer.write_u64::<LittleEndian>(self.csum)?;
        Ok(())
    }
}

impl Decode for Ptr {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let offs = reader.read_u64::<LittleEndian>()?;
        let size = reader.read_u64::<LittleEndian>()?;
        let csum = reader.read_u64::<LittleEndian>()?;
        Ok(Self { offs, size, csum })
    }
}

/// The super-block of one tree: its root pointer, total size in pages and
/// height in levels.
///
/// Height 0 is the empty tree; height 1 is a single leaf. The height
/// counts node levels, so the iterator descends `height - 1` interior
/// levels before it reaches payload.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TreeMeta {
    pub root: Ptr,
    pub size: u64,
    pub height: u32,
}

impl TreeMeta {
    /// Serialized size on disk.
    pub const DISK_SIZE: usize = Ptr::DISK_SIZE + 8 + 4;

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.height == 0
    }
}

impl Encode for TreeMeta {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        self.root.encode_into(writer)?;
        writer.write_u64::<LittleEndian>(self.size)?;
        writer.write_u32::<LittleEndian>(self.height)?;
        Ok(())
    }
}

impl Decode for TreeMeta {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let root = Ptr::decode_from(reader)?;
        let size = reader.read_u64::<LittleEndian>()?;
        let height = reader.read_u32::<LittleEndian>()?;

        if height as usize > MAX_HEIGHT {
            return Err(DecodeError::InvalidHeader("ctree height out of range"));
        }
        Ok(Self { root, size, height })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn meta_round_trip() {
        let meta = TreeMeta {
            root: Ptr {
                offs: 17,
                size: 2,
                csum: 0xdead_beef,
            },
            size: 1024,
            height: 3,
        };

        let buf = meta.encode_into_vec();
        assert_eq!(TreeMeta::DISK_SIZE, buf.len());

        let back = TreeMeta::decode_from(&mut &buf[..]).unwrap();
        assert_eq!(meta, back);
    }

    #[test]
    fn meta_rejects_absurd_height() {
        let meta = TreeMeta {
            root: Ptr::default(),
            size: 0,
            height: 9,
        };

        let buf = meta.encode_into_vec();
        assert!(TreeMeta::decode_from(&mut &buf[..]).is_err());
    }
}
