// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{Ptr, ITEM_HEADER_SIZE, NODE_HEADER_SIZE};
use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Ordering;
use std::ops::Range;

/// A decoded ctree node: the raw page run plus an index of item slices.
///
/// Nodes are immutable once written, so a decoded node can be shared
/// freely (and cached) behind an `Arc`.
pub struct Node {
    buf: Box<[u8]>,
    items: Vec<Item>,
}

struct Item {
    key: Range<usize>,
    value: Range<usize>,
}

impl Node {
    /// Parses a checksum-verified page run.
    pub fn decode(buf: Vec<u8>) -> crate::Result<Self> {
        if buf.len() < NODE_HEADER_SIZE {
            return Err(crate::Error::Corruption("ctree node shorter than header"));
        }

        let count = LittleEndian::read_u32(&buf[0..4]) as usize;
        let size = LittleEndian::read_u32(&buf[4..8]) as usize;

        if size > buf.len() {
            return Err(crate::Error::Corruption("ctree node size out of bounds"));
        }

        let mut items = Vec::with_capacity(count);
        let mut pos = NODE_HEADER_SIZE;

        for _ in 0..count {
            if pos + ITEM_HEADER_SIZE > size {
                return Err(crate::Error::Corruption("ctree item header truncated"));
            }

            let key_size = LittleEndian::read_u32(&buf[pos..pos + 4]) as usize;
            let value_size = LittleEndian::read_u32(&buf[pos + 4..pos + 8]) as usize;
            pos += ITEM_HEADER_SIZE;

            if pos + key_size + value_size > size {
                return Err(crate::Error::Corruption("ctree item data truncated"));
            }

            items.push(Item {
                key: pos..pos + key_size,
                value: pos + key_size..pos + key_size + value_size,
            });
            pos += key_size + value_size;
        }

        Ok(Self {
            buf: buf.into_boxed_slice(),
            items,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn key(&self, i: usize) -> &[u8] {
        &self.buf[self.items[i].key.clone()]
    }

    #[must_use]
    pub fn value(&self, i: usize) -> &[u8] {
        &self.buf[self.items[i].value.clone()]
    }

    /// Decodes the child pointer stored in interior slot `i`.
    pub fn child(&self, i: usize) -> crate::Result<Ptr> {
        use crate::coding::Decode;

        let value = self.value(i);
        if value.len() != Ptr::DISK_SIZE {
            return Err(crate::Error::Corruption("interior slot is not a Ptr"));
        }
        Ok(Ptr::decode_from(&mut &*value)?)
    }

    /// Index of the first item whose key does not sort before the queried
    /// range (the lower bound of `cmp >= 0`).
    #[must_use]
    pub fn lower_bound<F>(&self, cmp: F) -> usize
    where
        F: Fn(&[u8]) -> Ordering,
    {
        let (mut lo, mut hi) = (0, self.items.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if cmp(self.key(mid)) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    #[allow(clippy::unwrap_used)]
    fn encode_node(items: &[(&[u8], &[u8])]) -> Vec<u8> {
        let mut buf = vec![];
        buf.write_u32::<LittleEndian>(items.len() as u32).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap();

        for (key, value) in items {
            buf.write_u32::<LittleEndian>(key.len() as u32).unwrap();
            buf.write_u32::<LittleEndian>(value.len() as u32).unwrap();
            buf.extend_from_slice(key);
            buf.extend_from_slice(value);
        }

        let size = buf.len() as u32;
        buf[4..8].copy_from_slice(&size.to_le_bytes());
        buf.resize(4096, 0);
        buf
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn decode_and_search() {
        let node = Node::decode(encode_node(&[
            (b"aa", b"1"),
            (b"bb", b"2"),
            (b"cc", b"3"),
        ]))
        .unwrap();

        assert_eq!(3, node.len());
        assert_eq!(b"bb", node.key(1));
        assert_eq!(b"3", node.value(2));

        assert_eq!(1, node.lower_bound(|k| k.cmp(b"bb" as &[u8])));
        assert_eq!(2, node.lower_bound(|k| k.cmp(b"bc" as &[u8])));
        assert_eq!(3, node.lower_bound(|k| k.cmp(b"zz" as &[u8])));
        assert_eq!(0, node.lower_bound(|k| k.cmp(b"a" as &[u8])));
    }

    #[test]
    fn truncated_node_is_corruption() {
        let mut buf = vec![0u8; 16];
        buf[0..4].copy_from_slice(&7u32.to_le_bytes());
        buf[4..8].copy_from_slice(&16u32.to_le_bytes());

        assert!(matches!(
            Node::decode(buf),
            Err(crate::Error::Corruption(_))
        ));
    }
}
