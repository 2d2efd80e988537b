// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{Ptr, TreeMeta, ITEM_HEADER_SIZE, MAX_HEIGHT, NODE_HEADER_SIZE};
use crate::checksum::checksum;
use crate::coding::Encode;
use crate::store::Store;
use crate::{align_up, Error};
use byteorder::{ByteOrder, LittleEndian};

/// Bytes a level accumulates before its closed nodes are written out in
/// one batch.
const LEVEL_FLUSH_THRESHOLD: usize = 1024 * 1024;

/// Turns a strictly sorted key/value stream into an immutable on-disk
/// tree.
///
/// Each level buffers whole nodes in memory. Closing a node stamps its
/// header and pads it to a page multiple; once a level holds about a
/// megabyte of closed nodes they are written with a single reservation
/// and, for every node, a separator entry (the node's largest key and a
/// [`Ptr`] to it) is pushed into the level above. `finish` drains the
/// partial state bottom-up and returns the tree super-block.
pub struct Builder<'a> {
    store: &'a Store,
    levels: Vec<Level>,
    meta: TreeMeta,
}

#[derive(Default)]
struct Level {
    drafts: Vec<Draft>,
    buf: Vec<u8>,
}

/// Bookkeeping for one in-progress node inside a level buffer. Offsets
/// of the separator key/value are relative to the node start.
#[derive(Default)]
struct Draft {
    buf_offs: usize,
    buf_size: usize,
    entries: u32,
    key_offs: usize,
    key_len: usize,
    value_offs: usize,
    value_len: usize,
}

impl<'a> Builder<'a> {
    #[must_use]
    pub fn new(store: &'a Store) -> Self {
        Self {
            store,
            levels: Vec::new(),
            meta: TreeMeta::default(),
        }
    }

    /// Appends the next entry; keys must arrive in strictly ascending
    /// order.
    pub fn append(&mut self, key: &[u8], value: &[u8]) -> crate::Result<()> {
        self.append_level(0, key, value)
    }

    /// Flushes all partial state and returns the finished super-block.
    pub fn finish(mut self) -> crate::Result<TreeMeta> {
        if self.meta.height == 0 && self.levels.first().is_none_or(|l| l.drafts.is_empty()) {
            return Ok(TreeMeta::default());
        }

        let mut lvl = 0;
        while lvl <= self.meta.height as usize {
            let height = self.meta.height as usize;
            let level = &self.levels[lvl];

            // The run converged: a single top node holding a single
            // separator, whose value already is the root pointer.
            if height > 0
                && lvl == height
                && level.drafts.len() == 1
                && level.drafts[0].entries == 1
            {
                break;
            }

            if !level.drafts.is_empty() {
                self.finish_node(lvl);
                self.flush_level(lvl)?;
            }
            lvl += 1;
        }

        let level = &self.levels[self.meta.height as usize];
        let draft = &level.drafts[0];
        let value = &level.buf[draft.buf_offs + draft.value_offs..][..draft.value_len];

        if value.len() != Ptr::DISK_SIZE {
            return Err(Error::Corruption("builder top entry is not a Ptr"));
        }
        self.meta.root = {
            use crate::coding::Decode;
            Ptr::decode_from(&mut &*value)?
        };

        Ok(self.meta)
    }

    fn ensure_level(&mut self, lvl: usize) {
        while self.levels.len() <= lvl {
            self.levels.push(Level::default());
        }
    }

    fn page_size(&self) -> usize {
        self.store.page_size()
    }

    /// A node may close once it carries at least `fanout` entries and the
    /// next entry would spill past its page padding.
    fn node_full(&self, entries: u32, buf_size: usize, add: usize) -> bool {
        if (entries as usize) < self.store.fanout() {
            return false;
        }
        let aligned = align_up(buf_size as u64, self.page_size() as u64) as usize;
        aligned - buf_size < add
    }

    /// Stamps the last node's header and pads it to a page multiple.
    fn finish_node(&mut self, lvl: usize) {
        let page_size = self.page_size();
        let level = &mut self.levels[lvl];
        #[allow(clippy::expect_used)]
        let draft = level.drafts.last_mut().expect("level has an open node");

        let aligned = align_up(draft.buf_size as u64, page_size as u64) as usize;
        level.buf.resize(draft.buf_offs + aligned, 0);

        let header = &mut level.buf[draft.buf_offs..draft.buf_offs + NODE_HEADER_SIZE];
        LittleEndian::write_u32(&mut header[0..4], draft.entries);
        LittleEndian::write_u32(&mut header[4..8], draft.buf_size as u32);

        draft.buf_size = aligned;
    }

    /// Closes the current node and, if the level is past the flush
    /// threshold, writes its nodes out. Then opens a fresh node.
    fn add_node(&mut self, lvl: usize) -> crate::Result<()> {
        if !self.levels[lvl].drafts.is_empty() {
            self.finish_node(lvl);
        }

        let threshold = align_up(LEVEL_FLUSH_THRESHOLD as u64, self.page_size() as u64) as usize;
        if self.levels[lvl].buf.len() >= threshold {
            self.flush_level(lvl)?;
        }

        let level = &mut self.levels[lvl];
        level.drafts.push(Draft {
            buf_offs: level.buf.len(),
            buf_size: NODE_HEADER_SIZE,
            ..Draft::default()
        });
        level.buf.extend_from_slice(&[0u8; NODE_HEADER_SIZE]);
        Ok(())
    }

    /// Writes every closed node of the level in one batch and pushes a
    /// separator per node into the level above.
    fn flush_level(&mut self, lvl: usize) -> crate::Result<()> {
        if self.levels[lvl].drafts.is_empty() {
            return Ok(());
        }

        let page_size = self.page_size() as u64;
        let bytes = self.levels[lvl].buf.len();
        let pages = bytes as u64 / page_size;

        let offs = self.store.reserve(pages)?;
        self.store
            .write(&self.levels[lvl].buf, offs * page_size)?;

        let mut separators = Vec::with_capacity(self.levels[lvl].drafts.len());
        let mut node_offs = offs;

        {
            let level = &self.levels[lvl];
            for draft in &level.drafts {
                let node = &level.buf[draft.buf_offs..draft.buf_offs + draft.buf_size];
                let ptr = Ptr {
                    offs: node_offs,
                    size: draft.buf_size as u64 / page_size,
                    csum: checksum(node),
                };
                node_offs += ptr.size;

                let key = node[draft.key_offs..draft.key_offs + draft.key_len].to_vec();
                separators.push((key, ptr));
            }
        }

        let level = &mut self.levels[lvl];
        level.drafts.clear();
        level.buf.clear();
        self.meta.size += pages;

        for (key, ptr) in separators {
            let value = ptr.encode_into_vec();
            self.append_level(lvl + 1, &key, &value)?;
        }
        Ok(())
    }

    fn append_level(&mut self, lvl: usize, key: &[u8], value: &[u8]) -> crate::Result<()> {
        if lvl > MAX_HEIGHT {
            return Err(Error::Corruption("ctree exceeds maximum height"));
        }
        self.ensure_level(lvl);

        let add = ITEM_HEADER_SIZE + key.len() + value.len();
        let need_node = self.levels[lvl]
            .drafts
            .last()
            .is_none_or(|d| self.node_full(d.entries, d.buf_size, add));
        if need_node {
            self.add_node(lvl)?;
        }

        let level = &mut self.levels[lvl];
        #[allow(clippy::expect_used)]
        let draft = level.drafts.last_mut().expect("level has an open node");

        let mut header = [0u8; ITEM_HEADER_SIZE];
        LittleEndian::write_u32(&mut header[0..4], key.len() as u32);
        LittleEndian::write_u32(&mut header[4..8], value.len() as u32);
        level.buf.extend_from_slice(&header);

        draft.buf_size += ITEM_HEADER_SIZE;
        draft.key_offs = draft.buf_size;
        draft.key_len = key.len();
        draft.value_offs = draft.key_offs + key.len();
        draft.value_len = value.len();

        level.buf.extend_from_slice(key);
        level.buf.extend_from_slice(value);
        draft.buf_size += key.len() + value.len();
        draft.entries += 1;

        if self.meta.height < lvl as u32 {
            self.meta.height = lvl as u32;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_util::memory_store;
    use test_log::test;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn empty_builder_yields_empty_tree() {
        let (_dir, store) = memory_store();
        let meta = Builder::new(&store).finish().unwrap();
        assert!(meta.is_empty());
        assert_eq!(0, meta.size);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn single_leaf_tree() {
        let (_dir, store) = memory_store();

        let mut builder = Builder::new(&store);
        for i in 0u64..8 {
            builder
                .append(&i.to_le_bytes(), &(i * 2).to_le_bytes())
                .unwrap();
        }
        let meta = builder.finish().unwrap();

        assert_eq!(1, meta.height);
        assert!(meta.size > 0);
        assert!(!meta.root.is_null());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn grows_interior_levels() {
        let (_dir, store) = memory_store();

        let mut builder = Builder::new(&store);
        for i in 0u64..100_000 {
            builder
                .append(&i.to_be_bytes(), &(2 * i + 1).to_le_bytes())
                .unwrap();
        }
        let meta = builder.finish().unwrap();

        assert!(meta.height >= 2, "height {}", meta.height);
        assert!(meta.height as usize <= MAX_HEIGHT);
    }
}
