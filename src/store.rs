// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::block::{Bio, BioKind, BlockDevice};
use crate::checksum::checksum;
use crate::ctree::node::Node;
use crate::ctree::Ptr;
use crate::PageAllocator;
use quick_cache::sync::Cache;
use std::sync::Arc;

/// How many decoded ctree nodes are kept in memory. Nodes are read-only,
/// so the cache never has to invalidate anything.
const NODE_CACHE_ITEMS: usize = 256;

/// The shared I/O context: the block device, the page geometry and the
/// page allocator, together with a read cache for ctree nodes.
///
/// Everything that touches the disk (builders, iterators, the WAL, the
/// checkpoint) goes through one of these.
pub struct Store {
    device: Box<dyn BlockDevice>,
    page_size: usize,
    fanout: usize,
    alloc: PageAllocator,
    nodes: Cache<u64, Arc<Node>>,
}

impl Store {
    #[must_use]
    pub fn new(device: Box<dyn BlockDevice>, page_size: usize, fanout: usize) -> Self {
        debug_assert!(page_size.is_power_of_two());

        Self {
            device,
            page_size,
            fanout,
            alloc: PageAllocator::default(),
            nodes: Cache::new(NODE_CACHE_ITEMS),
        }
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn fanout(&self) -> usize {
        self.fanout
    }

    #[must_use]
    pub fn allocator(&self) -> &PageAllocator {
        &self.alloc
    }

    #[must_use]
    pub fn device(&self) -> &dyn BlockDevice {
        &*self.device
    }

    /// Reserves `pages` contiguous pages.
    pub fn reserve(&self, pages: u64) -> crate::Result<u64> {
        self.alloc.reserve(pages)
    }

    fn io_result(err: i32) -> crate::Result<()> {
        if err == 0 {
            Ok(())
        } else {
            Err(crate::Error::Io(std::io::Error::from_raw_os_error(err)))
        }
    }

    /// Reads `buf.len()` bytes at byte offset `offs`.
    pub fn read(&self, buf: &mut [u8], offs: u64) -> crate::Result<()> {
        let mut bio = Bio::new(BioKind::Read);
        bio.add_read(buf, offs);
        self.device.submit(&mut bio);
        Self::io_result(bio.wait())
    }

    /// Writes `buf` at byte offset `offs`.
    pub fn write(&self, buf: &[u8], offs: u64) -> crate::Result<()> {
        let mut bio = Bio::new(BioKind::Write);
        bio.add_write(buf, offs);
        self.device.submit(&mut bio);
        Self::io_result(bio.wait())
    }

    /// Writes `buf` at byte offset `offs` and syncs the device.
    pub fn write_sync(&self, buf: &[u8], offs: u64) -> crate::Result<()> {
        let mut bio = Bio::new(BioKind::Write).with_sync();
        bio.add_write(buf, offs);
        self.device.submit(&mut bio);
        Self::io_result(bio.wait())
    }

    /// Flushes the device's volatile caches.
    pub fn sync(&self) -> crate::Result<()> {
        let mut bio = Bio::new(BioKind::Write).with_sync();
        self.device.submit(&mut bio);
        Self::io_result(bio.wait())
    }

    /// Reads and verifies the page run behind `ptr`, returning the raw
    /// bytes.
    pub fn read_pages(&self, ptr: &Ptr) -> crate::Result<Vec<u8>> {
        let bytes = (ptr.size as usize) * self.page_size;
        let mut buf = vec![0u8; bytes];
        self.read(&mut buf, ptr.offs * self.page_size as u64)?;

        let got = checksum(&buf);
        if got != ptr.csum {
            return Err(crate::Error::ChecksumMismatch(ptr.csum, got));
        }
        Ok(buf)
    }

    /// Reads a ctree node through the node cache.
    ///
    /// Page ranges are never reused by the allocator, so the page offset
    /// alone is a stable identity for the cached node.
    pub(crate) fn read_node(&self, ptr: &Ptr) -> crate::Result<Arc<Node>> {
        if let Some(node) = self.nodes.get(&ptr.offs) {
            return Ok(node);
        }

        let node = Arc::new(Node::decode(self.read_pages(ptr)?)?);
        self.nodes.insert(ptr.offs, node.clone());
        Ok(node)
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::block::FileDevice;
    use crate::ctree::MIN_FANOUT;

    /// A store over a throwaway image file; tests keep the tempdir alive.
    #[allow(clippy::unwrap_used)]
    pub fn memory_store() -> (tempfile::TempDir, Arc<Store>) {
        let dir = tempfile::tempdir().unwrap();
        let dev = FileDevice::create(dir.path().join("img")).unwrap();
        let store = Store::new(Box::new(dev), 4096, MIN_FANOUT);
        (dir, Arc::new(store))
    }
}
