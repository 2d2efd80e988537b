// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Block device abstraction.
//!
//! A [`Bio`] is a batch of byte-addressed, 512-aligned reads or writes
//! plus an optional sync, submitted to a [`BlockDevice`] and awaited
//! through a completion latch. The device may execute the batch in the
//! caller's thread (the default [`FileDevice`] does) or hand it to its
//! own submission queue; callers only rely on [`Bio::wait`].

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::{Condvar, Mutex};

/// Every buffer and offset in a bio must be aligned to this.
pub const BIO_ALIGN: u64 = 512;

/// Transfer direction of a [`Bio`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BioKind {
    Read,
    Write,
}

enum BioVec<'a> {
    Read { buf: &'a mut [u8], offs: u64 },
    Write { buf: &'a [u8], offs: u64 },
}

/// A vectored block I/O request.
///
/// Alignment of every buffer length and device offset to [`BIO_ALIGN`] is
/// a caller precondition, checked only in debug builds.
pub struct Bio<'a> {
    kind: BioKind,
    sync: bool,
    vec: Vec<BioVec<'a>>,

    done: Mutex<Option<i32>>,
    cv: Condvar,
}

impl<'a> Bio<'a> {
    #[must_use]
    pub fn new(kind: BioKind) -> Self {
        Self {
            kind,
            sync: false,
            vec: Vec::new(),
            done: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    /// Requests a device sync after the transfers complete.
    #[must_use]
    pub fn with_sync(mut self) -> Self {
        self.sync = true;
        self
    }

    #[must_use]
    pub fn kind(&self) -> BioKind {
        self.kind
    }

    /// Queues a read of `buf.len()` bytes at byte offset `offs`.
    pub fn add_read(&mut self, buf: &'a mut [u8], offs: u64) {
        debug_assert_eq!(BioKind::Read, self.kind);
        debug_assert_eq!(0, offs % BIO_ALIGN);
        debug_assert_eq!(0, buf.len() as u64 % BIO_ALIGN);
        self.vec.push(BioVec::Read { buf, offs });
    }

    /// Queues a write of `buf` at byte offset `offs`.
    pub fn add_write(&mut self, buf: &'a [u8], offs: u64) {
        debug_assert_eq!(BioKind::Write, self.kind);
        debug_assert_eq!(0, offs % BIO_ALIGN);
        debug_assert_eq!(0, buf.len() as u64 % BIO_ALIGN);
        self.vec.push(BioVec::Write { buf, offs });
    }

    /// Marks the bio complete; `err` is an OS error code, zero on success.
    ///
    /// Called exactly once, by the device.
    pub fn complete(&self, err: i32) {
        #[allow(clippy::expect_used)]
        let mut done = self.done.lock().expect("lock poisoned");
        debug_assert!(done.is_none(), "bio completed twice");
        *done = Some(err);
        self.cv.notify_all();
    }

    /// Blocks until the device completed the bio and returns the OS error
    /// code (zero on success).
    #[must_use]
    pub fn wait(&self) -> i32 {
        #[allow(clippy::expect_used)]
        let mut done = self.done.lock().expect("lock poisoned");
        while done.is_none() {
            #[allow(clippy::expect_used)]
            {
                done = self.cv.wait(done).expect("lock poisoned");
            }
        }
        done.unwrap_or(0)
    }
}

/// A handle to something that can execute [`Bio`]s.
pub trait BlockDevice: Send + Sync {
    /// Executes (or enqueues) the bio; completion is signalled through
    /// [`Bio::complete`].
    fn submit(&self, bio: &mut Bio<'_>);

    /// Device capacity in bytes.
    fn size(&self) -> std::io::Result<u64>;
}

/// The default device: a regular file driven with positional reads and
/// writes; the sync flag maps to `fsync`.
pub struct FileDevice {
    file: File,
}

impl FileDevice {
    /// Opens an existing image file.
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    /// Creates (or truncates) an image file.
    pub fn create<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file })
    }

    fn execute(&self, bio: &mut Bio<'_>) -> std::io::Result<()> {
        use std::os::unix::fs::FileExt;

        for vec in &mut bio.vec {
            match vec {
                BioVec::Read { buf, offs } => {
                    // Reads past the current end of file come back zeroed;
                    // freshly reserved pages have never been written.
                    let len = self.file.metadata()?.len();
                    if *offs >= len {
                        buf.fill(0);
                        continue;
                    }
                    let avail = (len - *offs).min(buf.len() as u64) as usize;
                    self.file.read_exact_at(&mut buf[..avail], *offs)?;
                    buf[avail..].fill(0);
                }
                BioVec::Write { buf, offs } => {
                    self.file.write_all_at(buf, *offs)?;
                }
            }
        }

        if bio.sync {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

/// Fallback OS error code for errors that do not carry one (EIO).
const EIO: i32 = 5;

impl BlockDevice for FileDevice {
    fn submit(&self, bio: &mut Bio<'_>) {
        let err = match self.execute(bio) {
            Ok(()) => 0,
            Err(e) => e.raw_os_error().unwrap_or(EIO),
        };
        bio.complete(err);
    }

    fn size(&self) -> std::io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn file_device_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let dev = FileDevice::create(dir.path().join("img")).unwrap();

        let data = vec![0xabu8; 1024];
        let mut bio = Bio::new(BioKind::Write).with_sync();
        bio.add_write(&data, 4096);
        dev.submit(&mut bio);
        assert_eq!(0, bio.wait());

        let mut back = vec![0u8; 1024];
        let mut bio = Bio::new(BioKind::Read);
        bio.add_read(&mut back, 4096);
        dev.submit(&mut bio);
        assert_eq!(0, bio.wait());

        assert_eq!(data, back);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn short_read_is_zero_filled() {
        let dir = tempfile::tempdir().unwrap();
        let dev = FileDevice::create(dir.path().join("img")).unwrap();

        let mut buf = vec![0xffu8; 512];
        let mut bio = Bio::new(BioKind::Read);
        bio.add_read(&mut buf, 1 << 20);
        dev.submit(&mut bio);

        assert_eq!(0, bio.wait());
        assert!(buf.iter().all(|b| *b == 0));
    }
}
