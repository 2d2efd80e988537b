// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::ctree::MIN_FANOUT;
use crate::lsm::TieredPolicy;
use crate::wal::MAX_SEGMENT_SIZE;
use crate::Fs;
use std::path::PathBuf;
use std::time::Duration;

/// Store configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Path of the image file.
    pub(crate) path: PathBuf,

    /// Page size in bytes; power of two, at least one sector.
    pub(crate) page_size: u32,

    /// Checkpoint slot size in pages.
    pub(crate) check_size: u32,

    /// Minimum ctree node fanout.
    pub(crate) fanout: usize,

    /// LSM flush/merge thresholds.
    pub(crate) tuning: TieredPolicy,

    /// WAL segment capacity in bytes; page multiple.
    pub(crate) segment_size: usize,

    /// How often the flusher wakes to check thresholds.
    pub(crate) flusher_tick: Duration,

    /// Full commits happen at least this often.
    pub(crate) commit_interval: Duration,

    /// The log worker checkpoints after this many WAL bytes...
    pub(crate) checkpoint_pressure: u64,

    /// ...or after this much time, whichever comes first.
    pub(crate) checkpoint_interval: Duration,
}

impl Config {
    /// Creates a config for the image at `path` with default tuning.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            page_size: 4096,
            check_size: 1,
            fanout: MIN_FANOUT,
            tuning: TieredPolicy::default(),
            segment_size: MAX_SEGMENT_SIZE,
            flusher_tick: Duration::from_secs(1),
            commit_interval: Duration::from_secs(60),
            checkpoint_pressure: 1024 * 1024,
            checkpoint_interval: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn page_size(mut self, bytes: u32) -> Self {
        assert!(bytes.is_power_of_two() && bytes >= 512);
        self.page_size = bytes;
        self
    }

    #[must_use]
    pub fn fanout(mut self, fanout: usize) -> Self {
        assert!(fanout >= 2);
        self.fanout = fanout;
        self
    }

    #[must_use]
    pub fn memtable_size(mut self, bytes: u64) -> Self {
        self.tuning.memtable_size = bytes;
        self
    }

    #[must_use]
    pub fn tier0_size(mut self, bytes: u64) -> Self {
        self.tuning.tier0_size = bytes;
        self
    }

    #[must_use]
    pub fn segment_size(mut self, bytes: usize) -> Self {
        assert_eq!(0, bytes % self.page_size as usize);
        self.segment_size = bytes;
        self
    }

    #[must_use]
    pub fn flusher_tick(mut self, tick: Duration) -> Self {
        self.flusher_tick = tick;
        self
    }

    #[must_use]
    pub fn commit_interval(mut self, interval: Duration) -> Self {
        self.commit_interval = interval;
        self
    }

    /// Formats a fresh image at the configured path and mounts it.
    pub fn format(self) -> crate::Result<Fs> {
        Fs::format(self)
    }

    /// Mounts an existing image.
    pub fn open(self) -> crate::Result<Fs> {
        Fs::open(self)
    }
}
