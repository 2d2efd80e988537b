// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};

/// Represents errors that can occur in the store
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// A page run read from disk did not match its stored checksum
    /// (expected, got)
    ChecksumMismatch(u64, u64),

    /// On-disk structure is malformed beyond a simple checksum failure
    Corruption(&'static str),

    /// A flush was started while a previous flush is still draining
    Busy,

    /// The page allocator cannot reserve the requested range
    Full,

    /// The write-ahead log hit an I/O error earlier and refuses all
    /// further appends until the store is reopened
    WalPoisoned,

    /// The transaction's batch failed; the batch error was logged by the
    /// log worker
    Aborted,

    /// Neither checkpoint slot verified during mount
    Unrecoverable,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SiltError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Store result
pub type Result<T> = std::result::Result<T, Error>;
