//! Error types for the cache server.
//!
//! Per spec.md §7, errors fall into five kinds: bad request, stale epoch,
//! transient no-lease, instance mismatch, and fatal (log/stable I/O
//! failure, or an internal invariant violation). The first four are
//! returned to the caller as ordinary values; the last is never
//! represented as a `CacheError` variant that a caller can recover
//! from -- invariant violations panic with a diagnostic (see
//! `diagnostics.rs`), matching DESIGN NOTES §9.

use thiserror::Error;

use crate::fp::Fingerprint;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("bad lookup arguments: {0}")]
    BadLookupArgs(String),

    #[error("bad add-entry arguments: {0}")]
    BadAddEntryArgs(String),

    #[error("too many names: {0} names exceeds index capacity")]
    TooManyNames(usize),

    #[error("duplicate names in request")]
    DuplicateNames,

    #[error("free-variable epoch mismatch: client epoch {client}, current epoch {current}")]
    FVMismatch { client: u32, current: u32 },

    #[error("no lease held for child CI {0}")]
    NoLease(u32),

    #[error("wrong cache instance: expected {expected:?}, got {got:?}")]
    WrongInstance {
        expected: Fingerprint,
        got: Fingerprint,
    },

    #[error("weeder already in progress")]
    WeederInProgress,

    #[error("deletion phase in progress, operation rejected: {0}")]
    DeletingInProgress(String),

    #[error("unknown primary key")]
    UnknownPK,

    #[error("checkpoint rejected: {0}")]
    BadCheckpoint(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("corruption detected: {0}")]
    Corruption(String),
}

impl From<bincode::error::EncodeError> for CacheError {
    fn from(e: bincode::error::EncodeError) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for CacheError {
    fn from(e: bincode::error::DecodeError) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
