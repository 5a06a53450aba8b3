use std::io;

use spacebox_cas::{FingerprintError, StoreError};
use thiserror::Error;

use crate::part::Part;

/// Errors that can occur while driving a multipart upload
#[derive(Error, Debug)]
pub enum MultipartError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("Invalid upload size: {0}")]
    InvalidSize(u64),

    #[error("Invalid range {start}..{end} for {size} bytes")]
    RangeError { start: u64, end: u64, size: u64 },

    #[error("Range {part} overlaps uploaded part {existing}")]
    Overlap { part: Part, existing: Part },

    #[error("Range {part} conflicts with in-flight part {inflight}")]
    UploadingConflict { part: Part, inflight: Part },

    #[error("Upload not fully received: {uploaded} of {size} bytes")]
    NotFullyUploaded { uploaded: u64, size: u64 },

    #[error("Fingerprint mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Part checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Upload task {0} has parts in flight")]
    Busy(String),

    #[error("Upload task not found: {0}")]
    TaskNotFound(String),
}

pub type Result<T> = std::result::Result<T, MultipartError>;
